//! Register diff publisher with selector filtering.

use crate::publisher::{Publisher, PublishOutcome, Subscription, DEFAULT_QUEUE_CAPACITY};
use engine_abi::{DiffMode, EventStamp, RegisterDiffEvent, RegisterSelector};

pub struct RegisterDiffPublisher {
    inner: Publisher<RegisterDiffEvent>,
    selector: RegisterSelector,
    mode: DiffMode,
    /// Interval mode coalesces; the latest event per register wins.
    interval_buffer: Vec<RegisterDiffEvent>,
}

impl RegisterDiffPublisher {
    pub fn channel(
        selector: RegisterSelector,
        mode: DiffMode,
    ) -> (RegisterDiffPublisher, Subscription<RegisterDiffEvent>) {
        let (inner, subscription) = Publisher::channel(DEFAULT_QUEUE_CAPACITY);
        (
            RegisterDiffPublisher {
                inner,
                selector,
                mode,
                interval_buffer: Vec::new(),
            },
            subscription,
        )
    }

    pub fn selector(&self) -> &RegisterSelector {
        &self.selector
    }

    pub fn set_selector(&mut self, selector: RegisterSelector) {
        self.selector = selector;
    }

    /// Offers one observed mutation; returns whether it was admitted.
    pub fn offer(&mut self, stamp: EventStamp, event: RegisterDiffEvent) -> Option<PublishOutcome> {
        if !self.selector.matches(&event) {
            return None;
        }
        match self.mode {
            DiffMode::Event => Some(self.inner.publish(stamp, event)),
            DiffMode::Interval => {
                if let Some(slot) = self
                    .interval_buffer
                    .iter_mut()
                    .find(|e| e.component == event.component && e.register == event.register)
                {
                    // Keep the earliest old_value so the interval diff spans
                    // the whole window.
                    let old_value = slot.old_value;
                    *slot = event;
                    slot.old_value = old_value;
                } else {
                    self.interval_buffer.push(event);
                }
                None
            }
        }
    }

    /// Flushes the interval buffer; a no-op in event mode.
    pub fn flush_interval(&mut self, stamp: EventStamp) -> usize {
        let drained: Vec<_> = self.interval_buffer.drain(..).collect();
        let count = drained.len();
        for event in drained {
            if self.selector.changed_only && event.old_value == event.new_value {
                continue;
            }
            self.inner.publish(stamp, event);
        }
        count
    }
}
