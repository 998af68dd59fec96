//! Engine status/health publisher with per-event delivery disclosure.

use crate::publisher::{Publisher, PublishOutcome, Subscription, DEFAULT_QUEUE_CAPACITY};
use engine_abi::{DeliveryInfo, DeliveryReason, EngineStatusEvent, EventStamp};
use std::sync::atomic::Ordering;

pub struct StatusPublisher {
    inner: Publisher<EngineStatusEvent>,
    last_dropped_total: u64,
    coalesced_updates: u64,
}

impl StatusPublisher {
    pub fn channel() -> (StatusPublisher, Subscription<EngineStatusEvent>) {
        let (inner, subscription) = Publisher::channel(DEFAULT_QUEUE_CAPACITY);
        (
            StatusPublisher {
                inner,
                last_dropped_total: 0,
                coalesced_updates: 0,
            },
            subscription,
        )
    }

    /// Publishes a status event, filling in the delivery object from the
    /// publisher's own counters.
    pub fn publish_status(
        &mut self,
        stamp: EventStamp,
        state: &str,
        severity: &str,
        error_code: Option<String>,
    ) -> PublishOutcome {
        let stats = self.inner.stats();
        let dropped_total = stats.dropped_events.load(Ordering::Relaxed);
        let dropped_since = dropped_total - self.last_dropped_total;
        self.last_dropped_total = dropped_total;
        let throttle_active = stats.throttle_active.load(Ordering::Relaxed);
        let degraded = dropped_since > 0 || throttle_active;
        let delivery = DeliveryInfo {
            degraded,
            reason: if degraded {
                DeliveryReason::QueueOverflow
            } else {
                DeliveryReason::None
            },
            dropped_events_since_last: dropped_since,
            coalesced_updates: self.coalesced_updates,
            throttle_active,
        };
        self.coalesced_updates = 0;
        self.inner.publish(
            stamp,
            EngineStatusEvent {
                state: state.to_owned(),
                severity: severity.to_owned(),
                error_code,
                delivery,
            },
        )
    }

    /// Records an update swallowed by coalescing, disclosed on the next event.
    pub fn note_coalesced(&mut self) {
        self.coalesced_updates += 1;
    }
}
