//! Single-writer bounded publisher with drop-oldest overflow.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use engine_abi::{EventStamp, StreamEvent};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Default bounded queue capacity per subscription.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Shared counters readable from both sides of the queue without locking.
#[derive(Debug, Default)]
pub struct PublisherStats {
    pub dropped_events: AtomicU64,
    pub overflow_events_total: AtomicU64,
    pub throttle_transitions_total: AtomicU64,
    pub high_watermark_depth: AtomicUsize,
    pub throttle_active: AtomicBool,
}

impl PublisherStats {
    fn observe_depth(&self, depth: usize) {
        self.high_watermark_depth.fetch_max(depth, Ordering::Relaxed);
    }
}

/// Outcome of one publish call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered,
    /// Delivered after evicting the oldest queued events.
    DeliveredAfterDrop { dropped: u64 },
}

/// Transport-side reader handle.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: Receiver<StreamEvent<T>>,
    stats: Arc<PublisherStats>,
}

impl<T> Subscription<T> {
    /// Non-blocking pop; `None` when the queue is empty.
    pub fn try_next(&self) -> Option<StreamEvent<T>> {
        self.rx.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> &PublisherStats {
        &self.stats
    }
}

/// The single-writer end of one subscription's queue.
///
/// `event_seq` starts at 1 and increments by exactly one per emitted
/// event; drops never renumber previously emitted events. Timestamps are
/// clamped monotonic so a consumer never observes a regression.
#[derive(Debug)]
pub struct Publisher<T> {
    tx: Sender<StreamEvent<T>>,
    /// Writer-side receiver clone used to evict the oldest event.
    evict: Receiver<StreamEvent<T>>,
    stats: Arc<PublisherStats>,
    capacity: usize,
    next_seq: u64,
    last_timestamp_us: u64,
    dropped_since_last: u64,
}

impl<T> Publisher<T> {
    /// Creates a publisher/subscription pair with the given capacity.
    pub fn channel(capacity: usize) -> (Publisher<T>, Subscription<T>) {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        let stats = Arc::new(PublisherStats::default());
        let publisher = Publisher {
            tx,
            evict: rx.clone(),
            stats: Arc::clone(&stats),
            capacity,
            next_seq: 1,
            last_timestamp_us: 0,
            dropped_since_last: 0,
        };
        let subscription = Subscription { rx, stats };
        (publisher, subscription)
    }

    pub fn stats(&self) -> &Arc<PublisherStats> {
        &self.stats
    }

    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    /// Emits one event, evicting the oldest queued events on overflow.
    pub fn publish(&mut self, stamp: EventStamp, payload: T) -> PublishOutcome {
        let mut stamp = stamp;
        if stamp.timestamp_us < self.last_timestamp_us {
            stamp.timestamp_us = self.last_timestamp_us;
        }
        self.last_timestamp_us = stamp.timestamp_us;

        let event = StreamEvent {
            event_seq: self.next_seq,
            stamp,
            dropped_events_since_last: self.dropped_since_last,
            payload,
        };
        self.next_seq += 1;
        self.dropped_since_last = 0;

        let mut dropped_now = 0u64;
        let mut event = event;
        loop {
            match self.tx.try_send(event) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    event = back;
                    match self.evict.try_recv() {
                        Ok(_oldest) => {
                            dropped_now += 1;
                            self.stats.dropped_events.fetch_add(1, Ordering::Relaxed);
                            self.stats
                                .overflow_events_total
                                .fetch_add(1, Ordering::Relaxed);
                        }
                        // Reader drained concurrently; retry the send.
                        Err(TryRecvError::Empty) => {}
                        Err(TryRecvError::Disconnected) => break,
                    }
                }
                Err(TrySendError::Disconnected(_)) => break,
            }
        }

        let depth = self.tx.len();
        self.stats.observe_depth(depth);
        if dropped_now > 0 {
            self.dropped_since_last += dropped_now;
            self.enter_throttle();
            return PublishOutcome::DeliveredAfterDrop {
                dropped: dropped_now,
            };
        }
        if self.stats.throttle_active.load(Ordering::Relaxed) && depth <= self.capacity / 2 {
            self.leave_throttle();
        }
        PublishOutcome::Delivered
    }

    fn enter_throttle(&self) {
        if !self.stats.throttle_active.swap(true, Ordering::Relaxed) {
            self.stats
                .throttle_transitions_total
                .fetch_add(1, Ordering::Relaxed);
            log::debug!("publisher entered throttle at depth {}", self.capacity);
        }
    }

    fn leave_throttle(&self) {
        if self.stats.throttle_active.swap(false, Ordering::Relaxed) {
            self.stats
                .throttle_transitions_total
                .fetch_add(1, Ordering::Relaxed);
            log::debug!("publisher left throttle");
        }
    }
}
