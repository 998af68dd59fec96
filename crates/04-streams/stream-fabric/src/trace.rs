//! Bus and memory trace publishers with all-of filter matching.

use crate::publisher::{Publisher, PublishOutcome, Subscription, DEFAULT_QUEUE_CAPACITY};
use engine_abi::{
    BusTraceEvent, BusTraceFilter, EngineError, ErrorCode, ErrorDetails, EventStamp,
    MemoryTraceEvent, MemoryTraceFilter,
};

#[derive(Debug)]
pub struct BusTracePublisher {
    inner: Publisher<BusTraceEvent>,
    filter: BusTraceFilter,
}

impl BusTracePublisher {
    pub fn channel(
        filter: BusTraceFilter,
    ) -> Result<(BusTracePublisher, Subscription<BusTraceEvent>), EngineError> {
        validate(filter.validate())?;
        let (inner, subscription) = Publisher::channel(DEFAULT_QUEUE_CAPACITY);
        Ok((BusTracePublisher { inner, filter }, subscription))
    }

    pub fn set_filter(&mut self, filter: BusTraceFilter) -> Result<(), EngineError> {
        validate(filter.validate())?;
        self.filter = filter;
        Ok(())
    }

    /// Offers one transaction; admitted only if every populated filter
    /// field matches.
    pub fn offer(&mut self, stamp: EventStamp, event: BusTraceEvent) -> Option<PublishOutcome> {
        if !self.filter.matches(&event) {
            return None;
        }
        Some(self.inner.publish(stamp, event))
    }
}

#[derive(Debug)]
pub struct MemoryTracePublisher {
    inner: Publisher<MemoryTraceEvent>,
    filter: MemoryTraceFilter,
}

impl MemoryTracePublisher {
    pub fn channel(
        filter: MemoryTraceFilter,
    ) -> Result<(MemoryTracePublisher, Subscription<MemoryTraceEvent>), EngineError> {
        validate(filter.validate())?;
        let (inner, subscription) = Publisher::channel(DEFAULT_QUEUE_CAPACITY);
        Ok((MemoryTracePublisher { inner, filter }, subscription))
    }

    pub fn set_filter(&mut self, filter: MemoryTraceFilter) -> Result<(), EngineError> {
        validate(filter.validate())?;
        self.filter = filter;
        Ok(())
    }

    pub fn offer(&mut self, stamp: EventStamp, event: MemoryTraceEvent) -> Option<PublishOutcome> {
        if !self.filter.matches(&event) {
            return None;
        }
        Some(self.inner.publish(stamp, event))
    }
}

fn validate(result: Result<(), String>) -> Result<(), EngineError> {
    result.map_err(|message| {
        EngineError::new(ErrorCode::StreamFilterInvalid, message)
            .with_details(ErrorDetails::default().with("field", "address_ranges"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_abi::{AccessType, ComponentKey};

    fn event(addr: u32, access: AccessType) -> BusTraceEvent {
        BusTraceEvent {
            addr,
            access,
            size_bytes: 2,
            value: 0xBEEF,
            component: ComponentKey::Cpu,
            level: 0,
            tick: 0,
            cycle: 0,
        }
    }

    #[test]
    fn inverted_range_is_rejected() {
        let filter = BusTraceFilter {
            address_ranges: vec![(0x2000, 0x1000)],
            ..BusTraceFilter::default()
        };
        let err = BusTracePublisher::channel(filter).expect_err("inverted");
        assert_eq!(err.code, ErrorCode::StreamFilterInvalid);
    }

    #[test]
    fn all_populated_fields_must_match() {
        let filter = BusTraceFilter {
            address_ranges: vec![(0xFF_FA00, 0xFF_FA2F)],
            access_types: vec![AccessType::Write],
            ..BusTraceFilter::default()
        };
        let (mut publisher, subscription) = BusTracePublisher::channel(filter).expect("filter");
        assert!(publisher
            .offer(EventStamp::default(), event(0xFF_FA07, AccessType::Write))
            .is_some());
        assert!(publisher
            .offer(EventStamp::default(), event(0xFF_FA07, AccessType::Read))
            .is_none());
        assert!(publisher
            .offer(EventStamp::default(), event(0x1000, AccessType::Write))
            .is_none());
        assert_eq!(subscription.len(), 1);
    }

    #[test]
    fn memory_filter_adds_region_matching() {
        let filter = MemoryTraceFilter {
            regions: vec!["ram".into()],
            ..MemoryTraceFilter::default()
        };
        let (mut publisher, _subscription) = MemoryTracePublisher::channel(filter).expect("filter");
        let admitted = publisher.offer(
            EventStamp::default(),
            MemoryTraceEvent {
                addr: 0x100,
                access: AccessType::Read,
                size_bytes: 1,
                value: 0,
                component: ComponentKey::Cpu,
                level: 0,
                region: "ram".into(),
                mapped_target: "ram".into(),
                tick: 0,
                cycle: 0,
            },
        );
        assert!(admitted.is_some());
        let rejected = publisher.offer(
            EventStamp::default(),
            MemoryTraceEvent {
                addr: 0xFC_0000,
                access: AccessType::Read,
                size_bytes: 1,
                value: 0,
                component: ComponentKey::Cpu,
                level: 0,
                region: "tos_rom".into(),
                mapped_target: "tos_rom".into(),
                tick: 0,
                cycle: 0,
            },
        );
        assert!(rejected.is_none());
    }
}
