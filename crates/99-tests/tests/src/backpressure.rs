//! Backpressure scenario: a saturated subscriber degrades its own stream,
//! never the emulation.

use crate::harness::{build_boot_image, spin_program, TestRig};
use std::sync::atomic::Ordering;

#[test]
fn saturated_video_subscriber_drops_oldest_and_throttles() {
    let rig = TestRig::new();
    // Tiny queue so saturation needs only a handful of frames.
    let video = rig
        .engine
        .subscribe_video_with_capacity(4)
        .expect("video subscription");
    rig.boot_stepped(&build_boot_image(&spin_program(), None));

    // ~12 frames of PAL video without draining the subscription.
    let ticks_before = rig.engine.session_info().expect("info").tick_counter;
    rig.advance(12 * 313 + 16);
    let ticks_after = rig.engine.session_info().expect("info").tick_counter;
    assert!(
        ticks_after - ticks_before >= 12 * 313,
        "the emulation task kept committing ticks while saturated"
    );

    let stats = video.stats();
    assert!(
        stats.dropped_events.load(Ordering::Relaxed) > 0,
        "oldest frames were dropped"
    );
    assert!(
        stats.overflow_events_total.load(Ordering::Relaxed) > 0,
        "overflows were counted"
    );
    assert!(
        stats.throttle_active.load(Ordering::Relaxed),
        "the stream entered throttle"
    );
    assert!(stats.high_watermark_depth.load(Ordering::Relaxed) >= 4);

    // Delivered events disclose the drops since the previous emission.
    let mut disclosed = false;
    let mut last_seq = None;
    while let Some(event) = video.try_next() {
        if let Some(previous) = last_seq {
            assert_eq!(event.event_seq, previous + 1, "drops never renumber");
        }
        last_seq = Some(event.event_seq);
        if event.dropped_events_since_last > 0 {
            disclosed = true;
        }
    }
    assert!(disclosed, "a delivered event carried dropped_events_since_last > 0");

    // The session itself never degraded.
    let info = rig.engine.session_info().expect("info");
    assert!(info.last_error.is_none());
}

#[test]
fn inverted_trace_filter_is_rejected() {
    let rig = TestRig::new();
    rig.boot_stepped(&build_boot_image(&spin_program(), None));
    let filter = engine_abi::BusTraceFilter {
        address_ranges: vec![(0x2000, 0x1000)],
        ..engine_abi::BusTraceFilter::default()
    };
    let err = rig
        .engine
        .subscribe_bus_trace(filter)
        .expect_err("inverted range");
    assert_eq!(err.code, engine_abi::ErrorCode::StreamFilterInvalid);
}

#[test]
fn slo_config_bounds_are_enforced_end_to_end() {
    let rig = TestRig::new();
    rig.boot_stepped(&build_boot_image(&spin_program(), None));
    let err = rig
        .engine
        .configure_slo(engine_abi::SloConfig {
            sampling_interval_ms: 50,
            window_ms: 5_000,
        })
        .expect_err("interval below bound");
    assert_eq!(err.code, engine_abi::ErrorCode::MalformedRequest);
    rig.engine
        .configure_slo(engine_abi::SloConfig {
            sampling_interval_ms: 100,
            window_ms: 1_000,
        })
        .expect("valid config");
}
