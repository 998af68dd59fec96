//! Capture policy scenarios and translated-event sequencing.

use crate::harness::{build_boot_image, spin_program, TestRig};
use engine_abi::{
    HostDeviceType, HostEvent, HostEventKey, MappingEntry, Phase, PolicyHook, PolicySource,
    PolicyState, TransitionResult, VirtualTarget,
};

fn captured_rig() -> TestRig {
    let rig = TestRig::new();
    rig.boot_stepped(&build_boot_image(&spin_program(), None));
    rig.engine
        .policy_set_enabled("browser-1", true)
        .expect("enable input");
    let event = rig
        .engine
        .policy_hook("browser-1", PolicyHook::CanvasClick)
        .expect("acquire");
    assert_eq!(event.state, PolicyState::EnabledCaptured);
    rig
}

/// Escape sequence within the timeout releases capture via system_guard;
/// the same sequence while idle is an accepted no-op.
#[test]
fn escape_sequence_release_and_idle_noop() {
    let rig = captured_rig();
    let policy_events = rig
        .engine
        .subscribe_policy_events()
        .expect("policy stream");

    rig.engine
        .policy_hook(
            "browser-1",
            PolicyHook::EscapeKey {
                code: "Escape".into(),
                at_us: 100_000,
            },
        )
        .expect("first escape");
    let released = rig
        .engine
        .policy_hook(
            "browser-1",
            PolicyHook::EscapeKey {
                code: "Escape".into(),
                at_us: 400_000,
            },
        )
        .expect("second escape");
    assert_eq!(released.state, PolicyState::EnabledIdle);
    assert_eq!(released.source, PolicySource::SystemGuard);
    assert_eq!(released.reason, "escape_sequence");
    assert_eq!(released.transition_result, TransitionResult::Applied);

    // The identical sequence while idle yields no state change.
    for at_us in [500_000u64, 520_000] {
        let event = rig
            .engine
            .policy_hook(
                "browser-1",
                PolicyHook::EscapeKey {
                    code: "Escape".into(),
                    at_us,
                },
            )
            .expect("idle escape");
        assert_eq!(event.transition_result, TransitionResult::NoOp);
        assert_eq!(event.state, PolicyState::EnabledIdle);
    }

    // Every accepted request emitted an event with consecutive seq.
    let mut seqs = Vec::new();
    while let Some(event) = policy_events.try_next() {
        seqs.push(event.event_seq);
    }
    assert_eq!(seqs.len(), 4, "two escapes + two idle no-ops");
    for pair in seqs.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }
}

/// Idempotent enable: already-enabled input answers no_op yet still emits
/// a policy-change event with the next sequence number.
#[test]
fn enable_twice_is_noop_with_event() {
    let rig = TestRig::new();
    rig.boot_stepped(&build_boot_image(&spin_program(), None));
    let policy_events = rig
        .engine
        .subscribe_policy_events()
        .expect("policy stream");
    let first = rig
        .engine
        .policy_set_enabled("browser-1", true)
        .expect("enable");
    assert_eq!(first.transition_result, TransitionResult::Applied);
    let second = rig
        .engine
        .policy_set_enabled("browser-1", true)
        .expect("enable again");
    assert_eq!(second.transition_result, TransitionResult::NoOp);
    assert_eq!(second.state, PolicyState::EnabledIdle);

    let a = policy_events.try_next().expect("first event");
    let b = policy_events.try_next().expect("second event");
    assert_eq!(b.event_seq, a.event_seq + 1, "no-ops still allocate seq");
}

/// Translated events flow only while capture is active, with strict
/// per-connection sequencing.
#[test]
fn key_events_translate_and_sequence() {
    let rig = captured_rig();
    let input_events = rig.engine.subscribe_input_events().expect("input stream");
    rig.engine
        .mapping_create(
            "atari_st",
            "st_520_pal",
            "default",
            vec![MappingEntry {
                host: HostEventKey {
                    device_type: HostDeviceType::Keyboard,
                    code: "KeyA".into(),
                    modifiers: None,
                },
                target: VirtualTarget::IkbdKey(0x1E),
                value: 1,
                phase: None,
            }],
        )
        .expect("create mapping");
    rig.engine
        .mapping_apply("browser-1", "atari_st", "default", 1)
        .expect("apply mapping");

    let down = rig
        .engine
        .inject_host_event(
            "browser-1",
            HostEvent::Key {
                code: "KeyA".into(),
                modifiers: None,
                pressed: true,
            },
        )
        .expect("inject down");
    assert_eq!(down.translated, 1);
    assert!(down.capture_active);
    let up = rig
        .engine
        .inject_host_event(
            "browser-1",
            HostEvent::Key {
                code: "KeyA".into(),
                modifiers: None,
                pressed: false,
            },
        )
        .expect("inject up");
    assert_eq!(up.translated, 1);

    let first = input_events.try_next().expect("down event");
    let second = input_events.try_next().expect("up event");
    assert_eq!(first.event_seq, 1);
    assert_eq!(second.event_seq, 2);
    assert_eq!(first.payload.target, VirtualTarget::IkbdKey(0x1E));
    assert_eq!(first.payload.phase, Phase::Down);
    assert_eq!(second.payload.phase, Phase::Up);
    assert!(second.stamp.timestamp_us >= first.stamp.timestamp_us);

    // No sequencing violations were recorded for a clean stream.
    let diagnostics = rig.engine.input_diagnostics().expect("diagnostics");
    assert_eq!(diagnostics.sequencing_violations, 0);
}

/// Events injected without capture never translate or allocate sequence
/// numbers; unmapped events count as dropped on diagnostics.
#[test]
fn uncaptured_and_unmapped_events_do_not_emit() {
    let rig = TestRig::new();
    rig.boot_stepped(&build_boot_image(&spin_program(), None));
    let input_events = rig.engine.subscribe_input_events().expect("input stream");

    // Input disabled: suppressed, not an error.
    let outcome = rig
        .engine
        .inject_host_event(
            "browser-1",
            HostEvent::Key {
                code: "KeyA".into(),
                modifiers: None,
                pressed: true,
            },
        )
        .expect("inject while disabled");
    assert_eq!(outcome.translated, 0);
    assert!(!outcome.capture_active);

    // Captured but with no mapping applied: dropped on diagnostics.
    rig.engine
        .policy_set_enabled("browser-1", true)
        .expect("enable");
    rig.engine
        .policy_hook("browser-1", PolicyHook::CanvasClick)
        .expect("capture");
    let outcome = rig
        .engine
        .inject_host_event(
            "browser-1",
            HostEvent::Key {
                code: "KeyA".into(),
                modifiers: None,
                pressed: true,
            },
        )
        .expect("inject unmapped");
    assert_eq!(outcome.translated, 0);
    assert!(input_events.try_next().is_none(), "no seq was allocated");
    let diagnostics = rig.engine.input_diagnostics().expect("diagnostics");
    assert!(diagnostics.dropped_events >= 1);
}

/// Focus loss releases click-to-capture; focus regain never re-acquires.
#[test]
fn focus_loss_releases_capture() {
    let rig = captured_rig();
    let released = rig
        .engine
        .policy_hook("browser-1", PolicyHook::FocusLost)
        .expect("focus lost");
    assert_eq!(released.state, PolicyState::EnabledIdle);
    assert_eq!(released.source, PolicySource::SystemGuard);
    let regained = rig
        .engine
        .policy_hook("browser-1", PolicyHook::FocusGained)
        .expect("focus regained");
    assert_eq!(regained.transition_result, TransitionResult::NoOp);
    assert_eq!(regained.state, PolicyState::EnabledIdle);
}
