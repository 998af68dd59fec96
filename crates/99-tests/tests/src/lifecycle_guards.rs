//! Lifecycle guard matrix driven through the public command surface.

use crate::harness::{build_boot_image, spin_program, TestRig};
use engine_abi::{ErrorCode, LifecycleCmd, LifecycleState, ResumeMode};

#[test]
fn commands_before_start_are_engine_not_running() {
    let rig = TestRig::new();
    let err = rig
        .engine
        .lifecycle(LifecycleCmd::Pause)
        .expect_err("no session");
    assert_eq!(err.code, ErrorCode::EngineNotRunning);
    let err = rig.engine.session_info().expect_err("no session");
    assert_eq!(err.code, ErrorCode::EngineNotRunning);
}

#[test]
fn duplicate_start_is_already_running() {
    let rig = TestRig::new();
    rig.boot(&build_boot_image(&spin_program(), None));
    let err = rig
        .engine
        .start("atari_st", "st_520_pal", Some("rom.tos.1.04.uk"))
        .expect_err("duplicate start");
    assert_eq!(err.code, ErrorCode::EngineAlreadyRunning);
    assert_eq!(err.details.guard_id, Some("G-START-01"));
}

#[test]
fn unknown_profile_is_rejected_with_guard() {
    let rig = TestRig::new();
    let err = rig
        .engine
        .start("atari_st", "mega_ste", None)
        .expect_err("unknown profile");
    assert_eq!(err.code, ErrorCode::MachineProfileNotFound);
    assert_eq!(err.details.guard_id, Some("G-START-02"));
}

#[test]
fn pause_resume_reset_cycle() {
    let rig = TestRig::new();
    rig.boot_stepped(&build_boot_image(&spin_program(), None));

    let paused = rig.engine.lifecycle(LifecycleCmd::Pause).expect("pause");
    assert_eq!(paused.state, LifecycleState::Paused);
    assert_eq!(
        rig.engine.session_info().expect("info").run_mode,
        "paused",
        "paused overrides the clock mode in run_mode"
    );

    let err = rig
        .engine
        .lifecycle(LifecycleCmd::Pause)
        .expect_err("double pause");
    assert_eq!(err.code, ErrorCode::InvalidSessionState);
    assert_eq!(err.details.guard_id, Some("G-PAUSE-01"));

    let resumed = rig
        .engine
        .lifecycle(LifecycleCmd::Resume {
            target: ResumeMode::Running,
        })
        .expect("resume");
    assert_eq!(resumed.state, LifecycleState::Running);

    let reset = rig.engine.lifecycle(LifecycleCmd::Reset).expect("reset");
    assert_eq!(reset.state, LifecycleState::Running);

    let stopped = rig.engine.stop().expect("stop");
    assert_eq!(stopped.state, LifecycleState::Stopped);
    assert!(stopped.session_id.is_none(), "stop destroys the session");
}

#[test]
fn stop_is_valid_from_suspended() {
    let rig = TestRig::new();
    rig.boot_stepped(&build_boot_image(&spin_program(), None));
    rig.engine
        .lifecycle(LifecycleCmd::SuspendSave { name: "s".into() })
        .expect("suspend");
    let stopped = rig.engine.stop().expect("stop from suspended");
    assert_eq!(stopped.state, LifecycleState::Stopped);
}

#[test]
fn restart_after_stop_gets_a_fresh_session() {
    let rig = TestRig::new();
    rig.boot_stepped(&build_boot_image(&spin_program(), None));
    let first = rig.engine.session_info().expect("info").session_id;
    rig.engine.stop().expect("stop");
    // The boot image was consumed by the first start; attach again.
    rig.boot(&build_boot_image(&spin_program(), None));
    let second = rig.engine.session_info().expect("info").session_id;
    assert_ne!(first, second);
}

#[test]
fn reset_preserves_monotonic_counters() {
    let rig = TestRig::new();
    rig.boot_stepped(&build_boot_image(&spin_program(), None));
    rig.advance(64);
    let before = rig.engine.session_info().expect("info").tick_counter;
    rig.engine.lifecycle(LifecycleCmd::Reset).expect("reset");
    let after = rig.engine.session_info().expect("info").tick_counter;
    assert!(after >= before, "reset never rewinds the tick counter");
}
