//! Suspend/restore scenario: snapshot commit before state commit, the
//! compatibility pipeline, and byte-identical state round trips.

use crate::harness::{build_boot_image, spin_program, TestRig};
use engine::snapshot::SnapshotStore;
use engine_abi::{ErrorCode, LifecycleCmd, LifecycleState, ResumeMode};
use pretty_assertions::assert_eq;

#[test]
fn suspend_save_then_restore_resume_paused() {
    let rig = TestRig::new();
    rig.boot_stepped(&build_boot_image(&spin_program(), None));
    rig.advance(50);
    let saved_info = rig.engine.session_info().expect("info before suspend");

    let outcome = rig
        .engine
        .lifecycle(LifecycleCmd::SuspendSave { name: "t1".into() })
        .expect("suspend_save");
    assert_eq!(outcome.state, LifecycleState::Suspended);
    let snapshot_id = outcome.snapshot_id.expect("snapshot id");

    // The persisted record carries a valid sha256 and shows up in the index.
    let listing = rig.engine.snapshots_list().expect("list");
    let meta = listing
        .iter()
        .find(|m| m.snapshot_id == snapshot_id)
        .expect("snapshot indexed");
    assert_eq!(meta.sha256.len(), 64);
    assert!(meta.sha256.chars().all(|c| c.is_ascii_hexdigit()));

    let outcome = rig
        .engine
        .lifecycle(LifecycleCmd::RestoreResume {
            snapshot_id: snapshot_id.clone(),
            resume_mode: ResumeMode::Paused,
        })
        .expect("restore_resume");
    assert_eq!(outcome.state, LifecycleState::Paused);

    let info = rig.engine.session_info().expect("info after restore");
    assert_eq!(info.lifecycle_state, LifecycleState::Paused);
    assert_eq!(info.run_mode, "paused");
    assert_eq!(
        info.tick_counter, saved_info.tick_counter,
        "restored tick counter equals the saved value"
    );
    assert_eq!(info.cycle_counter, saved_info.cycle_counter);
}

/// Save, restore, save again: the two records' component state blocks are
/// identical modulo the header timestamps.
#[test]
fn snapshot_round_trip_is_byte_identical() {
    let rig = TestRig::new();
    rig.boot_stepped(&build_boot_image(&spin_program(), None));
    rig.advance(100);

    let first = rig
        .engine
        .lifecycle(LifecycleCmd::SuspendSave { name: "a".into() })
        .expect("first save")
        .snapshot_id
        .expect("id");
    rig.engine
        .lifecycle(LifecycleCmd::RestoreResume {
            snapshot_id: first.clone(),
            resume_mode: ResumeMode::Running,
        })
        .expect("restore");
    // Still single-step: no ticks can slip in between the two saves.
    let second = rig
        .engine
        .lifecycle(LifecycleCmd::SuspendSave { name: "b".into() })
        .expect("second save")
        .snapshot_id
        .expect("id");

    let store = SnapshotStore::new(rig.dir.path());
    let record_a = store.load(&first).expect("load a");
    let record_b = store.load(&second).expect("load b");
    assert_eq!(record_a.state, record_b.state);
    assert_eq!(record_a.counters, record_b.counters);
}

#[test]
fn restore_of_unknown_snapshot_is_not_found() {
    let rig = TestRig::new();
    rig.boot_stepped(&build_boot_image(&spin_program(), None));
    rig.engine
        .lifecycle(LifecycleCmd::SuspendSave { name: "t".into() })
        .expect("suspend");
    let err = rig
        .engine
        .lifecycle(LifecycleCmd::RestoreResume {
            snapshot_id: "snap-9999".into(),
            resume_mode: ResumeMode::Running,
        })
        .expect_err("missing snapshot");
    assert_eq!(err.code, ErrorCode::SnapshotNotFound);
}

#[test]
fn suspend_requires_running() {
    let rig = TestRig::new();
    rig.boot_stepped(&build_boot_image(&spin_program(), None));
    rig.engine
        .lifecycle(LifecycleCmd::Pause)
        .expect("pause first");
    let err = rig
        .engine
        .lifecycle(LifecycleCmd::SuspendSave { name: "x".into() })
        .expect_err("suspend from paused");
    assert_eq!(err.code, ErrorCode::InvalidSessionState);
    assert_eq!(err.details.guard_id, Some("G-SUSPEND-01"));
}
