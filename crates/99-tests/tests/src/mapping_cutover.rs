//! Mapping CRUD, revision bumps, and cutover-atomic apply.

use crate::harness::{build_boot_image, spin_program, TestRig};
use engine_abi::{ErrorCode, HostDeviceType, HostEventKey, MappingEntry, VirtualTarget};
use input_bridge::ApplyResult;

fn key_entry(code: &str, scancode: u8) -> MappingEntry {
    MappingEntry {
        host: HostEventKey {
            device_type: HostDeviceType::Keyboard,
            code: code.to_owned(),
            modifiers: None,
        },
        target: VirtualTarget::IkbdKey(scancode),
        value: 1,
        phase: None,
    }
}

#[test]
fn patch_bumps_revision_and_stale_apply_conflicts() {
    let rig = TestRig::new();
    rig.boot_stepped(&build_boot_image(&spin_program(), None));

    let created = rig
        .engine
        .mapping_create(
            "atari_st",
            "st_520_pal",
            "atari_st_default_v1",
            vec![key_entry("KeyA", 0x1E), key_entry("KeyB", 0x30)],
        )
        .expect("create");
    assert_eq!(created.revision, 1);

    let applied = rig
        .engine
        .mapping_apply("browser-1", "atari_st", "atari_st_default_v1", 1)
        .expect("first apply");
    assert_eq!(applied.result, ApplyResult::Applied);
    let first_cutover = applied.cutover_tick;

    // Alter one entry: the revision moves forward.
    let updated = rig
        .engine
        .mapping_update(
            "atari_st",
            "atari_st_default_v1",
            vec![key_entry("KeyA", 0x1E), key_entry("KeyB", 0x31)],
        )
        .expect("patch");
    assert_eq!(updated.revision, 2, "revision_after is the bumped value");

    // Stale expected_revision conflicts.
    let err = rig
        .engine
        .mapping_apply("browser-1", "atari_st", "atari_st_default_v1", 1)
        .expect_err("stale apply");
    assert_eq!(err.code, ErrorCode::Conflict);
    assert!(err.retryable, "conflicts are retryable after refresh");

    // Fresh expected_revision applies with a monotonic cutover tick.
    rig.advance(16);
    let applied = rig
        .engine
        .mapping_apply("browser-1", "atari_st", "atari_st_default_v1", 2)
        .expect("fresh apply");
    assert_eq!(applied.result, ApplyResult::Applied);
    assert!(applied.cutover_tick >= first_cutover);
}

#[test]
fn reapplying_the_active_revision_is_noop() {
    let rig = TestRig::new();
    rig.boot_stepped(&build_boot_image(&spin_program(), None));
    rig.engine
        .mapping_create("atari_st", "st_520_pal", "default", vec![key_entry("KeyA", 0x1E)])
        .expect("create");
    let first = rig
        .engine
        .mapping_apply("b", "atari_st", "default", 1)
        .expect("apply");
    assert_eq!(first.result, ApplyResult::Applied);
    let again = rig
        .engine
        .mapping_apply("b", "atari_st", "default", 1)
        .expect("re-apply");
    assert_eq!(again.result, ApplyResult::NoOp);
    assert_eq!(again.revision, 1, "no_op never bumps the revision");
}

#[test]
fn noop_update_keeps_revision() {
    let rig = TestRig::new();
    rig.boot_stepped(&build_boot_image(&spin_program(), None));
    rig.engine
        .mapping_create("atari_st", "st_520_pal", "default", vec![key_entry("KeyA", 0x1E)])
        .expect("create");
    let updated = rig
        .engine
        .mapping_update("atari_st", "default", vec![key_entry("KeyA", 0x1E)])
        .expect("identical update");
    assert_eq!(updated.revision, 1);
}

#[test]
fn apply_of_unknown_profile_is_not_found() {
    let rig = TestRig::new();
    rig.boot_stepped(&build_boot_image(&spin_program(), None));
    let err = rig
        .engine
        .mapping_apply("b", "atari_st", "ghost", 1)
        .expect_err("unknown profile");
    assert_eq!(err.code, ErrorCode::MappingNotFound);
}
