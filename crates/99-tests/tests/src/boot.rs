//! Boot scenarios: sustained execution, VBL cadence, clean bus, and the
//! synthesized ROM-less reset path.

use crate::harness::{spin_program, TestRig};
use engine::snapshot::SnapshotStore;
use engine::InspectReply;
use engine_abi::{ClockMode, InspectCmd, LifecycleCmd, ResumeMode};
use machine_core::RAM_BOOT_PC;

/// Eight simulated seconds at 8 MHz with a clean bus and live video.
#[test]
fn boot_image_runs_eight_simulated_seconds() {
    let rig = TestRig::new();
    let video = rig.engine.subscribe_video().expect("video subscription");
    rig.boot_stepped(&crate::harness::build_boot_image(&spin_program(), None));

    // 64M cycles at ~512 cycles per tick.
    rig.advance(126_000);

    let info = rig.engine.session_info().expect("session info");
    assert!(
        info.cycle_counter >= 64_000_000,
        "cycle counter {} below the 8-second budget",
        info.cycle_counter
    );
    assert!(info.tick_counter >= 125_000);
    assert!(info.last_error.is_none());

    // At least one VBL fired: frames made it to the publisher.
    let mut frames = 0;
    let mut last_seq = 0;
    let mut last_timestamp = 0;
    while let Some(event) = video.try_next() {
        if frames == 0 {
            assert!(event.event_seq >= 1);
        } else {
            assert_eq!(event.event_seq, last_seq + 1, "event_seq increments by 1");
        }
        assert!(
            event.stamp.timestamp_us >= last_timestamp,
            "timestamps never regress"
        );
        last_seq = event.event_seq;
        last_timestamp = event.stamp.timestamp_us;
        assert_eq!(event.payload.meta.width, 320);
        assert_eq!(event.payload.meta.height, 200);
        assert_eq!(
            event.payload.meta.payload_bytes,
            event.payload.data.len(),
            "metadata byte length is exact"
        );
        frames += 1;
    }
    assert!(frames >= 1, "at least one VBL must have produced a frame");

    match rig.engine.inspect(InspectCmd::BusStatus).expect("bus status") {
        InspectReply::Bus { bus_errors, .. } => {
            assert_eq!(bus_errors, 0, "boot image must not touch unmapped space");
        }
        other => panic!("unexpected inspect reply {other:?}"),
    }
}

/// Tick and cycle counters are monotonic across step requests.
#[test]
fn counters_are_monotonic_across_steps() {
    let rig = TestRig::new();
    rig.boot_stepped(&crate::harness::build_boot_image(&spin_program(), None));
    let mut last_tick = 0;
    let mut last_cycle = 0;
    for _ in 0..8 {
        let outcome = rig.engine.step(64).expect("step");
        assert_eq!(outcome.tick_after - outcome.tick_before, 64);
        assert!(outcome.tick_before >= last_tick);
        assert!(outcome.cycle_after >= last_cycle);
        assert!(outcome.cycle_after > outcome.cycle_before);
        assert_eq!(outcome.capture_payloads.len(), 64);
        last_tick = outcome.tick_after;
        last_cycle = outcome.cycle_after;
    }
}

/// Single-step bounds reject zero and oversized requests.
#[test]
fn step_bounds_are_enforced() {
    let rig = TestRig::new();
    rig.boot_stepped(&crate::harness::build_boot_image(&spin_program(), None));
    let err = rig.engine.step(0).expect_err("zero steps");
    assert_eq!(err.code, engine_abi::ErrorCode::DebugStepInvalid);
    let err = rig.engine.step(1025).expect_err("too many steps");
    assert_eq!(err.code, engine_abi::ErrorCode::DebugStepInvalid);
}

/// Slow motion accepts ratio 1.0 and rejects out-of-range ratios.
#[test]
fn slow_motion_ratio_bounds() {
    let rig = TestRig::new();
    rig.boot(&crate::harness::build_boot_image(&spin_program(), None));
    let outcome = rig
        .engine
        .set_clock_mode(ClockMode::SlowMotion { ratio: 1.0 })
        .expect("ratio 1.0 is legal");
    assert!(outcome.transition_applied);
    let err = rig
        .engine
        .set_clock_mode(ClockMode::SlowMotion { ratio: 0.0 })
        .expect_err("zero ratio");
    assert_eq!(err.code, engine_abi::ErrorCode::DebugClockInvalid);
    let err = rig
        .engine
        .set_clock_mode(ClockMode::SlowMotion { ratio: 1.5 })
        .expect_err("ratio above one");
    assert_eq!(err.code, engine_abi::ErrorCode::DebugClockInvalid);

    // Idempotent re-issue of the current mode does not bump the seq.
    let applied = rig
        .engine
        .set_clock_mode(ClockMode::SlowMotion { ratio: 1.0 })
        .expect("re-issue");
    assert!(!applied.transition_applied);
}

/// Starting with nothing in the ROM slot boots from the synthesized
/// reset frame: the CPU executes from the RAM boot address, and a
/// handwritten program planted there runs to completion.
#[test]
fn romless_boot_executes_a_ram_program() {
    let rig = TestRig::new();
    // No media attached at all.
    rig.engine
        .start("atari_st", "st_520_pal", Some("rom.tos.1.04.uk"))
        .expect("start without a ROM image");
    rig.engine
        .set_clock_mode(ClockMode::SingleStep)
        .expect("enter single_step");
    rig.advance(8);

    // The CPU came up on the synthesized frame: supervisor mode, the
    // stack at the top of RAM, and the PC marching through RAM from the
    // boot address (zero-filled RAM decodes as a harmless ORI sled).
    let ram_size = 512 * 1024u32;
    match rig.engine.inspect(InspectCmd::CpuRegisters).expect("cpu") {
        InspectReply::Cpu(cpu) => {
            assert!(
                cpu.pc >= RAM_BOOT_PC && cpu.pc < ram_size,
                "pc {:#x} should be executing RAM above the boot address",
                cpu.pc
            );
            assert_eq!(cpu.sr & 0x2000, 0x2000, "supervisor mode after reset");
            assert_eq!(cpu.a[7], (ram_size - 4) & !1, "stack at the top of RAM");
        }
        other => panic!("unexpected inspect reply {other:?}"),
    }
    match rig.engine.inspect(InspectCmd::BusStatus).expect("bus") {
        InspectReply::Bus { bus_errors, .. } => {
            assert_eq!(bus_errors, 0, "the ROM-less boot path is fetch-clean");
        }
        other => panic!("unexpected inspect reply {other:?}"),
    }

    // Plant a handwritten program at the boot address through the
    // snapshot format and restore into it:
    //   moveq #42,d0 ; move.b d0,$9000.l ; bra.s *
    let saved = rig
        .engine
        .lifecycle(LifecycleCmd::SuspendSave {
            name: "ramprog".into(),
        })
        .expect("suspend")
        .snapshot_id
        .expect("snapshot id");
    let store = SnapshotStore::new(rig.dir.path());
    let mut record = store.load(&saved).expect("load record");
    let program: [u16; 5] = [0x702A, 0x13C0, 0x0000, 0x9000, 0x60FE];
    let mut offset = RAM_BOOT_PC as usize;
    for word in program {
        record.state.ram[offset..offset + 2].copy_from_slice(&word.to_be_bytes());
        offset += 2;
    }
    record.state.cpu.pc = RAM_BOOT_PC;
    let manifest = engine::profile::find("atari_st", "st_520_pal").expect("profile");
    store
        .save(
            "snap-ramprog",
            "ramprog",
            manifest,
            &record.state,
            record.counters,
            &[],
            record.meta.saved_at_us,
        )
        .expect("save edited record");
    rig.engine
        .lifecycle(LifecycleCmd::RestoreResume {
            snapshot_id: "snap-ramprog".into(),
            resume_mode: ResumeMode::Running,
        })
        .expect("restore into the RAM program");
    rig.advance(8);

    match rig
        .engine
        .inspect(InspectCmd::MemoryWindow {
            base: 0x9000,
            len: 1,
        })
        .expect("flag cell")
    {
        InspectReply::Memory { bytes, .. } => {
            assert_eq!(bytes[0], 42, "the RAM program wrote its flag");
        }
        other => panic!("unexpected inspect reply {other:?}"),
    }
    match rig.engine.inspect(InspectCmd::CpuRegisters).expect("cpu") {
        InspectReply::Cpu(cpu) => {
            assert_eq!(cpu.d[0], 42);
            assert_eq!(
                cpu.pc,
                RAM_BOOT_PC + 8,
                "spinning on the terminal branch of the RAM program"
            );
        }
        other => panic!("unexpected inspect reply {other:?}"),
    }
    match rig.engine.inspect(InspectCmd::BusStatus).expect("bus") {
        InspectReply::Bus { bus_errors, .. } => {
            assert_eq!(bus_errors, 0);
        }
        other => panic!("unexpected inspect reply {other:?}"),
    }
}
