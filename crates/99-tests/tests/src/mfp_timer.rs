//! MFP timer scenario: delay-mode expiry reaches the CPU through the
//! fabric with the programmed vector, and never double-fires while the
//! in-service bit stays set.

use crate::harness::{build_boot_image, TestRig};
use engine::InspectReply;
use engine_abi::InspectCmd;

/// Counter cell the interrupt handler increments.
const FLAG_ADDR: u16 = 0x9000;

/// Arms Timer A (prescaler 64, count 192), unmasks level 6, and spins.
fn timer_program() -> Vec<u16> {
    vec![
        0x13FC, 0x0020, 0x00FF, 0xFA07, // move.b #$20,IERA  (timer A enable)
        0x13FC, 0x0020, 0x00FF, 0xFA13, // move.b #$20,IMRA  (timer A unmask)
        0x13FC, 0x0040, 0x00FF, 0xFA17, // move.b #$40,VR    (vector base $40)
        0x13FC, 0x00C0, 0x00FF, 0xFA1F, // move.b #192,TADR
        0x13FC, 0x0005, 0x00FF, 0xFA19, // move.b #$05,TACR  (delay, /64)
        0x46FC, 0x2500, // move #$2500,SR   (IPL 5: MFP passes, VBL/HBL masked)
        0x60FE, // bra.s *
    ]
}

/// `addq.b #1,FLAG_ADDR` then return; ISR is deliberately left set.
fn timer_handler() -> Vec<u16> {
    vec![0x5239, 0x0000, FLAG_ADDR, 0x4E73]
}

fn read_flag(rig: &TestRig) -> u8 {
    match rig
        .engine
        .inspect(InspectCmd::MemoryWindow {
            base: FLAG_ADDR as u32,
            len: 1,
        })
        .expect("memory window")
    {
        InspectReply::Memory { bytes, .. } => bytes[0],
        other => panic!("unexpected inspect reply {other:?}"),
    }
}

#[test]
fn timer_a_interrupt_fires_once_with_programmed_vector() {
    let rig = TestRig::new();
    // Vector (VR & $F0) | 13 = $4D.
    let rom = build_boot_image(&timer_program(), Some((&timer_handler(), 0x4D)));
    rig.boot_stepped(&rom);

    // 192 * 64 = 12288 cycles is 24 scanlines; give it twice that.
    rig.advance(64);
    assert_eq!(read_flag(&rig), 1, "timer A handler ran exactly once");

    // Without clearing ISRA the channel must not fire again.
    rig.advance(64);
    assert_eq!(read_flag(&rig), 1, "in-service bit blocks a re-fire");

    // The in-service bit for channel 13 is visible in ISRA.
    match rig
        .engine
        .inspect(InspectCmd::ChipRegisters {
            component: "mfp".into(),
        })
        .expect("mfp registers")
    {
        InspectReply::Chip { bytes, .. } => {
            let isra = bytes[0x0F];
            assert_eq!(isra & 0x20, 0x20, "timer A in-service bit set");
        }
        other => panic!("unexpected inspect reply {other:?}"),
    }
}
