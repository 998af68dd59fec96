//! Shared fixtures: handwritten boot ROMs and an engine on a temp root.

use engine::{Engine, EngineConfig};
use engine_abi::{ClockMode, MediaDescriptor, MediaSlot};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// ROM window base on the ST.
pub const ROM_BASE: u32 = 0xFC_0000;
/// Program entry offset inside the boot image.
pub const PROGRAM_OFFSET: usize = 0x100;
/// Interrupt handler offset inside the boot image.
pub const HANDLER_OFFSET: usize = 0x200;
/// Supervisor stack seeded by the boot image.
pub const BOOT_SSP: u32 = 0x8000;

/// Builds a minimal boot image: reset frame, optional vector, program,
/// and handler. The bus mirrors the first KiB to address zero, so vector
/// entries written here become the live exception table.
pub fn build_boot_image(
    program: &[u16],
    handler: Option<(&[u16], u8)>,
) -> Vec<u8> {
    let mut rom = vec![0u8; 4096];
    rom[0..4].copy_from_slice(&BOOT_SSP.to_be_bytes());
    rom[4..8].copy_from_slice(&(ROM_BASE + PROGRAM_OFFSET as u32).to_be_bytes());
    let mut offset = PROGRAM_OFFSET;
    for word in program {
        rom[offset..offset + 2].copy_from_slice(&word.to_be_bytes());
        offset += 2;
    }
    if let Some((code, vector)) = handler {
        let entry = vector as usize * 4;
        rom[entry..entry + 4].copy_from_slice(&(ROM_BASE + HANDLER_OFFSET as u32).to_be_bytes());
        let mut offset = HANDLER_OFFSET;
        for word in code {
            rom[offset..offset + 2].copy_from_slice(&word.to_be_bytes());
            offset += 2;
        }
    }
    rom
}

/// A tight spin: `bra.s *`.
pub fn spin_program() -> Vec<u16> {
    vec![0x60FE]
}

/// Writes `bytes` into `dir` and produces the resolved descriptor the
/// catalog collaborator would hand the core.
pub fn descriptor_for(dir: &Path, name: &str, bytes: &[u8]) -> MediaDescriptor {
    let path = dir.join(name);
    fs::write(&path, bytes).expect("write media file");
    MediaDescriptor {
        path,
        sha256: hex::encode(Sha256::digest(bytes)),
        size: bytes.len() as u64,
    }
}

/// Engine rooted in a fresh temp directory with the boot image attached.
pub struct TestRig {
    pub engine: Engine,
    pub dir: TempDir,
}

impl TestRig {
    pub fn new() -> TestRig {
        let dir = tempfile::tempdir().expect("tempdir");
        let engine = Engine::new(EngineConfig {
            data_root: dir.path().to_path_buf(),
        });
        TestRig { engine, dir }
    }

    /// Attaches a boot image cold and starts the default PAL session.
    pub fn boot(&self, rom: &[u8]) {
        let descriptor = descriptor_for(self.dir.path(), "boot.img", rom);
        self.engine
            .attach_media(MediaSlot::Rom, descriptor)
            .expect("attach boot image");
        self.engine
            .start("atari_st", "st_520_pal", Some("rom.tos.1.04.uk"))
            .expect("start session");
    }

    /// Boots and immediately parks the clock in single-step mode so tests
    /// advance deterministically.
    pub fn boot_stepped(&self, rom: &[u8]) {
        self.boot(rom);
        self.engine
            .set_clock_mode(ClockMode::SingleStep)
            .expect("enter single_step");
    }

    /// Commits `ticks` ticks in batches within the step limit.
    pub fn advance(&self, mut ticks: u32) {
        while ticks > 0 {
            let batch = ticks.min(1024);
            self.engine.step(batch).expect("step batch");
            ticks -= batch;
        }
    }
}

impl Default for TestRig {
    fn default() -> Self {
        Self::new()
    }
}
