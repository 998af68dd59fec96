//! GLUE: scanline and frame cadence, HBL/VBL generation.
//!
//! The GLUE counts CPU cycles into scanlines and frames. At the end of each
//! scanline it latches an HBL (level 2) request, at the end of each frame a
//! VBL (level 4) request; the fabric consumes both. It also answers the MMU
//! memory-configuration window, which TOS probes during its RAM sizing.

use engine_abi::Region;
use serde::{Deserialize, Serialize};

/// CPU cycles per scanline on an 8 MHz ST.
pub const CYCLES_PER_LINE: u32 = 512;

/// Scanlines per frame by region.
pub fn lines_per_frame(region: Region) -> u32 {
    match region {
        Region::Pal => 313,
        Region::Ntsc => 263,
    }
}

/// Serializable GLUE state block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlueState {
    pub line_cycles: u32,
    pub scanline: u32,
    pub frame_count: u64,
    pub hbl_pending: bool,
    pub vbl_pending: bool,
    pub sync_mode: u8,
    pub memory_config: u8,
}

pub struct Glue {
    region: Region,
    lines_per_frame: u32,
    state: GlueState,
    frame_ready: bool,
}

impl Glue {
    pub fn new(region: Region) -> Self {
        Self {
            region,
            lines_per_frame: lines_per_frame(region),
            state: GlueState {
                // 1 = 512 KiB bank configuration.
                memory_config: 0b0000_0101,
                sync_mode: match region {
                    Region::Pal => 0x02,
                    Region::Ntsc => 0x00,
                },
                ..GlueState::default()
            },
            frame_ready: false,
        }
    }

    pub fn reset(&mut self) {
        let memory_config = self.state.memory_config;
        let sync_mode = self.state.sync_mode;
        self.state = GlueState {
            memory_config,
            sync_mode,
            ..GlueState::default()
        };
        self.frame_ready = false;
    }

    pub fn region(&self) -> Region {
        self.region
    }

    /// Advances the video cadence by `cycles` CPU cycles.
    pub fn clock(&mut self, cycles: u32) {
        self.state.line_cycles += cycles;
        while self.state.line_cycles >= CYCLES_PER_LINE {
            self.state.line_cycles -= CYCLES_PER_LINE;
            self.state.scanline += 1;
            self.state.hbl_pending = true;
            if self.state.scanline >= self.lines_per_frame {
                self.state.scanline = 0;
                self.state.vbl_pending = true;
                self.state.frame_count += 1;
                self.frame_ready = true;
            }
        }
    }

    pub fn scanline(&self) -> u32 {
        self.state.scanline
    }

    pub fn frame_count(&self) -> u64 {
        self.state.frame_count
    }

    /// True once per frame until the renderer consumes it.
    pub fn take_frame_ready(&mut self) -> bool {
        std::mem::take(&mut self.frame_ready)
    }

    pub fn hbl_pending(&self) -> bool {
        self.state.hbl_pending
    }

    pub fn vbl_pending(&self) -> bool {
        self.state.vbl_pending
    }

    pub fn acknowledge_hbl(&mut self) {
        self.state.hbl_pending = false;
    }

    pub fn acknowledge_vbl(&mut self) {
        self.state.vbl_pending = false;
    }

    /// Cycles remaining in the current scanline; the scheduler's CPU budget.
    pub fn cycles_to_line_end(&self) -> u32 {
        CYCLES_PER_LINE - self.state.line_cycles
    }

    /// Low nibble seeded into the `MEMCNTLR` system variable.
    pub fn memory_controller_nibble(&self) -> u8 {
        self.state.memory_config & 0x0F
    }

    pub fn read_mmu_config(&self, offset: u32) -> u8 {
        match offset {
            0x01 => self.state.memory_config,
            _ => 0,
        }
    }

    pub fn write_mmu_config(&mut self, offset: u32, value: u8) {
        if offset == 0x01 {
            self.state.memory_config = value & 0x0F;
        }
    }

    pub fn read_sync(&self) -> u8 {
        self.state.sync_mode
    }

    pub fn write_sync(&mut self, value: u8) {
        self.state.sync_mode = value & 0x03;
    }

    pub fn state(&self) -> &GlueState {
        &self.state
    }

    pub fn restore(&mut self, state: GlueState) {
        self.state = state;
        self.frame_ready = false;
    }
}
