//! WD1772 floppy controller behind the ST DMA engine.
//!
//! The CPU talks to the controller through the word window at `0xFF8604`
//! (register multiplexed by the DMA mode register) and `0xFF8606`
//! (mode/status). Sector payloads never cross the CPU bus: the DMA engine
//! moves them directly between the floppy image and RAM, at most
//! `max_requests_per_window` bytes per granted window, so transfer timing
//! is a deterministic function of committed ticks.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Bytes per sector on every ST format.
pub const SECTOR_BYTES: usize = 512;

/// Default DMA window grant, in bytes per committed tick.
pub const MAX_REQUESTS_PER_WINDOW: u32 = 16;

/// Cycles of command setup before a transfer starts moving bytes.
const SETUP_CYCLES: u32 = 2_048;
/// Cycles per track step for the type I commands (3 ms at 8 MHz).
const STEP_CYCLES: u32 = 24_000;

// FDC status bits.
const ST_BUSY: u8 = 0x01;
const ST_DRQ: u8 = 0x02;
const ST_LOST_DATA: u8 = 0x04;
const ST_CRC_ERROR: u8 = 0x08;
const ST_RNF: u8 = 0x10;
const ST_WRITE_PROTECT: u8 = 0x40;
const ST_MOTOR_ON: u8 = 0x80;
const ST_TRACK0: u8 = 0x04;

/// Terminal condition of a completed command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FdcOutcome {
    Ok,
    CrcError,
    RecordNotFound,
    WriteProtect,
    LostData,
    Timeout,
    Aborted,
}

/// Mounted floppy image with inferred geometry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FloppyImage {
    pub data: Arc<[u8]>,
    pub sectors_per_track: u32,
    pub sides: u32,
    pub tracks: u32,
    pub write_protect: bool,
}

impl FloppyImage {
    /// Infers raw `.st` geometry from the image size.
    ///
    /// Tries the factory formats first (9/10/11 sectors, 80..=84 tracks,
    /// single or double sided); images that match nothing are rejected.
    pub fn from_raw(data: Arc<[u8]>, write_protect: bool) -> Option<FloppyImage> {
        let total_sectors = data.len() / SECTOR_BYTES;
        if data.len() % SECTOR_BYTES != 0 || total_sectors == 0 {
            return None;
        }
        for sides in [2u32, 1] {
            for spt in [9u32, 10, 11] {
                let per_cylinder = (spt * sides) as usize;
                if total_sectors % per_cylinder != 0 {
                    continue;
                }
                let tracks = (total_sectors / per_cylinder) as u32;
                if (78..=86).contains(&tracks) {
                    return Some(FloppyImage {
                        data,
                        sectors_per_track: spt,
                        sides,
                        tracks,
                        write_protect,
                    });
                }
            }
        }
        None
    }

    fn sector_offset(&self, track: u32, side: u32, sector: u32) -> Option<usize> {
        if track >= self.tracks || side >= self.sides {
            return None;
        }
        if sector == 0 || sector > self.sectors_per_track {
            return None;
        }
        let lba = (track * self.sides + side) * self.sectors_per_track + (sector - 1);
        let offset = lba as usize * SECTOR_BYTES;
        if offset + SECTOR_BYTES <= self.data.len() {
            Some(offset)
        } else {
            None
        }
    }
}

/// An in-flight DMA transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Transfer {
    image_offset: usize,
    total: u32,
    remaining: u32,
    writing: bool,
}

/// Serializable DMA/FDC state block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmaFdcState {
    pub fdc_status: u8,
    pub fdc_track: u8,
    pub fdc_sector: u8,
    pub fdc_data: u8,
    pub dma_mode: u16,
    pub dma_status: u16,
    pub dma_base: u32,
    pub sector_count: u16,
    pub intrq: bool,
    setup_countdown: u32,
    step_countdown: u32,
    step_target: Option<u8>,
    transfer: Option<Transfer>,
    pub last_outcome: Option<FdcOutcome>,
}

pub struct DmaFdc {
    state: DmaFdcState,
    disks: [Option<FloppyImage>; 2],
    /// Pending write-back of modified sectors, applied to the image copy.
    dirty: Vec<(usize, Vec<u8>)>,
}

impl DmaFdc {
    pub fn new() -> Self {
        Self {
            state: DmaFdcState {
                dma_status: 0x01,
                ..DmaFdcState::default()
            },
            disks: [None, None],
            dirty: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.state = DmaFdcState {
            dma_status: 0x01,
            ..DmaFdcState::default()
        };
        self.dirty.clear();
    }

    pub fn insert_disk(&mut self, drive: usize, image: FloppyImage) {
        self.disks[drive & 1] = Some(image);
    }

    pub fn eject_disk(&mut self, drive: usize) {
        self.disks[drive & 1] = None;
    }

    pub fn disk(&self, drive: usize) -> Option<&FloppyImage> {
        self.disks[drive & 1].as_ref()
    }

    pub fn intrq_pending(&self) -> bool {
        self.state.intrq
    }

    pub fn acknowledge_intrq(&mut self) {
        self.state.intrq = false;
    }

    pub fn busy(&self) -> bool {
        self.state.fdc_status & ST_BUSY != 0
    }

    pub fn last_outcome(&self) -> Option<FdcOutcome> {
        self.state.last_outcome
    }

    // --- register window (offsets within 0xFF8600..=0xFF860F) ---

    pub fn read_register(&self, offset: u32) -> u8 {
        match offset {
            0x04 => (self.selected_word_read() >> 8) as u8,
            0x05 => self.selected_word_read() as u8,
            0x06 => (self.dma_status_word() >> 8) as u8,
            0x07 => self.dma_status_word() as u8,
            0x09 => (self.state.dma_base >> 16) as u8,
            0x0B => (self.state.dma_base >> 8) as u8,
            0x0D => self.state.dma_base as u8,
            _ => 0,
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u8) {
        match offset {
            // Byte halves of the word registers; the low byte commits.
            0x04 => self.state.fdc_data = value,
            0x05 => self.selected_word_write(value),
            0x06 => {
                self.state.dma_mode = (self.state.dma_mode & 0x00FF) | ((value as u16) << 8);
            }
            0x07 => self.state.dma_mode = (self.state.dma_mode & 0xFF00) | value as u16,
            0x09 => {
                self.state.dma_base = (self.state.dma_base & 0x00_FFFF) | ((value as u32) << 16);
            }
            0x0B => {
                self.state.dma_base = (self.state.dma_base & 0xFF_00FF) | ((value as u32) << 8);
            }
            0x0D => {
                self.state.dma_base = (self.state.dma_base & 0xFF_FF00) | (value as u32 & 0xFE);
            }
            _ => {}
        }
    }

    /// Side-effect-free register view for diffs and inspection.
    pub fn peek(&self, offset: u32) -> u8 {
        self.read_register(offset)
    }

    fn dma_status_word(&self) -> u16 {
        let mut status = 0u16;
        if self.state.last_outcome.map_or(true, |o| o == FdcOutcome::Ok) {
            status |= 0x01;
        }
        if self.state.sector_count != 0 {
            status |= 0x02;
        }
        if self.state.transfer.is_some() {
            status |= 0x04;
        }
        status
    }

    /// Register select bits of the DMA mode word.
    fn selected_fdc_register(&self) -> u16 {
        (self.state.dma_mode >> 1) & 0x03
    }

    fn sector_count_selected(&self) -> bool {
        self.state.dma_mode & 0x10 != 0
    }

    fn selected_word_read(&self) -> u16 {
        if self.sector_count_selected() {
            return self.state.sector_count;
        }
        match self.selected_fdc_register() {
            0 => {
                let mut status = self.state.fdc_status;
                if self.state.fdc_track == 0 {
                    status |= ST_TRACK0;
                }
                status as u16
            }
            1 => self.state.fdc_track as u16,
            2 => self.state.fdc_sector as u16,
            _ => self.state.fdc_data as u16,
        }
    }

    fn selected_word_write(&mut self, low: u8) {
        if self.sector_count_selected() {
            self.state.sector_count = low as u16;
            return;
        }
        match self.selected_fdc_register() {
            0 => self.command(low),
            1 => self.state.fdc_track = low,
            2 => self.state.fdc_sector = low,
            _ => self.state.fdc_data = low,
        }
    }

    // --- command execution ---

    fn command(&mut self, cmd: u8) {
        if cmd & 0xF0 == 0xD0 {
            // Force interrupt: abort whatever is in flight.
            if self.busy() {
                self.finish(FdcOutcome::Aborted);
            }
            self.state.fdc_status &= !ST_BUSY;
            if cmd & 0x08 != 0 {
                self.state.intrq = true;
            }
            return;
        }
        if self.busy() {
            return;
        }
        self.state.intrq = false;
        self.state.last_outcome = None;
        self.state.fdc_status = ST_BUSY | ST_MOTOR_ON;
        match cmd >> 4 {
            // Restore: seek track zero.
            0x0 => {
                let steps = self.state.fdc_track.max(1) as u32;
                self.state.step_target = Some(0);
                self.state.step_countdown = steps * STEP_CYCLES;
            }
            // Seek to the track in the data register.
            0x1 => {
                let target = self.state.fdc_data;
                let steps = self.state.fdc_track.abs_diff(target).max(1) as u32;
                self.state.step_target = Some(target);
                self.state.step_countdown = steps * STEP_CYCLES;
            }
            // Step family; direction handling collapsed to single steps.
            0x2 | 0x3 => {
                self.state.step_target = Some(self.state.fdc_track);
                self.state.step_countdown = STEP_CYCLES;
            }
            0x4 | 0x5 => {
                self.state.step_target = Some(self.state.fdc_track.saturating_add(1));
                self.state.step_countdown = STEP_CYCLES;
            }
            0x6 | 0x7 => {
                self.state.step_target = Some(self.state.fdc_track.saturating_sub(1));
                self.state.step_countdown = STEP_CYCLES;
            }
            // Read / write sector.
            0x8 | 0x9 => self.begin_sector_transfer(false),
            0xA | 0xB => self.begin_sector_transfer(true),
            // Read address: deliver the ID field of the current sector.
            0xC => {
                self.state.fdc_sector = self.state.fdc_track;
                self.state.setup_countdown = SETUP_CYCLES;
                self.state.transfer = None;
            }
            // Read / write track fall back to whole-track transfers.
            0xE => self.begin_track_transfer(false),
            0xF => self.begin_track_transfer(true),
            _ => unreachable!(),
        }
    }

    fn begin_sector_transfer(&mut self, writing: bool) {
        self.state.setup_countdown = SETUP_CYCLES;
        self.state.transfer = Some(Transfer {
            image_offset: 0,
            total: 0,
            remaining: 0,
            writing,
        });
    }

    fn begin_track_transfer(&mut self, writing: bool) {
        self.state.fdc_sector = 1;
        self.begin_sector_transfer(writing);
    }

    fn finish(&mut self, outcome: FdcOutcome) {
        self.state.fdc_status &= !(ST_BUSY | ST_DRQ);
        match outcome {
            FdcOutcome::Ok => {}
            FdcOutcome::CrcError => self.state.fdc_status |= ST_CRC_ERROR,
            FdcOutcome::RecordNotFound | FdcOutcome::Timeout => {
                self.state.fdc_status |= ST_RNF;
            }
            FdcOutcome::WriteProtect => self.state.fdc_status |= ST_WRITE_PROTECT,
            FdcOutcome::LostData => self.state.fdc_status |= ST_LOST_DATA,
            FdcOutcome::Aborted => {}
        }
        self.state.last_outcome = Some(outcome);
        self.state.transfer = None;
        self.state.intrq = true;
    }

    /// Applies staged sector writes to the image copy.
    fn flush_dirty(&mut self, drive: usize) {
        if self.dirty.is_empty() {
            return;
        }
        if let Some(image) = self.disks[drive & 1].take() {
            let mut data = image.data.to_vec();
            for (offset, bytes) in self.dirty.drain(..) {
                if offset + bytes.len() <= data.len() {
                    data[offset..offset + bytes.len()].copy_from_slice(&bytes);
                }
            }
            self.disks[drive & 1] = Some(FloppyImage {
                data: Arc::from(data.into_boxed_slice()),
                ..image
            });
        }
    }

    /// Advances command timing and moves at most `window_budget` bytes
    /// between the image and RAM. Returns the bytes moved this window.
    pub fn clock(
        &mut self,
        cycles: u32,
        window_budget: u32,
        ram: &mut [u8],
        drive: Option<u8>,
        side: u8,
    ) -> u32 {
        // Track stepping.
        if let Some(target) = self.state.step_target {
            if self.state.step_countdown > cycles {
                self.state.step_countdown -= cycles;
                return 0;
            }
            self.state.step_countdown = 0;
            self.state.step_target = None;
            self.state.fdc_track = target;
            self.finish(FdcOutcome::Ok);
            return 0;
        }

        if self.state.setup_countdown > 0 {
            if self.state.setup_countdown > cycles {
                self.state.setup_countdown -= cycles;
                return 0;
            }
            self.state.setup_countdown = 0;
            if !self.arm_transfer(drive, side) {
                return 0;
            }
        }

        let Some(transfer) = self.state.transfer.clone() else {
            // Read-address style commands complete after setup.
            if self.busy() {
                self.finish(FdcOutcome::Ok);
            }
            return 0;
        };
        if transfer.remaining == 0 {
            return 0;
        }

        let Some(drive) = drive else {
            self.finish(FdcOutcome::Timeout);
            return 0;
        };
        let chunk = transfer.remaining.min(window_budget);
        let mut moved = 0u32;
        let base = self.state.dma_base as usize;
        let done = (transfer.total - transfer.remaining) as usize;

        if transfer.writing {
            let mut staged = vec![0u8; chunk as usize];
            for i in 0..chunk as usize {
                staged[i] = ram.get(base + done + i).copied().unwrap_or(0);
                moved += 1;
            }
            self.dirty.push((transfer.image_offset + done, staged));
        } else if let Some(image) = &self.disks[drive as usize & 1] {
            for i in 0..chunk as usize {
                let byte = image.data[transfer.image_offset + done + i];
                if let Some(slot) = ram.get_mut(base + done + i) {
                    *slot = byte;
                }
                moved += 1;
            }
        }

        let remaining = transfer.remaining - moved;
        self.state.fdc_status |= ST_DRQ;
        if remaining == 0 {
            let writing = transfer.writing;
            self.state.transfer = None;
            self.state.sector_count = 0;
            if writing {
                self.flush_dirty(drive as usize);
            }
            self.finish(FdcOutcome::Ok);
        } else {
            self.state.transfer = Some(Transfer {
                remaining,
                ..transfer
            });
        }
        moved
    }

    /// Validates the addressed sector once setup time has elapsed.
    fn arm_transfer(&mut self, drive: Option<u8>, side: u8) -> bool {
        let Some(transfer) = self.state.transfer.clone() else {
            return true;
        };
        let Some(drive) = drive else {
            self.finish(FdcOutcome::Timeout);
            return false;
        };
        let Some(image) = &self.disks[drive as usize & 1] else {
            self.finish(FdcOutcome::RecordNotFound);
            return false;
        };
        if transfer.writing && image.write_protect {
            self.finish(FdcOutcome::WriteProtect);
            return false;
        }
        let count = self.state.sector_count.max(1) as u32;
        let Some(offset) = image.sector_offset(
            self.state.fdc_track as u32,
            side as u32,
            self.state.fdc_sector as u32,
        ) else {
            self.finish(FdcOutcome::RecordNotFound);
            return false;
        };
        // Multi-sector runs must fit the track image contiguously.
        let bytes = SECTOR_BYTES as u32 * count;
        if offset + bytes as usize > image.data.len() {
            self.finish(FdcOutcome::RecordNotFound);
            return false;
        }
        self.state.transfer = Some(Transfer {
            image_offset: offset,
            total: bytes,
            remaining: bytes,
            writing: transfer.writing,
        });
        true
    }

    pub fn state(&self) -> &DmaFdcState {
        &self.state
    }

    pub fn restore(&mut self, state: DmaFdcState) {
        self.state = state;
        self.dirty.clear();
    }
}

impl Default for DmaFdc {
    fn default() -> Self {
        Self::new()
    }
}
