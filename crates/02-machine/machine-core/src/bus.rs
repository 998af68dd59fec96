//! 24-bit big-endian bus with an ordered address-range registry.
//!
//! The bus owns RAM, the TOS ROM window, the optional cartridge image, and
//! every chip register file. All memory traffic from the CPU and the DMA
//! engine goes through `read_*`/`write_*`; no component indexes RAM
//! directly. Accesses that miss every registered range latch a bus error
//! and complete benignly (reads return zero, writes are dropped); the CPU
//! consumes the fault latch and decides whether to raise an exception.

use crate::acia::AciaBridge;
use crate::fdc::DmaFdc;
use crate::glue::Glue;
use crate::mfp::Mfp;
use crate::psg::Psg;
use crate::shifter::Shifter;
use engine_abi::{AccessType, ComponentKey, Region};
use std::sync::Arc;

/// Address space wraps at 24 bits on the 68000's external bus.
pub const ADDR_MASK: u32 = 0x00FF_FFFF;

/// TOS 1.x ROM window base.
pub const ROM_BASE: u32 = 0xFC_0000;
/// Cartridge window base.
pub const CART_BASE: u32 = 0xFA_0000;
/// Cartridge window size.
pub const CART_SIZE: u32 = 0x2_0000;
/// Synthesized reset PC when no ROM is attached.
///
/// The empty ROM window reads floating `0xFF`, so a reset PC at
/// `ROM_BASE` would trap on the first fetch (and re-trap forever, since
/// the synthesized vectors all point back at the reset PC). Landing in
/// RAM instead gives handwritten programs a defined entry point inside
/// every supported RAM size.
pub const RAM_BOOT_PC: u32 = 0x04_0000;

// ST system variables seeded deterministically after reset.
const MEMVALID: u32 = 0x420;
const MEMCNTLR: u32 = 0x424;
const PHYSTOP: u32 = 0x42E;
const MEMBOT: u32 = 0x432;
const MEMTOP: u32 = 0x436;
const MEMVALID2: u32 = 0x43A;
const MEMVALID3: u32 = 0x51A;

const MEMVALID_MAGIC: u32 = 0x7520_19F3;
const MEMVALID2_MAGIC: u32 = 0x2376_98AA;
const MEMVALID3_MAGIC: u32 = 0x5555_AAAA;

/// Fault surfaced to the CPU after a bus transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BusFault {
    pub addr: u32,
    pub is_write: bool,
}

/// Dispatch target of a registered address range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeTarget {
    Ram,
    Rom,
    Cartridge,
    MmuConfig,
    Video,
    DmaFdc,
    Psg,
    Mfp,
    Acia,
}

/// One entry of the ordered, non-overlapping bus map.
#[derive(Clone, Copy, Debug)]
pub struct BusRange {
    pub start: u32,
    /// Inclusive end address.
    pub end: u32,
    pub target: RangeTarget,
    pub name: &'static str,
}

/// One observed transaction, recorded when tracing is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AccessRecord {
    pub addr: u32,
    pub access: AccessType,
    pub size_bytes: u8,
    pub value: u16,
    pub master: ComponentKey,
    pub region: &'static str,
}

/// One observed chip-register mutation, recorded when diffing is enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegDiffRecord {
    pub component: ComponentKey,
    pub register: &'static str,
    pub old_value: u8,
    pub new_value: u8,
}

static MFP_REGISTER_NAMES: [&str; 24] = [
    "gpip", "aer", "ddr", "iera", "ierb", "ipra", "iprb", "isra", "isrb", "imra", "imrb", "vr",
    "tacr", "tbcr", "tcdcr", "tadr", "tbdr", "tcdr", "tddr", "scr", "ucr", "rsr", "tsr", "udr",
];

static PSG_REGISTER_NAMES: [&str; 16] = [
    "period_a_fine",
    "period_a_coarse",
    "period_b_fine",
    "period_b_coarse",
    "period_c_fine",
    "period_c_coarse",
    "noise_period",
    "mixer",
    "level_a",
    "level_b",
    "level_c",
    "envelope_fine",
    "envelope_coarse",
    "envelope_shape",
    "port_a",
    "port_b",
];

fn video_register_name(offset: u32) -> Option<&'static str> {
    match offset {
        0x01 => Some("video_base_high"),
        0x03 => Some("video_base_mid"),
        0x0A => Some("sync_mode"),
        0x0D => Some("video_base_low"),
        0x40..=0x5F => Some("palette"),
        0x60 => Some("shift_mode"),
        _ => None,
    }
}

fn dma_register_name(offset: u32) -> Option<&'static str> {
    match offset {
        0x04 | 0x05 => Some("fdc_access"),
        0x06 | 0x07 => Some("dma_mode"),
        0x09 => Some("dma_base_high"),
        0x0B => Some("dma_base_mid"),
        0x0D => Some("dma_base_low"),
        _ => None,
    }
}

fn acia_register_name(offset: u32) -> Option<&'static str> {
    match offset {
        0x00 => Some("keyboard_control"),
        0x02 => Some("keyboard_data"),
        0x04 => Some("midi_control"),
        0x06 => Some("midi_data"),
        _ => None,
    }
}

/// The ST bus: memory arrays, chip register files, and the range registry.
pub struct StBus {
    ram: Box<[u8]>,
    rom: Arc<[u8]>,
    cartridge: Option<Arc<[u8]>>,
    map: Vec<BusRange>,

    pub glue: Glue,
    pub shifter: Shifter,
    pub mfp: Mfp,
    pub psg: Psg,
    pub acia: AciaBridge,
    pub dma: DmaFdc,

    /// Component currently driving the bus; stamped into trace records.
    master: ComponentKey,

    bus_errors: u64,
    last_bus_error: Option<BusFault>,
    fault: Option<BusFault>,

    trace_enabled: bool,
    trace: Vec<AccessRecord>,
    diff_enabled: bool,
    diffs: Vec<RegDiffRecord>,
}

impl StBus {
    /// Builds a bus for `ram_bytes` of RAM and the given region timing.
    pub fn new(ram_bytes: usize, region: Region, sample_rate: u32) -> Self {
        let ram_end = ram_bytes as u32 - 1;
        let map = vec![
            BusRange {
                start: 0,
                end: ram_end,
                target: RangeTarget::Ram,
                name: "ram",
            },
            BusRange {
                start: CART_BASE,
                end: CART_BASE + CART_SIZE - 1,
                target: RangeTarget::Cartridge,
                name: "cartridge",
            },
            BusRange {
                start: ROM_BASE,
                end: 0xFE_FFFF,
                target: RangeTarget::Rom,
                name: "tos_rom",
            },
            BusRange {
                start: 0xFF_8000,
                end: 0xFF_800F,
                target: RangeTarget::MmuConfig,
                name: "mmu_config",
            },
            BusRange {
                start: 0xFF_8200,
                end: 0xFF_826F,
                target: RangeTarget::Video,
                name: "video",
            },
            BusRange {
                start: 0xFF_8600,
                end: 0xFF_860F,
                target: RangeTarget::DmaFdc,
                name: "dma_fdc",
            },
            BusRange {
                start: 0xFF_8800,
                end: 0xFF_8803,
                target: RangeTarget::Psg,
                name: "psg",
            },
            BusRange {
                start: 0xFF_FA00,
                end: 0xFF_FA2F,
                target: RangeTarget::Mfp,
                name: "mfp",
            },
            BusRange {
                start: 0xFF_FC00,
                end: 0xFF_FC07,
                target: RangeTarget::Acia,
                name: "acia",
            },
        ];
        Self {
            ram: vec![0u8; ram_bytes].into_boxed_slice(),
            rom: Arc::from(&[][..]),
            cartridge: None,
            map,
            glue: Glue::new(region),
            shifter: Shifter::new(),
            mfp: Mfp::new(),
            psg: Psg::new(sample_rate),
            acia: AciaBridge::new(),
            dma: DmaFdc::new(),
            master: ComponentKey::Cpu,
            bus_errors: 0,
            last_bus_error: None,
            fault: None,
            trace_enabled: false,
            trace: Vec::new(),
            diff_enabled: false,
            diffs: Vec::new(),
        }
    }

    /// Installs a TOS image into the ROM window.
    pub fn load_rom(&mut self, rom: Arc<[u8]>) {
        self.rom = rom;
    }

    /// Installs or removes the cartridge image.
    pub fn set_cartridge(&mut self, cart: Option<Arc<[u8]>>) {
        self.cartridge = cart;
    }

    pub fn ram_size(&self) -> usize {
        self.ram.len()
    }

    pub fn rom(&self) -> &Arc<[u8]> {
        &self.rom
    }

    /// Registered ranges in dispatch order.
    pub fn map(&self) -> &[BusRange] {
        &self.map
    }

    /// Direct RAM view for the scanline renderer and snapshots.
    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut [u8] {
        &mut self.ram
    }

    /// Sets the component stamped as bus master on trace records.
    pub fn set_master(&mut self, master: ComponentKey) {
        self.master = master;
    }

    pub fn set_trace_enabled(&mut self, enabled: bool) {
        self.trace_enabled = enabled;
        if !enabled {
            self.trace.clear();
        }
    }

    /// Drains transaction records accumulated since the last drain.
    pub fn drain_trace(&mut self, out: &mut Vec<AccessRecord>) {
        out.append(&mut self.trace);
    }

    pub fn set_diff_enabled(&mut self, enabled: bool) {
        self.diff_enabled = enabled;
        if !enabled {
            self.diffs.clear();
        }
    }

    /// Drains register mutation records accumulated since the last drain.
    pub fn drain_diffs(&mut self, out: &mut Vec<RegDiffRecord>) {
        out.append(&mut self.diffs);
    }

    /// Side-effect-free view of a chip register window byte.
    fn peek_target(&self, target: RangeTarget, offset: u32) -> u8 {
        match target {
            RangeTarget::MmuConfig => self.glue.read_mmu_config(offset),
            RangeTarget::Video => {
                if offset == 0x0A {
                    self.glue.read_sync()
                } else {
                    self.shifter.peek(offset)
                }
            }
            RangeTarget::DmaFdc => self.dma.peek(offset),
            RangeTarget::Psg => self.psg.peek(offset),
            RangeTarget::Mfp => self.mfp.peek(offset),
            RangeTarget::Acia => self.acia.peek(offset),
            _ => 0,
        }
    }

    fn diff_name(&self, target: RangeTarget, offset: u32) -> Option<(ComponentKey, &'static str)> {
        match target {
            RangeTarget::MmuConfig => Some((ComponentKey::Glue, "memory_config")),
            RangeTarget::Video => {
                let component = if offset == 0x0A {
                    ComponentKey::Glue
                } else {
                    ComponentKey::Shifter
                };
                video_register_name(offset).map(|name| (component, name))
            }
            RangeTarget::DmaFdc => {
                dma_register_name(offset).map(|name| (ComponentKey::Dma, name))
            }
            RangeTarget::Psg => {
                let index = (self.psg.state().selected & 0x0F) as usize;
                // Port writes surface through the PSG's own GPIO transition
                // queue, not the generic diff capture.
                if offset == 0x02 && index < 14 {
                    Some((ComponentKey::Psg, PSG_REGISTER_NAMES[index]))
                } else {
                    None
                }
            }
            RangeTarget::Mfp => {
                if offset & 1 == 1 && offset < 0x30 {
                    let index = ((offset - 1) / 2) as usize;
                    Some((ComponentKey::Mfp, MFP_REGISTER_NAMES[index]))
                } else {
                    None
                }
            }
            RangeTarget::Acia => acia_register_name(offset).map(|name| (ComponentKey::Acia, name)),
            _ => None,
        }
    }

    pub fn bus_errors(&self) -> u64 {
        self.bus_errors
    }

    pub fn last_bus_error(&self) -> Option<BusFault> {
        self.last_bus_error
    }

    /// Consumes the per-access fault latch.
    pub fn take_fault(&mut self) -> Option<BusFault> {
        self.fault.take()
    }

    fn locate(&self, addr: u32) -> Option<&BusRange> {
        // Ordered search; ranges are disjoint so the first hit is the owner.
        self.map.iter().find(|r| addr >= r.start && addr <= r.end)
    }

    fn miss(&mut self, addr: u32, is_write: bool) {
        self.bus_errors += 1;
        let fault = BusFault { addr, is_write };
        self.last_bus_error = Some(fault);
        self.fault = Some(fault);
        log::trace!(
            "bus miss at {addr:#08x} ({})",
            if is_write { "write" } else { "read" }
        );
    }

    fn record(&mut self, addr: u32, access: AccessType, size: u8, value: u16, region: &'static str) {
        if self.trace_enabled {
            self.trace.push(AccessRecord {
                addr,
                access,
                size_bytes: size,
                value,
                master: self.master,
                region,
            });
        }
    }

    pub fn read_byte(&mut self, addr: u32) -> u8 {
        let addr = addr & ADDR_MASK;
        let Some(range) = self.locate(addr).copied() else {
            self.miss(addr, false);
            return 0;
        };
        let offset = addr - range.start;
        let value = match range.target {
            RangeTarget::Ram => self.ram[addr as usize],
            RangeTarget::Rom => self.rom.get(offset as usize).copied().unwrap_or(0xFF),
            RangeTarget::Cartridge => match &self.cartridge {
                Some(cart) => cart.get(offset as usize).copied().unwrap_or(0xFF),
                // A floating cartridge port reads all-ones.
                None => 0xFF,
            },
            RangeTarget::MmuConfig => self.glue.read_mmu_config(offset),
            RangeTarget::Video => {
                if offset == 0x0A {
                    self.glue.read_sync()
                } else {
                    self.shifter.read_register(offset)
                }
            }
            RangeTarget::DmaFdc => self.dma.read_register(offset),
            RangeTarget::Psg => self.psg.read_register(offset),
            RangeTarget::Mfp => self.mfp.read_register(offset),
            RangeTarget::Acia => self.acia.read_register(offset),
        };
        self.record(addr, AccessType::Read, 1, value as u16, range.name);
        value
    }

    pub fn write_byte(&mut self, addr: u32, value: u8) {
        let addr = addr & ADDR_MASK;
        let Some(range) = self.locate(addr).copied() else {
            self.miss(addr, true);
            return;
        };
        let offset = addr - range.start;
        let diff_info = if self.diff_enabled {
            self.diff_name(range.target, offset)
        } else {
            None
        };
        let old_value = diff_info.map(|_| self.peek_diff_value(range.target, offset));
        match range.target {
            RangeTarget::Ram => self.ram[addr as usize] = value,
            // The ROM and cartridge windows ignore writes.
            RangeTarget::Rom | RangeTarget::Cartridge => {}
            RangeTarget::MmuConfig => self.glue.write_mmu_config(offset, value),
            RangeTarget::Video => {
                if offset == 0x0A {
                    self.glue.write_sync(value);
                } else {
                    self.shifter.write_register(offset, value);
                }
            }
            RangeTarget::DmaFdc => self.dma.write_register(offset, value),
            RangeTarget::Psg => self.psg.write_register(offset, value),
            RangeTarget::Mfp => self.mfp.write_register(offset, value),
            RangeTarget::Acia => self.acia.write_register(offset, value),
        }
        if let (Some((component, register)), Some(old_value)) = (diff_info, old_value) {
            let new_value = self.peek_diff_value(range.target, offset);
            self.diffs.push(RegDiffRecord {
                component,
                register,
                old_value,
                new_value,
            });
        }
        self.record(addr, AccessType::Write, 1, value as u16, range.name);
    }

    /// Value peeked for diff capture; PSG data writes diff the selected
    /// register rather than the window offset.
    fn peek_diff_value(&self, target: RangeTarget, offset: u32) -> u8 {
        match target {
            RangeTarget::Psg => self.psg.peek(self.psg.state().selected as u32),
            _ => self.peek_target(target, offset),
        }
    }

    /// Big-endian word read. Alignment is the CPU's concern, not the bus's.
    pub fn read_word(&mut self, addr: u32) -> u16 {
        let hi = self.read_byte(addr);
        let lo = self.read_byte(addr.wrapping_add(1));
        u16::from_be_bytes([hi, lo])
    }

    pub fn write_word(&mut self, addr: u32, value: u16) {
        let [hi, lo] = value.to_be_bytes();
        self.write_byte(addr, hi);
        self.write_byte(addr.wrapping_add(1), lo);
    }

    pub fn read_long(&mut self, addr: u32) -> u32 {
        let hi = self.read_word(addr);
        let lo = self.read_word(addr.wrapping_add(2));
        ((hi as u32) << 16) | lo as u32
    }

    pub fn write_long(&mut self, addr: u32, value: u32) {
        self.write_word(addr, (value >> 16) as u16);
        self.write_word(addr.wrapping_add(2), value as u16);
    }

    /// Resolves a register-window offset back to a human-readable region name.
    pub fn region_name(&self, addr: u32) -> &'static str {
        self.locate(addr & ADDR_MASK).map_or("unmapped", |r| r.name)
    }

    /// Side-effect-free byte view for inspection windows; unmapped
    /// addresses read zero without touching the error counters.
    pub fn peek_byte(&self, addr: u32) -> u8 {
        let addr = addr & ADDR_MASK;
        let Some(range) = self.locate(addr) else {
            return 0;
        };
        let offset = addr - range.start;
        match range.target {
            RangeTarget::Ram => self.ram[addr as usize],
            RangeTarget::Rom => self.rom.get(offset as usize).copied().unwrap_or(0xFF),
            RangeTarget::Cartridge => match &self.cartridge {
                Some(cart) => cart.get(offset as usize).copied().unwrap_or(0xFF),
                None => 0xFF,
            },
            target => self.peek_target(target, offset),
        }
    }

    /// Clocks the DMA/FDC engine against RAM with the drive and side lines
    /// currently driven by the PSG port A. Returns bytes moved.
    pub fn clock_dma(&mut self, cycles: u32, window_budget: u32) -> u32 {
        let drive = self.psg.selected_drive();
        let side = self.psg.selected_side();
        let StBus {
            ref mut dma,
            ref mut ram,
            ..
        } = *self;
        dma.clock(cycles, window_budget, ram, drive, side)
    }

    /// Performs the reset-vector bootstrap and seeds the ST system variables.
    ///
    /// A ROM image that begins with a plausible supervisor stack pointer has
    /// its first KiB mirrored to address 0, matching the GLUE's reset
    /// overlay. Anything else gets a synthesized reset frame: the PC points
    /// at the ROM base, except when no ROM is attached at all, where it
    /// points at [`RAM_BOOT_PC`] so handwritten programs in RAM can run
    /// without a TOS image.
    pub fn bootstrap_reset_vectors(&mut self) {
        let rom_ssp = if self.rom.len() >= 8 {
            let b = &self.rom;
            Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        } else {
            None
        };
        let ram_size = self.ram.len() as u32;

        match rom_ssp {
            Some(ssp) if ssp != 0 && ssp & 1 == 0 && ssp <= ram_size => {
                let n = self.rom.len().min(1024);
                self.ram[..n].copy_from_slice(&self.rom[..n]);
            }
            _ => {
                let ssp = (ram_size - 4) & !1;
                let pc = if self.rom.is_empty() {
                    RAM_BOOT_PC
                } else {
                    ROM_BASE
                };
                self.write_long(0, ssp);
                self.write_long(4, pc);
                // Unset exception vectors point at the reset PC so stray
                // exceptions land somewhere defined.
                for vector in 2..64u32 {
                    self.write_long(vector * 4, pc);
                }
            }
        }

        self.write_long(MEMVALID, MEMVALID_MAGIC);
        self.write_byte(MEMCNTLR, self.glue.memory_controller_nibble());
        self.write_long(PHYSTOP, ram_size);
        self.write_long(MEMBOT, 0x1000);
        self.write_long(MEMTOP, ram_size.saturating_sub(0x8000));
        self.write_long(MEMVALID2, MEMVALID2_MAGIC);
        self.write_long(MEMVALID3, MEMVALID3_MAGIC);
        // The bootstrap itself must not count as program bus traffic.
        self.fault = None;
        self.trace.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bus() -> StBus {
        StBus::new(512 * 1024, Region::Pal, 48_000)
    }

    #[test]
    fn ranges_are_disjoint() {
        let bus = bus();
        let map = bus.map();
        for (i, a) in map.iter().enumerate() {
            assert!(a.start <= a.end, "{} range inverted", a.name);
            for b in &map[i + 1..] {
                assert!(
                    a.end < b.start || b.end < a.start,
                    "{} overlaps {}",
                    a.name,
                    b.name
                );
            }
        }
    }

    #[test]
    fn ram_word_round_trip_is_big_endian() {
        let mut bus = bus();
        bus.write_word(0x1000, 0xBEEF);
        assert_eq!(bus.ram()[0x1000], 0xBE);
        assert_eq!(bus.ram()[0x1001], 0xEF);
        assert_eq!(bus.read_word(0x1000), 0xBEEF);
    }

    #[test]
    fn unmapped_access_latches_bus_error() {
        let mut bus = bus();
        // Above RAM, below the cartridge window.
        let value = bus.read_byte(0x40_0000);
        assert_eq!(value, 0);
        assert_eq!(bus.bus_errors(), 1);
        let latched = bus.last_bus_error().expect("latched fault");
        assert_eq!(latched.addr, 0x40_0000);
        assert!(!latched.is_write);
        assert_eq!(bus.take_fault(), Some(latched));
        assert_eq!(bus.take_fault(), None);

        bus.write_byte(0x40_0000, 0xAA);
        assert_eq!(bus.bus_errors(), 2);
        assert!(bus.last_bus_error().expect("latched").is_write);
    }

    #[test]
    fn addresses_mask_to_24_bits() {
        let mut bus = bus();
        bus.write_byte(0xFF00_2000, 0x5A);
        assert_eq!(bus.read_byte(0x2000), 0x5A);
        assert_eq!(bus.bus_errors(), 0);
    }

    #[test]
    fn rom_window_ignores_writes() {
        let mut bus = bus();
        bus.load_rom(Arc::from(vec![0x11u8; 16].into_boxed_slice()));
        bus.write_byte(ROM_BASE, 0x22);
        assert_eq!(bus.read_byte(ROM_BASE), 0x11);
    }

    #[test]
    fn missing_cartridge_reads_floating() {
        let mut bus = bus();
        assert_eq!(bus.read_byte(CART_BASE), 0xFF);
        assert_eq!(bus.bus_errors(), 0);
    }

    #[test]
    fn synthesized_reset_frame_without_rom() {
        let mut bus = bus();
        bus.bootstrap_reset_vectors();
        let ram_size = bus.ram_size() as u32;
        assert_eq!(bus.read_long(0), (ram_size - 4) & !1);
        assert_eq!(bus.read_long(4), RAM_BOOT_PC);
        assert_eq!(bus.read_long(MEMVALID), MEMVALID_MAGIC);
        assert_eq!(bus.read_long(PHYSTOP), ram_size);
        assert_eq!(bus.read_long(MEMVALID2), MEMVALID2_MAGIC);
        assert_eq!(bus.read_long(MEMVALID3), MEMVALID3_MAGIC);
    }

    #[test]
    fn rom_with_valid_ssp_is_mirrored_to_zero() {
        let mut bus = bus();
        let mut rom = vec![0u8; 1024];
        rom[..4].copy_from_slice(&0x0000_8000u32.to_be_bytes());
        rom[4..8].copy_from_slice(&(ROM_BASE + 0x30).to_be_bytes());
        bus.load_rom(Arc::from(rom.into_boxed_slice()));
        bus.bootstrap_reset_vectors();
        assert_eq!(bus.read_long(0), 0x8000);
        assert_eq!(bus.read_long(4), ROM_BASE + 0x30);
    }

    #[test]
    fn trace_records_master_and_region() {
        let mut bus = bus();
        bus.set_trace_enabled(true);
        bus.set_master(ComponentKey::Cpu);
        bus.write_byte(0x100, 0x42);
        let mut out = Vec::new();
        bus.drain_trace(&mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].master, ComponentKey::Cpu);
        assert_eq!(out[0].region, "ram");
        assert_eq!(out[0].access, AccessType::Write);
    }
}
