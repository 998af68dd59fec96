//! MFP 68901: GPIP, four timers, and the level-6 interrupt controller.
//!
//! Registers sit on odd addresses in the `0xFFFA01..=0xFFFA2F` window.
//! Interrupt channels are numbered 15 (GPIP7) down to 0 (GPIP0); pending
//! bits live in IPRA/IPRB, masking in IMRA/IMRB, and in-service bits in
//! ISRA/ISRB. The MFP runs in software end-of-interrupt mode: a channel
//! whose ISR bit is still set cannot re-fire until the handler clears it.

use serde::{Deserialize, Serialize};

// Register byte offsets within the window (odd addresses).
const REG_GPIP: u32 = 0x01;
const REG_AER: u32 = 0x03;
const REG_DDR: u32 = 0x05;
const REG_IERA: u32 = 0x07;
const REG_IERB: u32 = 0x09;
const REG_IPRA: u32 = 0x0B;
const REG_IPRB: u32 = 0x0D;
const REG_ISRA: u32 = 0x0F;
const REG_ISRB: u32 = 0x11;
const REG_IMRA: u32 = 0x13;
const REG_IMRB: u32 = 0x15;
const REG_VR: u32 = 0x17;
const REG_TACR: u32 = 0x19;
const REG_TBCR: u32 = 0x1B;
const REG_TCDCR: u32 = 0x1D;
const REG_TADR: u32 = 0x1F;
const REG_TBDR: u32 = 0x21;
const REG_TCDR: u32 = 0x23;
const REG_TDDR: u32 = 0x25;
const REG_SCR: u32 = 0x27;
const REG_UCR: u32 = 0x29;
const REG_RSR: u32 = 0x2B;
const REG_TSR: u32 = 0x2D;
const REG_UDR: u32 = 0x2F;

/// Interrupt channel numbers (bit positions across IPRA:IPRB).
pub const CH_TIMER_A: u8 = 13;
pub const CH_TIMER_B: u8 = 8;
pub const CH_TIMER_C: u8 = 5;
pub const CH_TIMER_D: u8 = 4;
pub const CH_GPIP4_ACIA: u8 = 6;
pub const CH_GPIP5_FDC: u8 = 7;

/// Timer identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerId {
    A,
    B,
    C,
    D,
}

impl TimerId {
    fn channel(self) -> u8 {
        match self {
            TimerId::A => CH_TIMER_A,
            TimerId::B => CH_TIMER_B,
            TimerId::C => CH_TIMER_C,
            TimerId::D => CH_TIMER_D,
        }
    }
}

/// Delay-mode prescaler decode shared by all four timers.
fn prescale(control: u8) -> Option<u32> {
    match control & 0x07 {
        0 => None,
        1 => Some(4),
        2 => Some(10),
        3 => Some(16),
        4 => Some(50),
        5 => Some(64),
        6 => Some(100),
        7 => Some(200),
        _ => unreachable!(),
    }
}

/// One timer's latched registers and running counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerState {
    pub control: u8,
    /// Reload value; zero counts as 256.
    pub data: u8,
    pub counter: u8,
    pub prescale_count: u32,
}

impl TimerState {
    /// Event-count mode for timers A/B (control = 8).
    fn event_mode(&self) -> bool {
        self.control & 0x0F == 0x08
    }
}

/// Serializable MFP state block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MfpState {
    pub gpip: u8,
    pub aer: u8,
    pub ddr: u8,
    pub iera: u8,
    pub ierb: u8,
    pub ipra: u8,
    pub iprb: u8,
    pub isra: u8,
    pub isrb: u8,
    pub imra: u8,
    pub imrb: u8,
    pub vr: u8,
    pub timers: [TimerState; 4],
    pub scr: u8,
    pub ucr: u8,
    pub rsr: u8,
    pub tsr: u8,
    pub udr: u8,
}

pub struct Mfp {
    state: MfpState,
}

impl Mfp {
    pub fn new() -> Self {
        Self {
            state: MfpState {
                // Transmit buffer empty out of reset.
                tsr: 0x80,
                ..MfpState::default()
            },
        }
    }

    pub fn reset(&mut self) {
        self.state = MfpState {
            tsr: 0x80,
            ..MfpState::default()
        };
    }

    // --- interrupt channel plumbing ---

    fn ier(&self, channel: u8) -> bool {
        if channel >= 8 {
            self.state.iera & (1 << (channel - 8)) != 0
        } else {
            self.state.ierb & (1 << channel) != 0
        }
    }

    fn set_ipr(&mut self, channel: u8) {
        if channel >= 8 {
            self.state.ipra |= 1 << (channel - 8);
        } else {
            self.state.iprb |= 1 << channel;
        }
    }

    fn isr_set(&self, channel: u8) -> bool {
        if channel >= 8 {
            self.state.isra & (1 << (channel - 8)) != 0
        } else {
            self.state.isrb & (1 << channel) != 0
        }
    }

    /// Raises `channel` if its enable bit is armed.
    pub fn raise_channel(&mut self, channel: u8) {
        if self.ier(channel) {
            self.set_ipr(channel);
        }
    }

    /// Highest pending channel that is enabled, unmasked, and not blocked
    /// by an in-service bit of equal or higher priority.
    pub fn pending_channel(&self) -> Option<u8> {
        let pending = ((self.state.ipra & self.state.imra) as u16) << 8
            | (self.state.iprb & self.state.imrb) as u16;
        if pending == 0 {
            return None;
        }
        let in_service = (self.state.isra as u16) << 8 | self.state.isrb as u16;
        let channel = 15 - pending.leading_zeros() as u8;
        // Software EOI: a same-or-higher in-service channel gates requests.
        if in_service != 0 && (15 - in_service.leading_zeros() as u8) >= channel {
            return None;
        }
        Some(channel)
    }

    /// True when the MFP is asserting its level-6 line.
    pub fn irq_pending(&self) -> bool {
        self.pending_channel().is_some()
    }

    /// CPU acknowledge: clears the pending bit, marks in-service, and
    /// returns the vector `(VR & 0xF0) | channel`.
    pub fn acknowledge(&mut self, channel: u8) -> u8 {
        if channel >= 8 {
            self.state.ipra &= !(1 << (channel - 8));
            self.state.isra |= 1 << (channel - 8);
        } else {
            self.state.iprb &= !(1 << channel);
            self.state.isrb |= 1 << channel;
        }
        (self.state.vr & 0xF0) | channel
    }

    /// Drives a GPIP input line; active-low transitions raise the channel.
    pub fn set_gpip_line(&mut self, bit: u8, level_high: bool) {
        let mask = 1 << bit;
        let old = self.state.gpip & mask != 0;
        if level_high {
            self.state.gpip |= mask;
        } else {
            self.state.gpip &= !mask;
        }
        let new = self.state.gpip & mask != 0;
        if old == new {
            return;
        }
        // AER bit selects the triggering edge: 0 = falling, 1 = rising.
        let rising = self.state.aer & mask != 0;
        if new == rising {
            let channel = match bit {
                0 => 0,
                1 => 1,
                2 => 2,
                3 => 3,
                4 => CH_GPIP4_ACIA,
                5 => CH_GPIP5_FDC,
                6 => 14,
                _ => 15,
            };
            self.raise_channel(channel);
        }
    }

    // --- timers ---

    fn timer_mut(&mut self, id: TimerId) -> &mut TimerState {
        &mut self.state.timers[id as usize]
    }

    fn clock_timer(&mut self, id: TimerId, cycles: u32) {
        let timer = self.timer_mut(id);
        if timer.event_mode() {
            return;
        }
        let Some(prescale) = prescale(timer.control) else {
            return;
        };
        timer.prescale_count += cycles;
        let mut expirations = 0u32;
        while timer.prescale_count >= prescale {
            timer.prescale_count -= prescale;
            timer.counter = timer.counter.wrapping_sub(1);
            if timer.counter == 0 {
                // A data value of zero counts a full 256 via the wrap.
                timer.counter = timer.data;
                expirations += 1;
            }
        }
        for _ in 0..expirations {
            self.raise_channel(id.channel());
        }
    }

    /// External pulse for event-count mode (timers A/B).
    pub fn pulse_event(&mut self, id: TimerId) {
        let channel = id.channel();
        let timer = self.timer_mut(id);
        if !timer.event_mode() {
            return;
        }
        timer.counter = timer.counter.wrapping_sub(1);
        if timer.counter == 0 {
            timer.counter = timer.data;
            self.raise_channel(channel);
        }
    }

    /// Advances all delay-mode timers by `cycles` CPU cycles.
    pub fn clock(&mut self, cycles: u32) {
        self.clock_timer(TimerId::A, cycles);
        self.clock_timer(TimerId::B, cycles);
        self.clock_timer(TimerId::C, cycles);
        self.clock_timer(TimerId::D, cycles);
    }

    // --- register window ---

    pub fn read_register(&self, offset: u32) -> u8 {
        match offset {
            REG_GPIP => self.state.gpip,
            REG_AER => self.state.aer,
            REG_DDR => self.state.ddr,
            REG_IERA => self.state.iera,
            REG_IERB => self.state.ierb,
            REG_IPRA => self.state.ipra,
            REG_IPRB => self.state.iprb,
            REG_ISRA => self.state.isra,
            REG_ISRB => self.state.isrb,
            REG_IMRA => self.state.imra,
            REG_IMRB => self.state.imrb,
            REG_VR => self.state.vr,
            REG_TACR => self.state.timers[0].control,
            REG_TBCR => self.state.timers[1].control,
            REG_TCDCR => (self.state.timers[2].control << 4) | self.state.timers[3].control,
            REG_TADR => self.state.timers[0].counter,
            REG_TBDR => self.state.timers[1].counter,
            REG_TCDR => self.state.timers[2].counter,
            REG_TDDR => self.state.timers[3].counter,
            REG_SCR => self.state.scr,
            REG_UCR => self.state.ucr,
            REG_RSR => self.state.rsr,
            REG_TSR => self.state.tsr,
            REG_UDR => self.state.udr,
            _ => 0,
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u8) {
        match offset {
            REG_GPIP => self.state.gpip = value,
            REG_AER => self.state.aer = value,
            REG_DDR => self.state.ddr = value,
            REG_IERA => {
                self.state.iera = value;
                // Disabling a channel also clears its pending bit.
                self.state.ipra &= value;
            }
            REG_IERB => {
                self.state.ierb = value;
                self.state.iprb &= value;
            }
            // IPR/ISR writes clear bits where zeros are written.
            REG_IPRA => self.state.ipra &= value,
            REG_IPRB => self.state.iprb &= value,
            REG_ISRA => self.state.isra &= value,
            REG_ISRB => self.state.isrb &= value,
            REG_IMRA => self.state.imra = value,
            REG_IMRB => self.state.imrb = value,
            REG_VR => self.state.vr = value,
            REG_TACR => self.write_timer_control(TimerId::A, value & 0x0F),
            REG_TBCR => self.write_timer_control(TimerId::B, value & 0x0F),
            REG_TCDCR => {
                self.write_timer_control(TimerId::C, (value >> 4) & 0x07);
                self.write_timer_control(TimerId::D, value & 0x07);
            }
            REG_TADR => self.write_timer_data(TimerId::A, value),
            REG_TBDR => self.write_timer_data(TimerId::B, value),
            REG_TCDR => self.write_timer_data(TimerId::C, value),
            REG_TDDR => self.write_timer_data(TimerId::D, value),
            REG_SCR => self.state.scr = value,
            REG_UCR => self.state.ucr = value,
            REG_RSR => self.state.rsr = value,
            REG_TSR => self.state.tsr = value,
            REG_UDR => self.state.udr = value,
            _ => {}
        }
    }

    fn write_timer_control(&mut self, id: TimerId, value: u8) {
        let timer = self.timer_mut(id);
        let was_stopped = timer.control & 0x0F == 0;
        timer.control = value;
        if was_stopped && value != 0 {
            timer.prescale_count = 0;
        }
    }

    fn write_timer_data(&mut self, id: TimerId, value: u8) {
        let timer = self.timer_mut(id);
        timer.data = value;
        // A stopped timer also latches the counter immediately.
        if timer.control & 0x0F == 0 {
            timer.counter = value;
        }
    }

    /// Side-effect-free register view for diffs and inspection.
    pub fn peek(&self, offset: u32) -> u8 {
        self.read_register(offset)
    }

    pub fn state(&self) -> &MfpState {
        &self.state
    }

    pub fn restore(&mut self, state: MfpState) {
        self.state = state;
    }
}

impl Default for Mfp {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armed_timer_a(mfp: &mut Mfp, prescaler_bits: u8, count: u8) {
        mfp.write_register(REG_VR, 0x40);
        mfp.write_register(REG_IERA, 1 << (CH_TIMER_A - 8));
        mfp.write_register(REG_IMRA, 1 << (CH_TIMER_A - 8));
        mfp.write_register(REG_TADR, count);
        mfp.write_register(REG_TACR, prescaler_bits);
    }

    #[test]
    fn timer_a_delay_mode_fires_after_prescaled_count() {
        let mut mfp = Mfp::new();
        // Prescaler 64, counter 192: 12288 cycles to expiry.
        armed_timer_a(&mut mfp, 0x05, 192);
        mfp.clock(12_287);
        assert!(!mfp.irq_pending());
        mfp.clock(1);
        assert!(mfp.irq_pending());
        assert_eq!(mfp.pending_channel(), Some(CH_TIMER_A));
    }

    #[test]
    fn acknowledge_returns_vector_and_blocks_refire() {
        let mut mfp = Mfp::new();
        armed_timer_a(&mut mfp, 0x01, 1);
        mfp.clock(4);
        let channel = mfp.pending_channel().expect("pending");
        let vector = mfp.acknowledge(channel);
        assert_eq!(vector, 0x40 | CH_TIMER_A);
        // Without clearing ISR the same channel must not re-fire.
        mfp.clock(8);
        assert_eq!(mfp.pending_channel(), None);
        // Clearing the in-service bit re-arms delivery.
        mfp.write_register(REG_ISRA, 0x00);
        mfp.clock(8);
        assert!(mfp.irq_pending());
    }

    #[test]
    fn masked_channel_does_not_assert_irq() {
        let mut mfp = Mfp::new();
        armed_timer_a(&mut mfp, 0x01, 1);
        mfp.write_register(REG_IMRA, 0x00);
        mfp.clock(16);
        assert!(!mfp.irq_pending());
        // Pending bit still latched, delivery resumes once unmasked.
        mfp.write_register(REG_IMRA, 1 << (CH_TIMER_A - 8));
        assert!(mfp.irq_pending());
    }

    #[test]
    fn gpip_falling_edge_raises_acia_channel() {
        let mut mfp = Mfp::new();
        mfp.write_register(REG_IERB, 1 << CH_GPIP4_ACIA);
        mfp.write_register(REG_IMRB, 1 << CH_GPIP4_ACIA);
        mfp.set_gpip_line(4, true);
        assert!(!mfp.irq_pending());
        mfp.set_gpip_line(4, false);
        assert_eq!(mfp.pending_channel(), Some(CH_GPIP4_ACIA));
    }

    #[test]
    fn event_count_mode_ignores_the_clock() {
        let mut mfp = Mfp::new();
        mfp.write_register(REG_IERA, 1 << (CH_TIMER_A - 8));
        mfp.write_register(REG_IMRA, 1 << (CH_TIMER_A - 8));
        mfp.write_register(REG_TADR, 2);
        mfp.write_register(REG_TACR, 0x08);
        mfp.clock(100_000);
        assert!(!mfp.irq_pending());
        mfp.pulse_event(TimerId::A);
        assert!(!mfp.irq_pending());
        mfp.pulse_event(TimerId::A);
        assert!(mfp.irq_pending());
    }

    #[test]
    fn timer_c_and_d_share_a_control_register() {
        let mut mfp = Mfp::new();
        mfp.write_register(REG_TCDCR, 0x51);
        assert_eq!(mfp.state().timers[2].control, 0x05);
        assert_eq!(mfp.state().timers[3].control, 0x01);
        assert_eq!(mfp.read_register(REG_TCDCR), 0x51);
    }
}
