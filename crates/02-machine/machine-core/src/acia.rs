//! 6850 ACIA pair and the IKBD keyboard controller bridge.
//!
//! The keyboard ACIA at `0xFFFC00/02` talks to an HD6301-style IKBD: the
//! ST sends command bytes, the IKBD answers with scancodes, mouse packets,
//! and joystick reports. The serial link runs at 7812.5 bit/s, 8N1, which
//! pins the inter-character gap at 1024 CPU cycles per byte; host-injected
//! events honour that pacing instead of appearing instantaneously. The
//! MIDI ACIA at `0xFFFC04/06` is modelled with no device attached.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// CPU cycles per serialized IKBD byte (8 MHz / 7812.5 baud * 10 bits).
pub const CYCLES_PER_BYTE: u32 = 1024;

/// RX FIFO depth on the parser side before pacing pushes back.
const IKBD_QUEUE_LIMIT: usize = 256;

// Status register bits.
const STATUS_RDRF: u8 = 0x01;
const STATUS_TDRE: u8 = 0x02;
const STATUS_IRQ: u8 = 0x80;

/// Serializable state of one 6850.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AciaState {
    pub control: u8,
    pub rx: Option<u8>,
    pub overrun: bool,
}

/// One 6850 channel.
#[derive(Clone, Debug, Default)]
pub struct Acia {
    state: AciaState,
}

impl Acia {
    pub fn reset(&mut self) {
        self.state = AciaState::default();
    }

    pub fn status(&self) -> u8 {
        let mut status = STATUS_TDRE;
        if self.state.rx.is_some() {
            status |= STATUS_RDRF;
            // RX interrupts enabled via control bit 7.
            if self.state.control & 0x80 != 0 {
                status |= STATUS_IRQ;
            }
        }
        status
    }

    pub fn irq_pending(&self) -> bool {
        self.state.rx.is_some() && self.state.control & 0x80 != 0
    }

    pub fn rx_full(&self) -> bool {
        self.state.rx.is_some()
    }

    /// Delivers a byte from the device side.
    pub fn deliver(&mut self, byte: u8) {
        if self.state.rx.is_some() {
            self.state.overrun = true;
        }
        self.state.rx = Some(byte);
    }

    pub fn read_data(&mut self) -> u8 {
        self.state.overrun = false;
        self.state.rx.take().unwrap_or(0)
    }

    pub fn write_control(&mut self, value: u8) {
        // Master reset via the divider bits.
        if value & 0x03 == 0x03 {
            self.reset();
        }
        self.state.control = value;
    }

    pub fn state(&self) -> &AciaState {
        &self.state
    }

    pub fn restore(&mut self, state: AciaState) {
        self.state = state;
    }
}

/// IKBD reporting modes for the mouse.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MouseMode {
    #[default]
    Relative,
    Disabled,
}

/// Serializable IKBD controller state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IkbdState {
    pub mouse_mode: MouseMode,
    pub joystick_reporting: bool,
    pub mouse_buttons: u8,
    pub joystick_state: u8,
    /// Bytes awaiting serialization towards the ST.
    pub out_queue: VecDeque<u8>,
    /// Pending multi-byte command and how many parameters it still needs.
    pub command: Option<(u8, u8)>,
    pub pace_countdown: u32,
}

/// Keyboard ACIA + IKBD parser + MIDI ACIA, registered as one bus window.
pub struct AciaBridge {
    pub keyboard: Acia,
    pub midi: Acia,
    ikbd: IkbdState,
}

impl AciaBridge {
    pub fn new() -> Self {
        Self {
            keyboard: Acia::default(),
            midi: Acia::default(),
            ikbd: IkbdState::default(),
        }
    }

    pub fn reset(&mut self) {
        self.keyboard.reset();
        self.midi.reset();
        self.ikbd = IkbdState::default();
    }

    /// Register window: `0xFFFC00..=0xFFFC07`, data/status on even bytes.
    pub fn read_register(&mut self, offset: u32) -> u8 {
        match offset {
            0x00 => self.keyboard.status(),
            0x02 => self.keyboard.read_data(),
            0x04 => self.midi.status(),
            0x06 => self.midi.read_data(),
            _ => 0,
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u8) {
        match offset {
            0x00 => self.keyboard.write_control(value),
            0x02 => self.command_byte(value),
            0x04 => self.midi.write_control(value),
            // MIDI out has no listener.
            0x06 => {}
            _ => {}
        }
    }

    /// Side-effect-free register view for diffs and inspection.
    pub fn peek(&self, offset: u32) -> u8 {
        match offset {
            0x00 => self.keyboard.status(),
            0x02 => self.keyboard.state().rx.unwrap_or(0),
            0x04 => self.midi.status(),
            0x06 => self.midi.state().rx.unwrap_or(0),
            _ => 0,
        }
    }

    pub fn irq_pending(&self) -> bool {
        self.keyboard.irq_pending() || self.midi.irq_pending()
    }

    /// Handles a command byte sent from the ST to the IKBD.
    fn command_byte(&mut self, byte: u8) {
        if let Some((command, remaining)) = self.ikbd.command {
            if remaining > 1 {
                self.ikbd.command = Some((command, remaining - 1));
            } else {
                self.ikbd.command = None;
                if command == 0x80 && byte == 0x01 {
                    // RESET acknowledges with the version byte.
                    self.ikbd = IkbdState::default();
                    self.enqueue(0xF0);
                }
            }
            return;
        }
        match byte {
            0x80 => self.ikbd.command = Some((0x80, 1)),
            0x08 => self.ikbd.mouse_mode = MouseMode::Relative,
            0x12 => self.ikbd.mouse_mode = MouseMode::Disabled,
            0x14 => self.ikbd.joystick_reporting = true,
            0x1A => self.ikbd.joystick_reporting = false,
            // Commands with parameters we accept and discard.
            0x07 => self.ikbd.command = Some((0x07, 1)),
            0x09 => self.ikbd.command = Some((0x09, 4)),
            0x0A => self.ikbd.command = Some((0x0A, 2)),
            0x0B => self.ikbd.command = Some((0x0B, 2)),
            0x17 => self.ikbd.command = Some((0x17, 1)),
            0x19 => self.ikbd.command = Some((0x19, 6)),
            0x20 => self.ikbd.command = Some((0x20, 3)),
            0x21 => self.ikbd.command = Some((0x21, 2)),
            _ => {}
        }
    }

    fn enqueue(&mut self, byte: u8) {
        if self.ikbd.out_queue.len() < IKBD_QUEUE_LIMIT {
            self.ikbd.out_queue.push_back(byte);
        }
    }

    // --- host-side injection ---

    /// Injects a key make/break; `scancode` is the IKBD code, break adds 0x80.
    pub fn inject_key(&mut self, scancode: u8, pressed: bool) {
        let byte = if pressed {
            scancode & 0x7F
        } else {
            scancode | 0x80
        };
        self.enqueue(byte);
    }

    /// Injects a relative mouse movement packet.
    pub fn inject_mouse_move(&mut self, dx: i16, dy: i16) {
        if self.ikbd.mouse_mode == MouseMode::Disabled {
            return;
        }
        // Large deltas split into clamped packets.
        let mut dx = dx;
        let mut dy = dy;
        loop {
            let sx = dx.clamp(-127, 127);
            let sy = dy.clamp(-127, 127);
            self.enqueue(0xF8 | self.ikbd.mouse_buttons);
            self.enqueue(sx as u8);
            self.enqueue(sy as u8);
            dx -= sx;
            dy -= sy;
            if dx == 0 && dy == 0 {
                break;
            }
        }
    }

    /// Injects a mouse button edge; bit 1 = left, bit 0 = right.
    pub fn inject_mouse_button(&mut self, button_bit: u8, pressed: bool) {
        if pressed {
            self.ikbd.mouse_buttons |= button_bit & 0x03;
        } else {
            self.ikbd.mouse_buttons &= !(button_bit & 0x03);
        }
        if self.ikbd.mouse_mode != MouseMode::Disabled {
            self.enqueue(0xF8 | self.ikbd.mouse_buttons);
            self.enqueue(0);
            self.enqueue(0);
        }
    }

    /// Injects joystick 1 state: direction bits 0..=3, fire bit 7.
    pub fn inject_joystick(&mut self, state: u8) {
        self.ikbd.joystick_state = state;
        if self.ikbd.joystick_reporting {
            self.enqueue(0xFF);
            self.enqueue(state);
        }
    }

    /// Advances the serial pacing; at most one byte per 1024 cycles crosses
    /// from the IKBD queue into the ACIA receive register.
    pub fn clock(&mut self, cycles: u32) {
        let mut budget = cycles;
        while budget > 0 {
            if self.ikbd.pace_countdown > 0 {
                let step = budget.min(self.ikbd.pace_countdown);
                self.ikbd.pace_countdown -= step;
                budget -= step;
                continue;
            }
            if self.keyboard.rx_full() || self.ikbd.out_queue.is_empty() {
                break;
            }
            let byte = self.ikbd.out_queue.pop_front().expect("queue non-empty");
            self.keyboard.deliver(byte);
            self.ikbd.pace_countdown = CYCLES_PER_BYTE;
        }
    }

    pub fn ikbd_state(&self) -> &IkbdState {
        &self.ikbd
    }

    pub fn restore(&mut self, keyboard: AciaState, midi: AciaState, ikbd: IkbdState) {
        self.keyboard.restore(keyboard);
        self.midi.restore(midi);
        self.ikbd = ikbd;
    }
}

impl Default for AciaBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_injection_paces_at_serial_rate() {
        let mut bridge = AciaBridge::new();
        bridge.inject_key(0x1C, true);
        bridge.inject_key(0x1C, false);
        bridge.clock(1);
        assert!(bridge.keyboard.rx_full(), "first byte delivers immediately");
        assert_eq!(bridge.read_register(0x02), 0x1C);
        // The next byte waits out the full inter-character gap.
        bridge.clock(CYCLES_PER_BYTE - 1);
        assert!(!bridge.keyboard.rx_full());
        bridge.clock(1);
        assert_eq!(bridge.read_register(0x02), 0x9C);
    }

    #[test]
    fn rx_interrupt_follows_control_bit() {
        let mut bridge = AciaBridge::new();
        bridge.write_register(0x00, 0x96); // RX IRQ enabled
        bridge.inject_key(0x01, true);
        bridge.clock(1);
        assert!(bridge.irq_pending());
        assert_eq!(bridge.read_register(0x00) & 0x81, 0x81);
        bridge.read_register(0x02);
        assert!(!bridge.irq_pending());
    }

    #[test]
    fn mouse_packet_is_three_bytes() {
        let mut bridge = AciaBridge::new();
        bridge.inject_mouse_move(5, -3);
        bridge.clock(CYCLES_PER_BYTE * 4);
        // Header delivered first.
        assert_eq!(bridge.read_register(0x02), 0xF8);
        bridge.clock(CYCLES_PER_BYTE);
        assert_eq!(bridge.read_register(0x02), 5);
        bridge.clock(CYCLES_PER_BYTE);
        assert_eq!(bridge.read_register(0x02) as i8, -3);
    }

    #[test]
    fn reset_command_answers_with_version() {
        let mut bridge = AciaBridge::new();
        bridge.write_register(0x02, 0x80);
        bridge.write_register(0x02, 0x01);
        bridge.clock(1);
        assert_eq!(bridge.read_register(0x02), 0xF0);
    }

    #[test]
    fn disabled_mouse_drops_motion() {
        let mut bridge = AciaBridge::new();
        bridge.write_register(0x02, 0x12);
        bridge.inject_mouse_move(10, 10);
        bridge.clock(CYCLES_PER_BYTE * 8);
        assert!(!bridge.keyboard.rx_full());
    }

    #[test]
    fn joystick_reports_only_when_enabled() {
        let mut bridge = AciaBridge::new();
        bridge.inject_joystick(0x81);
        bridge.clock(CYCLES_PER_BYTE * 4);
        assert!(!bridge.keyboard.rx_full());
        bridge.write_register(0x02, 0x14);
        bridge.inject_joystick(0x81);
        bridge.clock(1);
        assert_eq!(bridge.read_register(0x02), 0xFF);
        bridge.clock(CYCLES_PER_BYTE);
        assert_eq!(bridge.read_register(0x02), 0x81);
    }

    #[test]
    fn midi_acia_reads_transmit_ready() {
        let mut bridge = AciaBridge::new();
        assert_eq!(bridge.read_register(0x04) & 0x02, 0x02);
        bridge.write_register(0x06, 0x42);
        assert!(!bridge.midi.rx_full());
    }
}
