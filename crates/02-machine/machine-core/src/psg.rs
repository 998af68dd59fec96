//! PSG (YM2149): three tone channels, noise, envelope, and the GPIO ports
//! that drive floppy select lines.
//!
//! Register access follows the ST's latch protocol: a write to `0xFF8800`
//! selects a register, a write to `0xFF8802` stores into the selected one,
//! and a read of `0xFF8800` returns the selected register. The synthesis
//! clock is one eighth of the CPU clock; rendering resamples the mono mix
//! to the configured output rate.

use serde::{Deserialize, Serialize};

/// PSG step rate relative to the CPU clock.
const PSG_DIVIDER: u32 = 8;
/// CPU clock the divider applies to.
const CPU_HZ: u32 = 8_000_000;

const REG_PORT_A: usize = 14;
const REG_PORT_B: usize = 15;

/// Port A bit driving the floppy side-select line.
pub const PORT_A_SIDE: u8 = 0x01;
/// Port A bit selecting drive A (active low).
pub const PORT_A_DRIVE_A: u8 = 0x02;
/// Port A bit selecting drive B (active low).
pub const PORT_A_DRIVE_B: u8 = 0x04;

/// A latched GPIO transition, published as a PSG GPIO event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpioTransition {
    /// 14 for port A, 15 for port B.
    pub port: u8,
    pub old_value: u8,
    pub new_value: u8,
}

/// Serializable PSG state block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PsgState {
    pub regs: [u8; 16],
    pub selected: u8,
    pub tone_counters: [u16; 3],
    pub tone_outputs: [bool; 3],
    pub noise_counter: u16,
    pub noise_lfsr: u32,
    pub envelope_counter: u32,
    pub envelope_step: u8,
    pub envelope_holding: bool,
    pub envelope_invert: bool,
}

pub struct Psg {
    state: PsgState,
    sample_rate: u32,
    /// Fractional PSG steps carried between rendered samples.
    step_accum: u64,
    transitions: Vec<GpioTransition>,
}

impl Psg {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            state: PsgState {
                noise_lfsr: 1,
                // All channels off in the mixer, ports as inputs.
                regs: {
                    let mut regs = [0u8; 16];
                    regs[7] = 0xFF;
                    regs
                },
                ..PsgState::default()
            },
            sample_rate,
            step_accum: 0,
            transitions: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        let sample_rate = self.sample_rate;
        *self = Psg::new(sample_rate);
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    // --- register window (offsets within 0xFF8800..=0xFF8803) ---

    pub fn read_register(&self, offset: u32) -> u8 {
        match offset {
            0x00 => self.state.regs[(self.state.selected & 0x0F) as usize],
            _ => 0xFF,
        }
    }

    pub fn write_register(&mut self, offset: u32, value: u8) {
        match offset {
            0x00 => self.state.selected = value & 0x0F,
            0x02 => self.write_data(value),
            _ => {}
        }
    }

    fn write_data(&mut self, value: u8) {
        let index = (self.state.selected & 0x0F) as usize;
        let masked = match index {
            // Coarse tone periods are 4 bits, noise 5, envelope shape 4.
            1 | 3 | 5 | 13 => value & 0x0F,
            6 => value & 0x1F,
            8 | 9 | 10 => value & 0x1F,
            _ => value,
        };
        let old = self.state.regs[index];
        self.state.regs[index] = masked;
        if index == 13 {
            // Writing the shape register restarts the envelope.
            self.state.envelope_step = 0;
            self.state.envelope_counter = 0;
            self.state.envelope_holding = false;
            self.state.envelope_invert = false;
        }
        if (index == REG_PORT_A || index == REG_PORT_B) && old != masked {
            self.transitions.push(GpioTransition {
                port: index as u8,
                old_value: old,
                new_value: masked,
            });
        }
    }

    /// Side-effect-free register view for diffs and inspection.
    pub fn peek(&self, index: u32) -> u8 {
        self.state.regs[(index & 0x0F) as usize]
    }

    /// Drains GPIO transitions observed since the last drain.
    pub fn drain_gpio_transitions(&mut self, out: &mut Vec<GpioTransition>) {
        out.append(&mut self.transitions);
    }

    /// Drive-select state decoded from port A (active low).
    pub fn selected_drive(&self) -> Option<u8> {
        let port_a = self.state.regs[REG_PORT_A];
        if port_a & PORT_A_DRIVE_A == 0 {
            Some(0)
        } else if port_a & PORT_A_DRIVE_B == 0 {
            Some(1)
        } else {
            None
        }
    }

    /// Side-select line from port A.
    pub fn selected_side(&self) -> u8 {
        // Active low: cleared bit selects side 1.
        if self.state.regs[REG_PORT_A] & PORT_A_SIDE == 0 {
            1
        } else {
            0
        }
    }

    // --- synthesis ---

    fn tone_period(&self, channel: usize) -> u16 {
        let fine = self.state.regs[channel * 2] as u16;
        let coarse = (self.state.regs[channel * 2 + 1] as u16) << 8;
        (coarse | fine).max(1)
    }

    fn noise_period(&self) -> u16 {
        (self.state.regs[6] as u16).max(1)
    }

    fn envelope_period(&self) -> u32 {
        let fine = self.state.regs[11] as u32;
        let coarse = (self.state.regs[12] as u32) << 8;
        (coarse | fine).max(1)
    }

    /// Advances all oscillators by one PSG step.
    fn step(&mut self) {
        for channel in 0..3 {
            let period = self.tone_period(channel);
            self.state.tone_counters[channel] += 1;
            if self.state.tone_counters[channel] >= period {
                self.state.tone_counters[channel] = 0;
                self.state.tone_outputs[channel] = !self.state.tone_outputs[channel];
            }
        }
        self.state.noise_counter += 1;
        if self.state.noise_counter >= self.noise_period() {
            self.state.noise_counter = 0;
            // 17-bit LFSR, taps 0 and 3.
            let lfsr = self.state.noise_lfsr;
            let bit = (lfsr ^ (lfsr >> 3)) & 1;
            self.state.noise_lfsr = (lfsr >> 1) | (bit << 16);
        }
        if !self.state.envelope_holding {
            self.state.envelope_counter += 1;
            if self.state.envelope_counter >= self.envelope_period() {
                self.state.envelope_counter = 0;
                self.advance_envelope();
            }
        }
    }

    fn advance_envelope(&mut self) {
        if self.state.envelope_step < 15 {
            self.state.envelope_step += 1;
            return;
        }
        let shape = self.state.regs[13];
        let continue_ = shape & 0x08 != 0;
        let hold = shape & 0x01 != 0;
        let alternate = shape & 0x02 != 0;
        if !continue_ || hold {
            self.state.envelope_holding = true;
        } else {
            if alternate {
                self.state.envelope_invert = !self.state.envelope_invert;
            }
            self.state.envelope_step = 0;
        }
    }

    fn envelope_level(&self) -> u8 {
        let shape = self.state.regs[13];
        if self.state.envelope_holding {
            let continue_ = shape & 0x08 != 0;
            let attack_final = (shape & 0x04 != 0) ^ (shape & 0x02 != 0);
            if continue_ && attack_final {
                return 15;
            }
            return 0;
        }
        let attack = (shape & 0x04 != 0) ^ self.state.envelope_invert;
        let step = self.state.envelope_step;
        if attack {
            step
        } else {
            15 - step
        }
    }

    fn channel_level(&self, channel: usize) -> u8 {
        let vol = self.state.regs[8 + channel];
        if vol & 0x10 != 0 {
            self.envelope_level()
        } else {
            vol & 0x0F
        }
    }

    /// Current mono mix sample across tones and noise.
    fn mix_sample(&self) -> i16 {
        let mixer = self.state.regs[7];
        let noise_bit = self.state.noise_lfsr & 1 != 0;
        let mut total = 0i32;
        for channel in 0..3 {
            let tone_enabled = mixer & (1 << channel) == 0;
            let noise_enabled = mixer & (1 << (channel + 3)) == 0;
            let tone_high = !tone_enabled || self.state.tone_outputs[channel];
            let noise_high = !noise_enabled || noise_bit;
            if tone_high && noise_high {
                // Logarithmic-ish 4-bit volume to amplitude.
                let level = self.channel_level(channel) as i32;
                total += (level * level) * 36;
            }
        }
        total.clamp(i16::MIN as i32, i16::MAX as i32) as i16
    }

    /// Renders `frames` of interleaved PCM at the configured sample rate.
    ///
    /// `out` is filled with `frames * channels` samples; the mono bus is
    /// duplicated across channels.
    pub fn render_audio_chunk(&mut self, frames: usize, channels: usize, out: &mut [i16]) {
        assert!(
            out.len() >= frames * channels,
            "audio buffer too small (have {}, need {})",
            out.len(),
            frames * channels
        );
        let steps_per_second = (CPU_HZ / PSG_DIVIDER) as u64;
        for frame in 0..frames {
            self.step_accum += steps_per_second;
            while self.step_accum >= self.sample_rate as u64 {
                self.step_accum -= self.sample_rate as u64;
                self.step();
            }
            let sample = self.mix_sample();
            for channel in 0..channels {
                out[frame * channels + channel] = sample;
            }
        }
    }

    pub fn state(&self) -> &PsgState {
        &self.state
    }

    pub fn restore(&mut self, state: PsgState) {
        self.state = state;
        self.step_accum = 0;
        self.transitions.clear();
    }
}
