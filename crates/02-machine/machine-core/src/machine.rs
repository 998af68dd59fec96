//! The machine context: CPU, bus, and fabric owned as one value.
//!
//! Lifecycle start constructs a [`Machine`]; stop drops it. The scheduler
//! thread owns it exclusively and drives [`Machine::run_tick`], which
//! executes up to one scanline of CPU work and then clocks every chip with
//! the exact cycle count the CPU consumed, in the profile's step order.

use crate::bus::StBus;
use crate::cpu::Cpu;
use crate::fabric::{Fabric, HookOrderViolation};
use crate::fdc::MAX_REQUESTS_PER_WINDOW;
use crate::state::MachineState;
use engine_abi::{BusErrorRecord, ComponentKey, Region};

/// Construction parameters distilled from a machine profile.
#[derive(Clone, Debug, PartialEq)]
pub struct MachineConfig {
    pub ram_bytes: usize,
    pub region: Region,
    pub sample_rate: u32,
    pub step_order: Vec<ComponentKey>,
    /// DMA byte budget granted per arbitration window.
    pub dma_window_bytes: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_bytes: 512 * 1024,
            region: Region::Pal,
            sample_rate: 48_000,
            step_order: vec![
                ComponentKey::Cpu,
                ComponentKey::Glue,
                ComponentKey::Shifter,
                ComponentKey::Mfp,
                ComponentKey::Psg,
                ComponentKey::Acia,
                ComponentKey::Dma,
            ],
            dma_window_bytes: MAX_REQUESTS_PER_WINDOW,
        }
    }
}

/// Observations from one committed tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TickReport {
    /// CPU cycles actually consumed.
    pub cycles: u32,
    /// A full frame elapsed during this tick.
    pub frame_ready: bool,
    /// Opcode word of the last committed instruction.
    pub last_opcode: u16,
    /// PC before the tick's first instruction.
    pub pc_before: u32,
    /// Faulting access captured during the tick, if any.
    pub bus_error: Option<BusErrorRecord>,
}

pub struct Machine {
    pub cpu: Cpu,
    pub bus: StBus,
    pub fabric: Fabric,
    config: MachineConfig,
}

impl Machine {
    pub fn new(config: MachineConfig) -> Self {
        let bus = StBus::new(config.ram_bytes, config.region, config.sample_rate);
        let fabric = Fabric::new(config.step_order.clone());
        Self {
            cpu: Cpu::new(),
            bus,
            fabric,
            config,
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Full machine reset: chips, reset vectors, then the CPU.
    pub fn reset(&mut self) {
        self.bus.glue.reset();
        self.bus.shifter.reset();
        self.bus.mfp.reset();
        self.bus.psg.reset();
        self.bus.acia.reset();
        self.bus.dma.reset();
        self.fabric.reset();
        self.bus.bootstrap_reset_vectors();
        self.cpu.reset(&mut self.bus);
    }

    /// Runs one committed tick: IRQ resolve, CPU slice, chip clocks.
    ///
    /// `tick` and `cycle` are the scheduler's counters before this tick;
    /// they only stamp the arbitration hook records.
    pub fn run_tick(&mut self, tick: u64, cycle: u64) -> Result<TickReport, HookOrderViolation> {
        self.fabric.begin_tick(tick, cycle)?;

        // 1. Resolve the highest eligible interrupt into the CPU.
        if self.cpu.pending_interrupt().is_none() {
            if let Some(irq) = self.fabric.resolve(&mut self.bus, self.cpu.ipl()) {
                self.cpu.set_pending_interrupt(irq.level, irq.vector);
            }
        }

        // 2. Up to one scanline of CPU work, clamped to the line remainder.
        let budget = self.bus.glue.cycles_to_line_end();
        let pc_before = self.cpu.pc;
        self.bus.set_master(ComponentKey::Cpu);
        let cycles = self.cpu.execute(&mut self.bus, budget);

        // 3. Clock every chip with the exact consumed count, in step order.
        let mut report = TickReport {
            cycles,
            frame_ready: false,
            last_opcode: self.cpu.last_opcode(),
            pc_before,
            bus_error: self.cpu.take_last_fault(),
        };
        for index in 0..self.fabric.step_order().len() {
            let component = self.fabric.step_order()[index];
            let mut bus_owner = ComponentKey::Cpu;
            let mut wait_cycles = 0u32;
            match component {
                ComponentKey::Cpu => {
                    // The CPU slice above was this component's step.
                }
                ComponentKey::Glue => self.bus.glue.clock(cycles),
                ComponentKey::Shifter => {
                    // Video fetch is folded into render time; the counter
                    // read-back registers advance at frame granularity.
                }
                ComponentKey::Mfp => self.bus.mfp.clock(cycles),
                ComponentKey::Psg => {
                    // Synthesis advances inside render_audio_chunk.
                }
                ComponentKey::Acia => {
                    self.bus.set_master(ComponentKey::Acia);
                    self.bus.acia.clock(cycles);
                }
                ComponentKey::Dma => {
                    self.bus.set_master(ComponentKey::Dma);
                    let moved = self.bus.clock_dma(cycles, self.config.dma_window_bytes);
                    if moved > 0 {
                        bus_owner = ComponentKey::Dma;
                        // Each word the DMA moves steals four bus cycles.
                        wait_cycles = moved.div_ceil(2) * 4;
                    }
                }
            }
            self.fabric.component_step(component, bus_owner, wait_cycles)?;
        }
        self.bus.set_master(ComponentKey::Cpu);

        report.frame_ready = self.bus.glue.take_frame_ready();
        if report.frame_ready {
            self.bus.shifter.begin_frame();
        }
        self.fabric.end_tick()?;
        Ok(report)
    }

    /// Renders the current frame into `out` as RGB565, returning (w, h).
    pub fn render_frame(&self, out: &mut [u16]) -> (u16, u16) {
        let (width, height) = self.bus.shifter.mode().dimensions();
        assert!(
            out.len() >= width as usize * height as usize,
            "frame buffer too small"
        );
        for y in 0..height {
            let start = y as usize * width as usize;
            self.bus
                .shifter
                .render_scanline(self.bus.ram(), y as u32, &mut out[start..start + width as usize]);
        }
        (width, height)
    }

    /// Captures all component state plus the RAM image.
    pub fn state(&self) -> MachineState {
        MachineState {
            cpu: self.cpu.state(),
            glue: self.bus.glue.state().clone(),
            shifter: self.bus.shifter.state().clone(),
            mfp: self.bus.mfp.state().clone(),
            psg: self.bus.psg.state().clone(),
            acia_keyboard: self.bus.acia.keyboard.state().clone(),
            acia_midi: self.bus.acia.midi.state().clone(),
            ikbd: self.bus.acia.ikbd_state().clone(),
            dma: self.bus.dma.state().clone(),
            ram: self.bus.ram().to_vec(),
        }
    }

    /// Rehydrates every component from `state`.
    ///
    /// RAM length must match the configured size; the caller is expected to
    /// have validated profile compatibility first.
    pub fn restore(&mut self, state: MachineState) -> Result<(), String> {
        if state.ram.len() != self.bus.ram_size() {
            return Err(format!(
                "ram size mismatch: snapshot {} bytes, machine {} bytes",
                state.ram.len(),
                self.bus.ram_size()
            ));
        }
        self.cpu.restore(state.cpu);
        self.bus.glue.restore(state.glue);
        self.bus.shifter.restore(state.shifter);
        self.bus.mfp.restore(state.mfp);
        self.bus.psg.restore(state.psg);
        self.bus
            .acia
            .restore(state.acia_keyboard, state.acia_midi, state.ikbd);
        self.bus.dma.restore(state.dma);
        self.bus.ram_mut().copy_from_slice(&state.ram);
        Ok(())
    }
}
