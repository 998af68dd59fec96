//! Interrupt and arbitration fabric.
//!
//! Chips never call each other: they latch pending lines, and the fabric
//! closes the loop. Per committed tick the fabric bridges the ACIA and
//! FDC interrupt wires into the MFP GPIP inputs, then resolves the highest
//! eligible level against the CPU mask in the fixed order MFP → ACIA →
//! FDC/DMA → VBL → HBL. It also enumerates the per-tick arbitration hooks
//! (`pre_tick → component steps in profile order → post_tick`) and treats
//! any out-of-order invocation as a fatal internal error.

use crate::bus::StBus;
use engine_abi::ComponentKey;
use smallvec::SmallVec;
use thiserror::Error;

/// Autovector numbers for the GLUE-generated interrupts.
pub const AUTOVECTOR_HBL: u8 = 26;
pub const AUTOVECTOR_VBL: u8 = 28;

/// Kind of arbitration hook fired within a tick.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    PreTick,
    ComponentStep(ComponentKey),
    PostTick,
}

/// One arbitration hook record with deterministic ordering metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArbHook {
    pub tick_counter: u64,
    pub cycle_counter: u64,
    pub arbitration_round: u64,
    pub slot_index: u32,
    pub kind: HookKind,
    /// Component owning the bus during this slot.
    pub bus_owner: ComponentKey,
    pub wait_cycles: u32,
}

/// A resolved, acknowledged interrupt ready for the CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedIrq {
    pub level: u8,
    pub vector: u8,
}

/// Hook-order violation detail; surfaced as a fatal internal error upstream.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("arbitration hook fired out of order: expected slot {expected_slot}, got {got:?}")]
pub struct HookOrderViolation {
    pub expected_slot: u32,
    pub got: HookKind,
}

pub struct Fabric {
    step_order: Vec<ComponentKey>,
    round: u64,
    /// Slot cursor within the current tick; `None` outside a tick.
    cursor: Option<u32>,
    hooks: SmallVec<[ArbHook; 10]>,
    tick: u64,
    cycle: u64,
}

impl Fabric {
    pub fn new(step_order: Vec<ComponentKey>) -> Self {
        Self {
            step_order,
            round: 0,
            cursor: None,
            hooks: SmallVec::new(),
            tick: 0,
            cycle: 0,
        }
    }

    pub fn step_order(&self) -> &[ComponentKey] {
        &self.step_order
    }

    pub fn reset(&mut self) {
        self.round = 0;
        self.cursor = None;
        self.hooks.clear();
    }

    // --- interrupt resolution ---

    /// Bridges chip interrupt wires and resolves the highest pending level
    /// eligible against `cpu_ipl`. Acknowledgement happens here: the owning
    /// chip's pending bit is cleared and the vector captured.
    pub fn resolve(&mut self, bus: &mut StBus, cpu_ipl: u8) -> Option<ResolvedIrq> {
        // Wire bridging, in the fabric's fixed consideration order.
        let acia_irq = bus.acia.irq_pending();
        bus.mfp.set_gpip_line(4, !acia_irq);
        let fdc_irq = bus.dma.intrq_pending();
        bus.mfp.set_gpip_line(5, !fdc_irq);

        if cpu_ipl < 6 {
            if let Some(channel) = bus.mfp.pending_channel() {
                let vector = bus.mfp.acknowledge(channel);
                return Some(ResolvedIrq { level: 6, vector });
            }
        }
        if cpu_ipl < 4 && bus.glue.vbl_pending() {
            bus.glue.acknowledge_vbl();
            return Some(ResolvedIrq {
                level: 4,
                vector: AUTOVECTOR_VBL,
            });
        }
        if cpu_ipl < 2 && bus.glue.hbl_pending() {
            bus.glue.acknowledge_hbl();
            return Some(ResolvedIrq {
                level: 2,
                vector: AUTOVECTOR_HBL,
            });
        }
        None
    }

    // --- arbitration hooks ---

    /// Opens a new tick's hook sequence.
    pub fn begin_tick(&mut self, tick: u64, cycle: u64) -> Result<(), HookOrderViolation> {
        if self.cursor.is_some() {
            return Err(HookOrderViolation {
                expected_slot: 0,
                got: HookKind::PreTick,
            });
        }
        self.tick = tick;
        self.cycle = cycle;
        self.round += 1;
        self.cursor = Some(0);
        self.hooks.clear();
        self.push_hook(HookKind::PreTick, ComponentKey::Cpu, 0);
        Ok(())
    }

    /// Fires the next component-step hook; the component must match the
    /// profile's step order exactly.
    pub fn component_step(
        &mut self,
        component: ComponentKey,
        bus_owner: ComponentKey,
        wait_cycles: u32,
    ) -> Result<(), HookOrderViolation> {
        let Some(cursor) = self.cursor else {
            return Err(HookOrderViolation {
                expected_slot: 0,
                got: HookKind::ComponentStep(component),
            });
        };
        let step_index = cursor as usize;
        match self.step_order.get(step_index) {
            Some(expected) if *expected == component => {}
            _ => {
                return Err(HookOrderViolation {
                    expected_slot: cursor + 1,
                    got: HookKind::ComponentStep(component),
                });
            }
        }
        self.cursor = Some(cursor + 1);
        self.push_hook(HookKind::ComponentStep(component), bus_owner, wait_cycles);
        Ok(())
    }

    /// Closes the tick's hook sequence; every step-order slot must have fired.
    pub fn end_tick(&mut self) -> Result<(), HookOrderViolation> {
        let Some(cursor) = self.cursor else {
            return Err(HookOrderViolation {
                expected_slot: 0,
                got: HookKind::PostTick,
            });
        };
        if cursor as usize != self.step_order.len() {
            return Err(HookOrderViolation {
                expected_slot: cursor + 1,
                got: HookKind::PostTick,
            });
        }
        self.push_hook(HookKind::PostTick, ComponentKey::Cpu, 0);
        self.cursor = None;
        Ok(())
    }

    fn push_hook(&mut self, kind: HookKind, bus_owner: ComponentKey, wait_cycles: u32) {
        let slot_index = self.hooks.len() as u32;
        self.hooks.push(ArbHook {
            tick_counter: self.tick,
            cycle_counter: self.cycle,
            arbitration_round: self.round,
            slot_index,
            kind,
            bus_owner,
            wait_cycles,
        });
    }

    /// Hook records of the most recently completed tick.
    pub fn hooks(&self) -> &[ArbHook] {
        &self.hooks
    }

    pub fn arbitration_round(&self) -> u64 {
        self.round
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_abi::Region;

    fn full_order() -> Vec<ComponentKey> {
        vec![
            ComponentKey::Cpu,
            ComponentKey::Glue,
            ComponentKey::Shifter,
            ComponentKey::Mfp,
            ComponentKey::Psg,
            ComponentKey::Acia,
            ComponentKey::Dma,
        ]
    }

    fn run_tick(fabric: &mut Fabric) {
        fabric.begin_tick(1, 512).expect("begin");
        for component in full_order() {
            fabric
                .component_step(component, ComponentKey::Cpu, 0)
                .expect("step");
        }
        fabric.end_tick().expect("end");
    }

    #[test]
    fn hook_sequence_is_deterministic() {
        let mut fabric = Fabric::new(full_order());
        run_tick(&mut fabric);
        let hooks = fabric.hooks();
        assert_eq!(hooks.len(), 9);
        assert_eq!(hooks[0].kind, HookKind::PreTick);
        assert_eq!(hooks[8].kind, HookKind::PostTick);
        for (i, hook) in hooks.iter().enumerate() {
            assert_eq!(hook.slot_index, i as u32);
            assert_eq!(hook.arbitration_round, 1);
        }
    }

    #[test]
    fn out_of_order_component_is_rejected() {
        let mut fabric = Fabric::new(full_order());
        fabric.begin_tick(1, 0).expect("begin");
        let err = fabric
            .component_step(ComponentKey::Mfp, ComponentKey::Cpu, 0)
            .expect_err("wrong slot");
        assert_eq!(err.got, HookKind::ComponentStep(ComponentKey::Mfp));
    }

    #[test]
    fn early_end_tick_is_rejected() {
        let mut fabric = Fabric::new(full_order());
        fabric.begin_tick(1, 0).expect("begin");
        assert!(fabric.end_tick().is_err());
    }

    #[test]
    fn rounds_increment_per_tick() {
        let mut fabric = Fabric::new(full_order());
        run_tick(&mut fabric);
        run_tick(&mut fabric);
        assert_eq!(fabric.arbitration_round(), 2);
    }

    #[test]
    fn mfp_wins_over_vbl_and_hbl() {
        let mut fabric = Fabric::new(full_order());
        let mut bus = StBus::new(512 * 1024, Region::Pal, 48_000);
        // Arm an MFP timer channel and latch both GLUE interrupts.
        bus.mfp.write_register(0x07, 0x20); // IERA timer A
        bus.mfp.write_register(0x13, 0x20); // IMRA timer A
        bus.mfp.write_register(0x17, 0x40); // VR base 0x40
        bus.mfp.raise_channel(crate::mfp::CH_TIMER_A);
        bus.glue.clock(crate::glue::CYCLES_PER_LINE * 313);
        assert!(bus.glue.vbl_pending());

        let irq = fabric.resolve(&mut bus, 0).expect("mfp first");
        assert_eq!(irq.level, 6);
        assert_eq!(irq.vector, 0x40 | crate::mfp::CH_TIMER_A);
        // Leaving ISR set blocks the channel; VBL resolves next.
        let irq = fabric.resolve(&mut bus, 0).expect("vbl second");
        assert_eq!(irq.level, 4);
        assert_eq!(irq.vector, AUTOVECTOR_VBL);
        let irq = fabric.resolve(&mut bus, 0).expect("hbl last");
        assert_eq!(irq.level, 2);
        assert_eq!(irq.vector, AUTOVECTOR_HBL);
        assert!(fabric.resolve(&mut bus, 0).is_none());
    }

    #[test]
    fn cpu_mask_gates_low_levels() {
        let mut fabric = Fabric::new(full_order());
        let mut bus = StBus::new(512 * 1024, Region::Pal, 48_000);
        bus.glue.clock(crate::glue::CYCLES_PER_LINE);
        assert!(bus.glue.hbl_pending());
        assert!(fabric.resolve(&mut bus, 3).is_none());
        let irq = fabric.resolve(&mut bus, 1).expect("hbl above mask");
        assert_eq!(irq.level, 2);
    }

    #[test]
    fn acia_irq_bridges_into_gpip4() {
        let mut fabric = Fabric::new(full_order());
        let mut bus = StBus::new(512 * 1024, Region::Pal, 48_000);
        bus.mfp.write_register(0x09, 1 << crate::mfp::CH_GPIP4_ACIA); // IERB
        bus.mfp.write_register(0x15, 1 << crate::mfp::CH_GPIP4_ACIA); // IMRB
        // Raise then lower the line so the falling edge registers.
        fabric.resolve(&mut bus, 7);
        bus.acia.write_register(0x00, 0x96);
        bus.acia.inject_key(0x39, true);
        bus.acia.clock(1);
        assert!(bus.acia.irq_pending());
        let irq = fabric.resolve(&mut bus, 0).expect("acia via mfp");
        assert_eq!(irq.level, 6);
        assert_eq!(irq.vector & 0x0F, crate::mfp::CH_GPIP4_ACIA);
    }
}
