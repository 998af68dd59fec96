//! Per-request command objects the transport hands to the core.

use crate::session::{ClockMode, MediaDescriptor, MediaSlot, ResumeMode};
use serde::Serialize;

/// Lifecycle commands; guard evaluation happens inside the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleCmd {
    Start {
        machine: String,
        profile: String,
        rom_id: Option<String>,
    },
    Pause,
    Resume {
        target: ResumeMode,
    },
    Reset,
    SuspendSave {
        name: String,
    },
    RestoreResume {
        snapshot_id: String,
        resume_mode: ResumeMode,
    },
    Stop,
}

impl LifecycleCmd {
    /// Canonical endpoint binding, surfaced in guard rejection details.
    pub fn endpoint(&self) -> &'static str {
        match self {
            LifecycleCmd::Start { .. } => "/api/v2/session/start",
            LifecycleCmd::Pause => "/api/v2/session/pause",
            LifecycleCmd::Resume { .. } => "/api/v2/session/resume",
            LifecycleCmd::Reset => "/api/v2/session/reset",
            LifecycleCmd::SuspendSave { .. } => "/api/v2/session/suspend",
            LifecycleCmd::RestoreResume { .. } => "/api/v2/session/restore",
            LifecycleCmd::Stop => "/api/v2/session/stop",
        }
    }
}

/// Debug clock commands committed at tick boundaries.
#[derive(Clone, Debug, PartialEq)]
pub enum ClockCmd {
    /// Atomic mode change; idempotent re-issues do not bump the seq.
    SetMode { mode: ClockMode },
    /// Commit exactly `steps` ticks while in single-step mode.
    Step { steps: u32 },
}

/// Snapshot commands serviced under the snapshot gate.
#[derive(Clone, Debug, PartialEq)]
pub enum SnapshotCmd {
    Save { name: String },
    Restore { snapshot_id: String, resume_mode: ResumeMode },
}

/// Media attach/eject against a resolved descriptor.
#[derive(Clone, Debug, PartialEq)]
pub enum MediaCmd {
    Attach {
        slot: MediaSlot,
        descriptor: MediaDescriptor,
    },
    Eject {
        slot: MediaSlot,
    },
}

/// Read-only inspection requests serviced at tick boundaries.
#[derive(Clone, Debug, PartialEq)]
pub enum InspectCmd {
    /// CPU register file copy.
    CpuRegisters,
    /// Chip register block copy by component name.
    ChipRegisters { component: String },
    /// Bounded memory window copy.
    MemoryWindow { base: u32, len: u32 },
    /// Bus error counters and the latched faulting access.
    BusStatus,
}

/// Latched faulting access record captured per committed instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BusErrorRecord {
    pub addr: u32,
    pub is_write: bool,
}

/// Opcode/bus-error capture emitted by single-step responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CapturePayload {
    pub tick: u64,
    pub cycle: u64,
    pub pc: u32,
    pub opcode: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus_error: Option<BusErrorRecord>,
}

/// Arbitration statistics aggregated over a step request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ArbStats {
    pub rounds: u64,
    pub slots: u64,
    pub wait_cycles: u64,
}

/// Aggregated response for an accepted single-step request.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StepOutcome {
    pub tick_before: u64,
    pub tick_after: u64,
    pub cycle_before: u64,
    pub cycle_after: u64,
    pub arb: ArbStats,
    pub capture_payloads: Vec<CapturePayload>,
}

/// Response to a clock mode change request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ModeChangeOutcome {
    /// False when the request was an idempotent re-issue.
    pub transition_applied: bool,
    pub mode_transition_seq: u64,
}
