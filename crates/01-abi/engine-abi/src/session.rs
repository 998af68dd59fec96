//! Session, profile, and media binding types.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Lifecycle states of the singleton emulation session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Paused,
    Suspended,
    Faulted,
    Stopping,
}

impl LifecycleState {
    /// Canonical lowercase name used in wire payloads and error details.
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Paused => "paused",
            LifecycleState::Suspended => "suspended",
            LifecycleState::Faulted => "faulted",
            LifecycleState::Stopping => "stopping",
        }
    }
}

/// Debug clock mode driving the scheduler's pacing.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ClockMode {
    /// Wall-clock pacing at the profile's native rate.
    Realtime,
    /// Wall-clock pacing scaled by `ratio`, which must lie in `(0, 1]`.
    SlowMotion { ratio: f64 },
    /// Continuous advancement blocked; ticks commit only via step requests.
    SingleStep,
}

impl ClockMode {
    /// Effective wall-clock ratio for this mode (1.0 outside slow motion).
    pub fn effective_ratio(self) -> f64 {
        match self {
            ClockMode::SlowMotion { ratio } => ratio,
            _ => 1.0,
        }
    }

    /// Wire name of the run mode.
    pub fn as_str(self) -> &'static str {
        match self {
            ClockMode::Realtime => "realtime",
            ClockMode::SlowMotion { .. } => "slow_motion",
            ClockMode::SingleStep => "single_step",
        }
    }
}

/// Target state when resuming from `paused` or `suspended`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    Running,
    Paused,
}

/// Video region timing variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Region {
    Pal,
    Ntsc,
}

/// Component keys appearing in a profile's step order and in telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKey {
    Cpu,
    Glue,
    Shifter,
    Mfp,
    Psg,
    Acia,
    Dma,
}

impl ComponentKey {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKey::Cpu => "cpu",
            ComponentKey::Glue => "glue",
            ComponentKey::Shifter => "shifter",
            ComponentKey::Mfp => "mfp",
            ComponentKey::Psg => "psg",
            ComponentKey::Acia => "acia",
            ComponentKey::Dma => "dma",
        }
    }
}

/// Versions of the required modules, compared during snapshot restore.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleVersions {
    pub cpu: String,
    pub video: String,
    pub io: String,
    pub audio: String,
    pub storage: String,
    pub machine_profile: String,
}

impl ModuleVersions {
    /// Flattens into the `abi.modules{}` map persisted in snapshot headers.
    pub fn as_map(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("cpu".into(), self.cpu.clone()),
            ("video".into(), self.video.clone()),
            ("io".into(), self.io.clone()),
            ("audio".into(), self.audio.clone()),
            ("storage".into(), self.storage.clone()),
            ("machine_profile".into(), self.machine_profile.clone()),
        ])
    }
}

/// Immutable machine profile selected at session start.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProfileManifest {
    /// Profile identifier, e.g. `st_520_pal`.
    pub name: String,
    pub machine: String,
    pub ram_kb: u32,
    pub region: Region,
    /// Scheduler tick frequency in Hz (scanline rate for ST profiles).
    pub tick_hz: u32,
    /// Ordered component keys processed each committed tick.
    pub step_order: Vec<ComponentKey>,
    pub modules: ModuleVersions,
    /// Region-dependent ROM identifier expected by G-START-02.
    pub rom_id: Option<String>,
}

/// Media slot identifiers accepted by attach/eject.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaSlot {
    Rom,
    FloppyA,
    FloppyB,
    Cartridge,
}

impl MediaSlot {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaSlot::Rom => "rom",
            MediaSlot::FloppyA => "floppy_a",
            MediaSlot::FloppyB => "floppy_b",
            MediaSlot::Cartridge => "cartridge",
        }
    }
}

/// Resolved media asset handed to the core by the catalog collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDescriptor {
    pub path: PathBuf,
    /// Lowercase hex sha256 of the asset contents.
    pub sha256: String,
    pub size: u64,
}

/// A descriptor bound into a slot, persisted inside snapshots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaBinding {
    pub slot: MediaSlot,
    pub descriptor: MediaDescriptor,
}

/// Point-in-time view of the session, produced for status queries.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub machine: String,
    pub profile: String,
    pub lifecycle_state: LifecycleState,
    /// `realtime | slow_motion | paused | single_step`.
    pub run_mode: String,
    pub uptime_ms: u64,
    pub tick_counter: u64,
    pub cycle_counter: u64,
    pub last_transition_at_us: u64,
    pub last_error: Option<String>,
}
