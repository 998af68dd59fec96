//! Stream event payloads and filter contracts.

use crate::session::ComponentKey;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Canonical time base stamped onto every emitted event.
///
/// `tick` and `cycle` come from the scheduler's committed counters;
/// `timestamp_us` is the monotonic wall-clock emission stamp scaled by the
/// effective clock ratio.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct EventStamp {
    pub tick: u64,
    pub cycle: u64,
    pub timestamp_us: u64,
}

/// Envelope a publisher wraps around each payload before enqueueing.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamEvent<T> {
    /// Starts at 1 and increments by exactly 1 per emitted event.
    pub event_seq: u64,
    pub stamp: EventStamp,
    /// Events dropped from this subscription since the previous emission.
    pub dropped_events_since_last: u64,
    pub payload: T,
}

/// Pixel formats the video publisher can declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PixelFormat {
    Rgb565,
    Xrgb8888,
    Rgb888,
}

impl PixelFormat {
    /// Bytes per pixel for payload length validation.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Rgb565 => 2,
            PixelFormat::Xrgb8888 => 4,
            PixelFormat::Rgb888 => 3,
        }
    }
}

/// Metadata half of a `(metadata, binary)` video frame pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct VideoFrameMeta {
    pub frame_id: u64,
    pub width: u16,
    pub height: u16,
    pub pixel_format: PixelFormat,
    /// Must equal the binary payload length byte-exact.
    pub payload_bytes: usize,
}

/// Sample formats the audio publisher can declare.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioFormat {
    PcmS16le,
    PcmF32le,
}

impl AudioFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            AudioFormat::PcmS16le => 2,
            AudioFormat::PcmF32le => 4,
        }
    }
}

/// Metadata half of a `(metadata, binary)` audio chunk pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AudioChunkMeta {
    pub chunk_id: u64,
    pub sample_rate: u32,
    pub channels: u8,
    pub format: AudioFormat,
    pub frames: u32,
    /// Must equal `frames * channels * bytes_per_sample` exactly.
    pub payload_bytes: usize,
}

/// How register values are rendered on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueEncoding {
    Hex,
    Dec,
}

/// Emission cadence for the register diff stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffMode {
    Event,
    Interval,
}

/// One observed register mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RegisterDiffEvent {
    pub component: ComponentKey,
    pub register: String,
    pub old_value: u32,
    pub new_value: u32,
    pub value_encoding: ValueEncoding,
    pub value_bits: u8,
    pub tick: u64,
    pub cycle: u64,
}

/// Selector applied before a register diff is admitted to a subscription.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSelector {
    pub components: Vec<ComponentKey>,
    pub registers: Vec<String>,
    pub register_prefixes: Vec<String>,
    pub changed_only: bool,
}

impl RegisterSelector {
    /// Empty component/register lists match everything.
    pub fn matches(&self, event: &RegisterDiffEvent) -> bool {
        if self.changed_only && event.old_value == event.new_value {
            return false;
        }
        if !self.components.is_empty() && !self.components.contains(&event.component) {
            return false;
        }
        if !self.registers.is_empty() || !self.register_prefixes.is_empty() {
            let by_name = self.registers.contains(&event.register);
            let by_prefix = self
                .register_prefixes
                .iter()
                .any(|p| event.register.starts_with(p.as_str()));
            if !by_name && !by_prefix {
                return false;
            }
        }
        true
    }
}

/// Direction of a bus transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    Read,
    Write,
}

/// One admitted bus transaction observation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BusTraceEvent {
    pub addr: u32,
    pub access: AccessType,
    pub size_bytes: u8,
    pub value: u16,
    pub component: ComponentKey,
    pub level: u8,
    pub tick: u64,
    pub cycle: u64,
}

/// Filter for the bus trace stream; an event must match every populated field.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusTraceFilter {
    /// Inclusive `start..=end` ranges with `start <= end`.
    pub address_ranges: Vec<(u32, u32)>,
    pub access_types: Vec<AccessType>,
    pub components: Vec<ComponentKey>,
    pub level: Option<u8>,
}

impl BusTraceFilter {
    /// Rejects ranges with `start > end`.
    pub fn validate(&self) -> Result<(), String> {
        for (start, end) in &self.address_ranges {
            if start > end {
                return Err(format!("address range {start:#x}..={end:#x} is inverted"));
            }
        }
        Ok(())
    }

    pub fn matches(&self, event: &BusTraceEvent) -> bool {
        if !self.address_ranges.is_empty()
            && !self
                .address_ranges
                .iter()
                .any(|(s, e)| (*s..=*e).contains(&event.addr))
        {
            return false;
        }
        if !self.access_types.is_empty() && !self.access_types.contains(&event.access) {
            return false;
        }
        if !self.components.is_empty() && !self.components.contains(&event.component) {
            return false;
        }
        if let Some(level) = self.level {
            if event.level != level {
                return false;
            }
        }
        true
    }
}

/// One admitted memory access observation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MemoryTraceEvent {
    pub addr: u32,
    pub access: AccessType,
    pub size_bytes: u8,
    pub value: u16,
    pub component: ComponentKey,
    pub level: u8,
    /// Bus map region the address resolved to, e.g. `ram`, `tos_rom`.
    pub region: String,
    pub mapped_target: String,
    pub tick: u64,
    pub cycle: u64,
}

/// Filter for the memory trace stream.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryTraceFilter {
    pub bus: BusTraceFilter,
    pub regions: Vec<String>,
    pub mapped_targets: Vec<String>,
}

impl MemoryTraceFilter {
    pub fn validate(&self) -> Result<(), String> {
        self.bus.validate()
    }

    pub fn matches(&self, event: &MemoryTraceEvent) -> bool {
        let as_bus = BusTraceEvent {
            addr: event.addr,
            access: event.access,
            size_bytes: event.size_bytes,
            value: event.value,
            component: event.component,
            level: event.level,
            tick: event.tick,
            cycle: event.cycle,
        };
        if !self.bus.matches(&as_bus) {
            return false;
        }
        if !self.regions.is_empty() && !self.regions.contains(&event.region) {
            return false;
        }
        if !self.mapped_targets.is_empty() && !self.mapped_targets.contains(&event.mapped_target) {
            return false;
        }
        true
    }
}

/// Reason a delivery is degraded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryReason {
    #[default]
    None,
    QueueOverflow,
    RateLimited,
    ProducerLag,
    TransportBackpressure,
}

/// Delivery disclosure attached to engine status events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryInfo {
    pub degraded: bool,
    pub reason: DeliveryReason,
    pub dropped_events_since_last: u64,
    pub coalesced_updates: u64,
    pub throttle_active: bool,
}

/// Engine status / health event published on the status stream.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EngineStatusEvent {
    /// `running`, `paused`, `degraded`, `faulted`, ...
    pub state: String,
    /// `info`, `warning`, `error`.
    pub severity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub delivery: DeliveryInfo,
}

/// Metric identifiers the SLO sampler tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SloMetric {
    InputLatencyMs,
    JitterMs,
    DroppedFramePct,
}

impl SloMetric {
    /// Hard target from the emulation core SLO contract.
    pub fn default_threshold(self) -> f64 {
        match self {
            SloMetric::InputLatencyMs => 50.0,
            SloMetric::JitterMs => 30.0,
            SloMetric::DroppedFramePct => 1.0,
        }
    }
}

/// Sampler configuration; both fields are validated against their bounds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct SloConfig {
    /// Sample cadence, `100..=10_000` ms.
    pub sampling_interval_ms: u64,
    /// Rolling window, `1_000..=60_000` ms.
    pub window_ms: u64,
}

impl Default for SloConfig {
    fn default() -> Self {
        Self {
            sampling_interval_ms: 500,
            window_ms: 5_000,
        }
    }
}

/// One emitted SLO sample; windows never overlap per metric.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SloSample {
    pub sample_seq: u64,
    pub metric: SloMetric,
    pub window_start_us: u64,
    pub window_end_us: u64,
    pub observed: f64,
}

/// Alarm lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SloAlarmState {
    Breached,
    Recovered,
}

/// Alarm severities; `critical` at `observed >= 1.2 * threshold`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SloSeverity {
    Warning,
    Critical,
}

/// Alarm transition emitted by the sampler.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct SloAlarm {
    pub metric: SloMetric,
    pub state: SloAlarmState,
    pub severity: SloSeverity,
    pub observed: f64,
    pub threshold: f64,
}

/// Convenience alias for binary payload halves.
pub type Payload = Arc<[u8]>;
