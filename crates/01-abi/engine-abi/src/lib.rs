//! Protocol boundary types shared between the emulation core and its
//! collaborators.
//!
//! This crate defines the contract between the transport layer (REST and
//! WebSocket, out of scope here), the emulation engine, and the stream
//! fabric, with no dependency on any concrete implementation. Everything a
//! remote caller can say to the core, and everything the core can emit,
//! is typed here.

#![allow(missing_docs)]

mod commands;
mod error;
mod events;
mod input;
mod session;

pub use commands::{
    ArbStats, BusErrorRecord, CapturePayload, ClockCmd, InspectCmd, LifecycleCmd, MediaCmd,
    ModeChangeOutcome, SnapshotCmd, StepOutcome,
};
pub use error::{EngineError, EngineResult, ErrorCategory, ErrorCode, ErrorDetails};
pub use events::{
    AccessType, AudioChunkMeta, AudioFormat, BusTraceEvent, BusTraceFilter, DeliveryInfo,
    DeliveryReason, DiffMode, EngineStatusEvent, EventStamp, MemoryTraceEvent, MemoryTraceFilter,
    Payload, PixelFormat, RegisterDiffEvent, RegisterSelector, SloAlarm, SloAlarmState, SloConfig,
    SloMetric, SloSample, SloSeverity, StreamEvent, ValueEncoding, VideoFrameMeta,
};
pub use input::{
    CaptureMode, HostDeviceType, HostEvent, HostEventKey, InputTranslatedEvent, MappingEntry,
    MappingProfile, MouseButton, Phase, PolicyChangeEvent, PolicyHook, PolicySource, PolicyState,
    TransitionResult, VirtualTarget,
};
pub use session::{
    ClockMode, ComponentKey, LifecycleState, MediaBinding, MediaDescriptor, MediaSlot,
    ModuleVersions, ProfileManifest, Region, ResumeMode, SessionInfo,
};

/// Current schema version stamped into stream hello messages and snapshots.
pub const SCHEMA_VERSION: u32 = 1;

/// Engine ABI identifier compared verbatim during snapshot compatibility checks.
pub const ENGINE_ABI: &str = "stx-engine/1";
