#![deny(unsafe_op_in_unsafe_fn)]
#![allow(missing_docs)]

//! Stream and telemetry fabric.
//!
//! Every subscription owns a single-writer bounded queue with strict
//! sequencing, watermark counters, and a drop-oldest overflow policy. The
//! emulation task is the only writer; transport threads read through
//! [`Subscription`] handles. Nothing here blocks the writer: backpressure
//! degrades the stream, never the core.

mod audio;
mod publisher;
mod regdiff;
mod slo;
mod status;
mod trace;
mod video;

pub use audio::{AudioChunk, AudioPublisher};
pub use publisher::{Publisher, PublisherStats, PublishOutcome, Subscription, DEFAULT_QUEUE_CAPACITY};
pub use regdiff::RegisterDiffPublisher;
pub use slo::{SloSampler, SloTick};
pub use status::StatusPublisher;
pub use trace::{BusTracePublisher, MemoryTracePublisher};
pub use video::{VideoFrame, VideoPublisher};
