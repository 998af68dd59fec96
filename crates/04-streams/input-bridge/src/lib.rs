#![deny(unsafe_op_in_unsafe_fn)]
#![allow(missing_docs)]

//! Input bridge: mapping profile store, capture policy machine, and the
//! host-to-virtual event translator.
//!
//! Profiles persist as JSON documents under
//! `<root>/input/mappings/<machine>/<id>.json`, rewritten atomically.
//! Readers of the active mapping hold an immutable snapshot until the next
//! cutover; applies commit at a tick boundary.

mod mapping;
mod policy;
mod translate;

pub use mapping::{ActiveMappings, ApplyOutcome, ApplyResult, MappingStore};
pub use policy::{CapturePolicy, PolicyConfig, PolicyRegistry};
pub use translate::{SequenceChecker, Translator, TranslatorDiagnostics};
