//! Canonical error catalog.
//!
//! Every failure the core can surface has a stable UPPER_SNAKE_CASE code, a
//! category, and an explicit retryability marker. Guard and compatibility
//! rule identifiers travel in the details payload, never in the message
//! text, so callers can match on them mechanically.

use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Top-level error taxonomy categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Request,
    Auth,
    Path,
    Engine,
    Media,
    Ebin,
    Stream,
    Input,
    Snapshot,
    Debug,
    Catalog,
    Scheduler,
    Internal,
}

/// Stable error codes exposed on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    MalformedRequest,
    EngineNotRunning,
    EngineAlreadyRunning,
    InvalidSessionState,
    EngineNotSuspended,
    MachineProfileNotFound,
    EngineSubsystemUnavailable,
    MediaFormatInvalid,
    MediaDigestMismatch,
    MediaSlotBusy,
    SnapshotNotFound,
    SnapshotIncompatible,
    SnapshotSaveFailed,
    SnapshotRestoreFailed,
    StreamQueueOverflow,
    StreamFilterInvalid,
    InputPolicyModeInvalid,
    InputPolicySessionInvalid,
    InputPolicyViolation,
    InputPolicyInvalidState,
    MappingNotFound,
    Conflict,
    DebugClockInvalid,
    DebugStepInvalid,
    CatalogLinkDead,
    InternalError,
}

impl ErrorCode {
    /// Wire representation of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MalformedRequest => "MALFORMED_REQUEST",
            ErrorCode::EngineNotRunning => "ENGINE_NOT_RUNNING",
            ErrorCode::EngineAlreadyRunning => "ENGINE_ALREADY_RUNNING",
            ErrorCode::InvalidSessionState => "INVALID_SESSION_STATE",
            ErrorCode::EngineNotSuspended => "ENGINE_NOT_SUSPENDED",
            ErrorCode::MachineProfileNotFound => "MACHINE_PROFILE_NOT_FOUND",
            ErrorCode::EngineSubsystemUnavailable => "ENGINE_SUBSYSTEM_UNAVAILABLE",
            ErrorCode::MediaFormatInvalid => "MEDIA_FORMAT_INVALID",
            ErrorCode::MediaDigestMismatch => "MEDIA_DIGEST_MISMATCH",
            ErrorCode::MediaSlotBusy => "MEDIA_SLOT_BUSY",
            ErrorCode::SnapshotNotFound => "SNAPSHOT_NOT_FOUND",
            ErrorCode::SnapshotIncompatible => "SNAPSHOT_INCOMPATIBLE",
            ErrorCode::SnapshotSaveFailed => "SNAPSHOT_SAVE_FAILED",
            ErrorCode::SnapshotRestoreFailed => "SNAPSHOT_RESTORE_FAILED",
            ErrorCode::StreamQueueOverflow => "STREAM_QUEUE_OVERFLOW",
            ErrorCode::StreamFilterInvalid => "STREAM_FILTER_INVALID",
            ErrorCode::InputPolicyModeInvalid => "INPUT_POLICY_MODE_INVALID",
            ErrorCode::InputPolicySessionInvalid => "INPUT_POLICY_SESSION_INVALID",
            ErrorCode::InputPolicyViolation => "INPUT_POLICY_VIOLATION",
            ErrorCode::InputPolicyInvalidState => "INPUT_POLICY_INVALID_STATE",
            ErrorCode::MappingNotFound => "MAPPING_NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::DebugClockInvalid => "DEBUG_CLOCK_INVALID",
            ErrorCode::DebugStepInvalid => "DEBUG_STEP_INVALID",
            ErrorCode::CatalogLinkDead => "CATALOG_LINK_DEAD",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Category the code belongs to.
    pub fn category(self) -> ErrorCategory {
        match self {
            ErrorCode::MalformedRequest => ErrorCategory::Request,
            ErrorCode::EngineNotRunning
            | ErrorCode::EngineAlreadyRunning
            | ErrorCode::InvalidSessionState
            | ErrorCode::EngineNotSuspended
            | ErrorCode::MachineProfileNotFound
            | ErrorCode::EngineSubsystemUnavailable => ErrorCategory::Engine,
            ErrorCode::MediaFormatInvalid
            | ErrorCode::MediaDigestMismatch
            | ErrorCode::MediaSlotBusy => ErrorCategory::Media,
            ErrorCode::SnapshotNotFound
            | ErrorCode::SnapshotIncompatible
            | ErrorCode::SnapshotSaveFailed
            | ErrorCode::SnapshotRestoreFailed => ErrorCategory::Snapshot,
            ErrorCode::StreamQueueOverflow | ErrorCode::StreamFilterInvalid => {
                ErrorCategory::Stream
            }
            ErrorCode::InputPolicyModeInvalid
            | ErrorCode::InputPolicySessionInvalid
            | ErrorCode::InputPolicyViolation
            | ErrorCode::InputPolicyInvalidState
            | ErrorCode::MappingNotFound
            | ErrorCode::Conflict => ErrorCategory::Input,
            ErrorCode::DebugClockInvalid | ErrorCode::DebugStepInvalid => ErrorCategory::Debug,
            ErrorCode::CatalogLinkDead => ErrorCategory::Catalog,
            ErrorCode::InternalError => ErrorCategory::Internal,
        }
    }

    /// Whether a caller may retry the same request unchanged.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::StreamQueueOverflow | ErrorCode::MediaSlotBusy | ErrorCode::Conflict
        )
    }
}

/// Structured detail payload attached to every error.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ErrorDetails {
    /// Guard that rejected the request, e.g. `G-START-01`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard_id: Option<&'static str>,
    /// Compatibility rule that failed, e.g. `RCOMP-03`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<&'static str>,
    /// Endpoint binding the request arrived through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Free-form key/value context.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ErrorDetails {
    pub fn guard(guard_id: &'static str, endpoint: &str) -> Self {
        Self {
            guard_id: Some(guard_id),
            endpoint: Some(endpoint.to_owned()),
            ..Self::default()
        }
    }

    pub fn rule(rule_id: &'static str) -> Self {
        Self {
            rule_id: Some(rule_id),
            ..Self::default()
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.extra.insert(key.to_owned(), value.to_string());
        self
    }
}

/// Error object carried by every rejected request.
#[derive(Clone, Debug, PartialEq, Error, Serialize)]
#[error("{}: {message}", code.as_str())]
pub struct EngineError {
    pub code: ErrorCode,
    pub category: ErrorCategory,
    pub message: String,
    pub retryable: bool,
    pub details: ErrorDetails,
}

impl EngineError {
    /// Builds an error with the code's canonical category and retryability.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            category: code.category(),
            message: message.into(),
            retryable: code.retryable(),
            details: ErrorDetails::default(),
        }
    }

    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Shorthand for internal invariant violations.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
