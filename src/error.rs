//! Error taxonomy surfaced to clients, plus the smaller enum the upstream
//! adapter uses internally to classify a non-success outcome.

use thiserror::Error;

/// The error recorded on a terminal request record and returned by `poll`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("request cancelled")]
    Cancelled,

    #[error("synchronous wait timed out")]
    Timeout,

    #[error("all eligible credentials quota-errored: {0}")]
    QuotaExhausted(String),

    #[error("transient upstream errors persisted across retry and rotation: {0}")]
    TransientExhausted(String),

    #[error("non-retriable upstream error: {0}")]
    UpstreamFatal(String),

    #[error("no upstream credential is usable")]
    AllCredentialsDown,

    #[error("internal engine error: {0}")]
    Internal(String),
}

impl EngineError {
    /// The `kind` name as surfaced to clients; stable across detail message
    /// changes so callers can match on it.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION",
            EngineError::Cancelled => "CANCELLED",
            EngineError::Timeout => "TIMEOUT",
            EngineError::QuotaExhausted(_) => "QUOTA_EXHAUSTED",
            EngineError::TransientExhausted(_) => "TRANSIENT_EXHAUSTED",
            EngineError::UpstreamFatal(_) => "UPSTREAM_FATAL",
            EngineError::AllCredentialsDown => "ALL_CREDENTIALS_DOWN",
            EngineError::Internal(_) => "INTERNAL",
        }
    }
}

/// The classification an `UpstreamAdapter` must produce for any non-success
/// outcome. `OK` is represented by `Ok(EngineValue)`, not a variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
    NullResponse,
    Transient,
    Quota,
    Fatal,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("adapter error ({kind:?}): {detail}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub detail: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}
