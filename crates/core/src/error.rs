//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Deterministic failures only (validation, malformed wire input, illegal status
/// transitions). Infrastructure concerns belong in the infra crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. empty file name).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was malformed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A queued payload could not be decoded into a job.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// A status value was not one of the known literals.
    #[error("unknown status: {0}")]
    UnknownStatus(String),

    /// The status state machine refused a transition.
    #[error("illegal transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedPayload(msg.into())
    }
}
