//! The error taxonomy shared by every layer of the service.
//!
//! Admission-time errors are returned to the caller; worker-time errors are
//! recorded on the task record and never propagate back through the RPC
//! surface, since the submitting call has already returned by the time they
//! occur.

use thiserror::Error;

/// Errors surfaced by the admission path (§4.1) and by direct KV/store
/// operations.
#[derive(Debug, Error)]
pub enum ScanforgeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("illegal state transition: {from:?} -> {to:?}")]
    StateTransition {
        from: crate::model::TaskStatus,
        to: crate::model::TaskStatus,
    },

    #[error("scanner error: {0}")]
    Scanner(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("circuit open for instance {instance_id}")]
    CircuitOpen { instance_id: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl ScanforgeError {
    /// True for errors that the worker should treat the same as a transient
    /// `ScannerError` for retry/DLQ purposes.
    pub fn is_transient_scanner_failure(&self) -> bool {
        matches!(self, Self::Scanner(_) | Self::CircuitOpen { .. } | Self::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, ScanforgeError>;
