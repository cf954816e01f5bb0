//! Error taxonomy for the requisition core
//!
//! Every failure surfaced by the core is recoverable at the caller boundary:
//! a failed transition, backup or restore leaves the affected records
//! unmodified (or rolled back) and the process alive.

use thiserror::Error;

/// Core error type shared by all components
#[derive(Debug, Error)]
pub enum CoreError {
    /// A required field is missing or malformed; the record was not touched
    #[error("validation error: {0}")]
    Validation(String),

    /// The acting role lacks the required permission flag
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The requested event is not allowed from the record's current state
    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    /// The record changed between read and write; safe to re-read and retry
    #[error("requisition {number} was modified concurrently")]
    ConcurrentModification { number: i64 },

    /// The underlying store is unavailable or a write failed; not applied
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Post-archive verification failed; no partial artifact is retained
    #[error("backup integrity error: {0}")]
    BackupIntegrity(String),

    /// Restore failed and the preventive snapshot was rolled back
    #[error("restore failed: {0}")]
    RestoreFailure(String),
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        CoreError::Persistence(e.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Persistence(e.to_string())
    }
}

/// Convenience alias used throughout the core
pub type Result<T> = std::result::Result<T, CoreError>;
