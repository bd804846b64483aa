//! Centralized error types for the syncguard workspace.

use thiserror::Error;

/// Top-level error enum. Variants map to failure modes of the sync path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SyncError {
    /// The lock was not granted before the caller's deadline.
    #[error("Mutex timeout: '{operation}' waited {timeout_ms}ms for '{name}'")]
    MutexTimeout {
        name: String,
        operation: String,
        timeout_ms: u64,
    },

    /// The call was not attempted because the breaker is open.
    #[error("Circuit '{name}' is open, next attempt in {retry_in_ms}ms")]
    CircuitOpen { name: String, retry_in_ms: u64 },

    /// A newer enqueue for the same key replaced this entry before it ran.
    /// An ordering outcome, not a failure of the payload. `by` is the
    /// generation of the replacing entry.
    #[error("Superseded by newer operation #{by} for '{key}'")]
    Superseded { key: String, by: u64 },

    #[error("Cancelled: queue '{queue}' was cleared before '{key}' ran")]
    Cancelled { queue: String, key: String },

    #[error("Checksum mismatch for {subject}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("Edit lock on {record} held by {locked_by}")]
    EditLocked { record: String, locked_by: String },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether a caller-side retry can reasonably succeed.
    ///
    /// Gate and ordering outcomes are excluded: retrying an open circuit
    /// defeats the breaker, and a superseded entry already has a successor.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MutexTimeout { .. }
            | Self::ChecksumMismatch { .. }
            | Self::Remote(_)
            | Self::Internal(_) => true,
            Self::CircuitOpen { .. }
            | Self::Superseded { .. }
            | Self::Cancelled { .. }
            | Self::EditLocked { .. }
            | Self::Serialization(_)
            | Self::InvalidInput(_) => false,
        }
    }

    pub fn is_superseded(&self) -> bool {
        matches!(self, Self::Superseded { .. })
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
