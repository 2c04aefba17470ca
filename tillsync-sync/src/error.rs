//! Error types for the sync layer.

use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Network error. Transient: retry later.
    #[error("network error: {0}")]
    Network(String),

    /// Timeout. Transient: retry later.
    #[error("operation timed out")]
    Timeout,

    /// The backend refused the request. Not retriable without intervention.
    #[error("rejected by remote: {0}")]
    Rejected(String),

    /// The backend answered with something that breaks the page contract.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Local store error. Aborts the current operation.
    #[error("storage error: {0}")]
    Storage(#[from] tillsync_storage::StorageError),

    /// A mutation failed validation and was never queued.
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Channel closed.
    #[error("channel closed")]
    ChannelClosed,
}

impl SyncError {
    /// Whether the failure is expected to clear up on its own, such as the
    /// device being offline.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Timeout)
    }
}
