//! Error types for replication operations.

use thiserror::Error;

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// A failure to get any HTTP response out of one backend.
///
/// HTTP error statuses are not `BackendError`s; they travel as ordinary
/// responses and are judged by the pickers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// Connection, TLS or protocol failure.
    #[error("transport error from backend {backend}: {reason}")]
    Transport {
        /// The backend that failed.
        backend: String,
        /// The reason for failure.
        reason: String,
    },

    /// The backend did not answer in time.
    #[error("backend {backend} timed out after {timeout_ms}ms")]
    Timeout {
        /// The backend that timed out.
        backend: String,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },

    /// The call was aborted through the replication client's cancellation.
    #[error("request to backend {backend} was canceled")]
    Canceled {
        /// The backend whose call was canceled.
        backend: String,
    },
}

impl BackendError {
    /// Returns the backend this error belongs to.
    pub fn backend(&self) -> &str {
        match self {
            Self::Transport { backend, .. }
            | Self::Timeout { backend, .. }
            | Self::Canceled { backend } => backend,
        }
    }
}

/// Errors raised by the replication layer itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplicationError {
    /// `cancel` was called while no backend call was running.
    #[error("no backend call in progress")]
    NothingInProgress,

    /// The shard resolved to an empty backend set.
    #[error("no backends available for {0}")]
    NoBackends(String),

    /// The domain does not map to any configured region.
    #[error("unknown domain: {0}")]
    UnknownDomain(String),

    /// Internal replication error.
    #[error("internal replication error: {0}")]
    Internal(String),
}
