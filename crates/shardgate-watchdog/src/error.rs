//! Error types for the consistency ledger.

use shardgate_core::ClockError;
use thiserror::Error;

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors raised by a [`Ledger`](crate::Ledger).
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The storage engine failed.
    #[error("ledger database error: {0}")]
    Database(String),

    /// A stored record could not be encoded or decoded.
    #[error("ledger codec error: {0}")]
    Codec(String),

    /// The record to update no longer exists.
    #[error("record not found: {0}")]
    NotFound(String),

    /// A blocking ledger task panicked or was cancelled.
    #[error("ledger task failed: {0}")]
    Task(String),

    /// A supplied version lies too far in the future to be stored.
    #[error("rejected record version: {0}")]
    Clock(#[from] ClockError),
}

impl From<LedgerError> for shardgate_core::Error {
    fn from(err: LedgerError) -> Self {
        shardgate_core::Error::Database(err.to_string())
    }
}
