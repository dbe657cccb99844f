//! Error types for the repair pipeline.

use std::fmt;

use serde::Deserialize;
use shardgate_replication::{BackendError, ReplicationError};
use shardgate_watchdog::LedgerError;
use thiserror::Error;

/// Result type for repair operations.
pub type Result<T> = std::result::Result<T, RepairError>;

/// Classification of a repair failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepairErrorKind {
    /// The source object or bucket is gone.
    NotFound,
    /// A backend refused the request.
    Forbidden,
    /// The access key or signature was rejected.
    Credentials,
    /// The caller lacks permission on the resource.
    Permission,
    /// No response from a backend.
    Transport,
    /// A backend answered with another error status.
    Backend,
    /// A HEAD probe during drift filtering got an error status.
    Probe,
    /// The shard of the record's domain could not be resolved.
    Resolve,
    /// The ledger failed.
    Ledger,
    /// Anything else.
    Internal,
}

impl RepairErrorKind {
    /// Returns the name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::Credentials => "credentials",
            Self::Permission => "permission",
            Self::Transport => "transport",
            Self::Backend => "backend",
            Self::Probe => "probe",
            Self::Resolve => "resolve",
            Self::Ledger => "ledger",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for RepairErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A failed repair.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct RepairError {
    kind: RepairErrorKind,
    message: String,
}

impl RepairError {
    /// Creates a new error.
    pub fn new(kind: RepairErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Returns the failure classification.
    pub fn kind(&self) -> RepairErrorKind {
        self.kind
    }

    /// Returns the failure message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Not-found, forbidden, credential and permission failures will not go
    /// away by retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.kind,
            RepairErrorKind::NotFound
                | RepairErrorKind::Forbidden
                | RepairErrorKind::Credentials
                | RepairErrorKind::Permission
        )
    }

    /// Classifies an S3 error response from `backend`.
    pub fn from_status(backend: &str, operation: &str, status: u16, body: &[u8]) -> Self {
        let code = error_code(body);
        let kind = match (status, code.as_deref()) {
            (_, Some("InvalidAccessKeyId" | "SignatureDoesNotMatch" | "ExpiredToken")) => {
                RepairErrorKind::Credentials
            }
            (_, Some("AccessDenied" | "AllAccessDisabled")) => RepairErrorKind::Permission,
            (403, _) => RepairErrorKind::Forbidden,
            (404, _) => RepairErrorKind::NotFound,
            _ => RepairErrorKind::Backend,
        };
        let code = code.unwrap_or_else(|| status.to_string());
        Self::new(kind, format!("{operation} on {backend} failed: {code}"))
    }

    /// An error status answered to a drift probe. Always retryable: the
    /// record stays until the backend can be inspected.
    pub fn probe_failed(backend: &str, status: u16, body: &[u8]) -> Self {
        let code = error_code(body).unwrap_or_else(|| status.to_string());
        Self::new(RepairErrorKind::Probe, format!("HEAD on {backend} failed: {code}"))
    }
}

impl From<BackendError> for RepairError {
    fn from(err: BackendError) -> Self {
        Self::new(RepairErrorKind::Transport, err.to_string())
    }
}

impl From<ReplicationError> for RepairError {
    fn from(err: ReplicationError) -> Self {
        Self::new(RepairErrorKind::Resolve, err.to_string())
    }
}

impl From<LedgerError> for RepairError {
    fn from(err: LedgerError) -> Self {
        Self::new(RepairErrorKind::Ledger, err.to_string())
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "Code")]
    code: String,
}

/// Extracts `<Code>` from an S3 error document.
pub(crate) fn error_code(body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    quick_xml::de::from_str::<ErrorBody>(text).ok().map(|e| e.code)
}
