// Copyright 2024 The Shardgate Authors
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across shardgate crates.

use thiserror::Error;

/// A specialized `Result` type for shardgate operations.
pub type Result<T> = std::result::Result<T, Error>;

/// S3-compatible error codes the proxy produces on its own behalf.
///
/// Errors returned by backends are passed through untouched; these codes are
/// only used when the proxy itself has to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3ErrorCode {
    /// The request could not be matched to a configured region.
    NoSuchRegion,
    /// The consistency ledger is unavailable and the region requires it.
    ServiceUnavailable,
    /// Every backend failed at the transport level.
    BadGateway,
    /// Internal server error.
    InternalError,
    /// Invalid request.
    InvalidRequest,
}

impl S3ErrorCode {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::NoSuchRegion => 404,
            Self::InvalidRequest => 400,
            Self::InternalError => 500,
            Self::BadGateway => 502,
            Self::ServiceUnavailable => 503,
        }
    }

    /// Returns the HTTP status code as an `http::StatusCode`.
    #[must_use]
    pub fn status_code(&self) -> http::StatusCode {
        http::StatusCode::from_u16(self.http_status())
            .unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR)
    }

    /// Returns the S3 error code string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::NoSuchRegion => "NoSuchBucket",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::BadGateway => "BadGateway",
            Self::InternalError => "InternalError",
            Self::InvalidRequest => "InvalidRequest",
        }
    }
}

impl std::fmt::Display for S3ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur in shardgate core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An S3 error answered by the proxy itself.
    #[error("{code}: {message}")]
    S3 {
        /// The S3 error code.
        code: S3ErrorCode,
        /// A human-readable error message.
        message: String,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database error.
    #[error("database error: {0}")]
    Database(String),

    /// Invalid request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// Creates a new S3 error.
    #[must_use]
    pub fn s3(code: S3ErrorCode, message: impl Into<String>) -> Self {
        Self::S3 { code, message: message.into() }
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::S3 { code, .. } => code.http_status(),
            Self::Config(_) | Self::InvalidRequest(_) => 400,
            Self::Io(_) | Self::Database(_) => 500,
        }
    }
}

/// Renders an S3-style XML error document.
///
/// The message is escaped; the code is always one of the static codes above.
#[must_use]
pub fn error_document(code: S3ErrorCode, message: &str, request_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Error><Code>{}</Code><Message>{}</Message><RequestId>{}</RequestId></Error>",
        code.as_str(),
        escape_xml(message),
        escape_xml(request_id),
    )
}

fn escape_xml(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
