// Copyright 2024 The Shardgate Authors
// SPDX-License-Identifier: Apache-2.0

//! Per-backend outcomes and the summaries built from them.

use tokio::task::JoinHandle;
use tracing::{trace, warn};

use crate::backend::S3Response;
use crate::error::BackendError;

/// The outcome of one backend call for one logical request.
///
/// A `BackendResponse` is consumed exactly once: either a picker returns it
/// to the caller or it is [`discard`](Self::discard)ed.
#[derive(Debug)]
pub struct BackendResponse {
    backend: String,
    maintenance: bool,
    result: Result<S3Response, BackendError>,
}

impl BackendResponse {
    /// Creates a new outcome.
    pub fn new(
        backend: impl Into<String>,
        maintenance: bool,
        result: Result<S3Response, BackendError>,
    ) -> Self {
        Self { backend: backend.into(), maintenance, result }
    }

    /// Returns the name of the backend that produced this outcome.
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Returns true if the backend was under maintenance.
    pub fn is_maintenance(&self) -> bool {
        self.maintenance
    }

    /// A response with status below 400 and no transport error.
    pub fn is_success(&self) -> bool {
        matches!(&self.result, Ok(response) if response.status().as_u16() < 400)
    }

    /// True if the call was aborted by the replication client rather than
    /// failed by the backend.
    pub fn is_canceled(&self) -> bool {
        matches!(self.result, Err(BackendError::Canceled { .. }))
    }

    /// Returns the HTTP status, if any response arrived.
    pub fn status(&self) -> Option<u16> {
        self.result.as_ref().ok().map(|r| r.status().as_u16())
    }

    /// Returns the response or transport error.
    pub fn result(&self) -> &Result<S3Response, BackendError> {
        &self.result
    }

    /// Consumes the outcome and returns the response or transport error.
    pub fn into_result(self) -> Result<S3Response, BackendError> {
        self.result
    }

    /// Short description of a failure for summaries and logs.
    pub fn failure_reason(&self) -> String {
        match &self.result {
            Ok(response) => format!("status {}", response.status().as_u16()),
            Err(e) => e.to_string(),
        }
    }

    /// Releases the outcome without returning it.
    pub fn discard(self) {
        let size = self.result.as_ref().map(|r| r.body().len()).unwrap_or(0);
        trace!(backend = %self.backend, bytes = size, "Discarding backend response");
    }
}

/// A backend that failed one logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedBackend {
    /// Backend name.
    pub backend: String,
    /// Whether the backend was under maintenance.
    pub maintenance: bool,
    /// Status or transport error.
    pub reason: String,
}

/// What happened on every backend for one logical request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationSummary {
    /// Backends that answered with success.
    pub succeeded: Vec<String>,
    /// Backends that failed.
    pub failed: Vec<FailedBackend>,
    /// Set when the outcome could not be fully observed.
    pub incomplete: bool,
}

impl ReplicationSummary {
    /// Records one outcome.
    pub fn record(&mut self, response: &BackendResponse) {
        if response.is_success() {
            self.succeeded.push(response.backend().to_string());
        } else {
            self.failed.push(FailedBackend {
                backend: response.backend().to_string(),
                maintenance: response.is_maintenance(),
                reason: response.failure_reason(),
            });
        }
    }

    /// True if every backend succeeded.
    pub fn no_errors(&self) -> bool {
        !self.incomplete && self.failed.is_empty() && !self.succeeded.is_empty()
    }

    /// True if at least one backend succeeded.
    pub fn any_succeeded(&self) -> bool {
        !self.succeeded.is_empty()
    }

    /// A summary for outcomes that were lost, which must never count as
    /// error-free.
    pub fn lost() -> Self {
        Self { incomplete: true, ..Self::default() }
    }
}

/// A summary that may still be collecting stragglers.
#[derive(Debug)]
pub enum SummaryHandle {
    /// All outcomes were already observed.
    Ready(ReplicationSummary),
    /// A drain task is still collecting late outcomes.
    Pending(JoinHandle<ReplicationSummary>),
}

impl SummaryHandle {
    /// Waits until every backend has reported.
    pub async fn wait(self) -> ReplicationSummary {
        match self {
            Self::Ready(summary) => summary,
            Self::Pending(handle) => match handle.await {
                Ok(summary) => summary,
                Err(e) => {
                    warn!(error = %e, "Response drain task failed");
                    ReplicationSummary::lost()
                }
            },
        }
    }
}
