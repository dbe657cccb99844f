//! Response pickers.
//!
//! A picker consumes the outcome stream of one fanned-out request and
//! decides which single outcome the client gets. Every outcome it does not
//! return is discarded exactly once.
//!
//! ```text
//! Picker  | Returns                                   | Waits for
//! --------|-------------------------------------------|----------------
//! Object  | first success, else first failure         | first success
//! Delete  | first hard failure, else first success    | all backends
//! List    | merged listing of all successes           | all backends
//! ```
//!
//! A canceled call is only returned when no backend produced a real outcome.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::{Response, StatusCode};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ReplicationError;
use crate::listing::{merge_listings, ListBucketResult, ListParams};
use crate::response::{BackendResponse, ReplicationSummary, SummaryHandle};

/// Response header set when backends returned different listings.
pub const LISTING_MISMATCH_HEADER: &str = "x-shardgate-listing-mismatch";

/// The outcome chosen for the client, plus the summary of all backends.
#[derive(Debug)]
pub struct Picked {
    /// The chosen outcome.
    pub response: BackendResponse,
    /// Summary of every backend's outcome.
    pub summary: SummaryHandle,
}

/// Selects one outcome from a stream of per-backend outcomes.
#[async_trait]
pub trait ResponsePicker: Send + Sync {
    /// Picks the outcome to return.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError::NoBackends`] if the stream yields nothing.
    async fn pick(
        &self,
        responses: mpsc::Receiver<BackendResponse>,
    ) -> Result<Picked, ReplicationError>;
}

/// The first real failure seen, and the first canceled call as a fallback.
///
/// A canceled call says nothing about the backend, so it is only ever
/// returned when no backend actually failed.
#[derive(Debug, Default)]
struct FirstFailure {
    real: Option<BackendResponse>,
    canceled: Option<BackendResponse>,
}

impl FirstFailure {
    fn offer(&mut self, response: BackendResponse) {
        let slot = if response.is_canceled() { &mut self.canceled } else { &mut self.real };
        match slot {
            None => *slot = Some(response),
            Some(_) => response.discard(),
        }
    }

    fn into_chosen(self) -> Option<BackendResponse> {
        match (self.real, self.canceled) {
            (Some(real), canceled) => {
                canceled.into_iter().for_each(BackendResponse::discard);
                Some(real)
            }
            (None, canceled) => canceled,
        }
    }

    fn discard(self) {
        self.real.into_iter().chain(self.canceled).for_each(BackendResponse::discard);
    }
}

/// First success wins; the rest are drained in the background.
#[derive(Debug, Default, Clone, Copy)]
pub struct ObjectPicker;

#[async_trait]
impl ResponsePicker for ObjectPicker {
    async fn pick(
        &self,
        mut responses: mpsc::Receiver<BackendResponse>,
    ) -> Result<Picked, ReplicationError> {
        let mut summary = ReplicationSummary::default();
        let mut failures = FirstFailure::default();

        while let Some(response) = responses.recv().await {
            summary.record(&response);
            if response.is_success() {
                failures.discard();
                debug!(backend = %response.backend(), "Picked first successful response");
                let drain = tokio::spawn(async move {
                    while let Some(late) = responses.recv().await {
                        summary.record(&late);
                        late.discard();
                    }
                    summary
                });
                return Ok(Picked { response, summary: SummaryHandle::Pending(drain) });
            }
            failures.offer(response);
        }

        match failures.into_chosen() {
            Some(response) => {
                warn!(
                    backend = %response.backend(),
                    reason = %response.failure_reason(),
                    "All backends failed"
                );
                Ok(Picked { response, summary: SummaryHandle::Ready(summary) })
            }
            None => Err(ReplicationError::NoBackends("object request".into())),
        }
    }
}

/// Waits for every backend. A failure from a backend under maintenance is
/// soft: recorded, never returned. When only soft failures arrive the delete
/// is answered with an empty success.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeletePicker;

#[async_trait]
impl ResponsePicker for DeletePicker {
    async fn pick(
        &self,
        mut responses: mpsc::Receiver<BackendResponse>,
    ) -> Result<Picked, ReplicationError> {
        let mut summary = ReplicationSummary::default();
        let mut hard_failure: Option<BackendResponse> = None;
        let mut success: Option<BackendResponse> = None;
        let mut soft_failure: Option<BackendResponse> = None;
        let mut canceled: Option<BackendResponse> = None;

        while let Some(response) = responses.recv().await {
            summary.record(&response);
            let slot = if response.is_success() {
                &mut success
            } else if response.is_canceled() {
                &mut canceled
            } else if response.is_maintenance() {
                debug!(backend = %response.backend(), "Soft delete failure on maintenance backend");
                &mut soft_failure
            } else {
                &mut hard_failure
            };
            match slot {
                None => *slot = Some(response),
                Some(_) => response.discard(),
            }
        }

        let chosen = match (hard_failure, success, canceled, soft_failure) {
            (Some(hard), ok, canceled, soft) => {
                warn!(
                    backend = %hard.backend(),
                    reason = %hard.failure_reason(),
                    "Delete failed on backend"
                );
                ok.into_iter().chain(canceled).chain(soft).for_each(BackendResponse::discard);
                hard
            }
            (None, Some(ok), canceled, soft) => {
                canceled.into_iter().chain(soft).for_each(BackendResponse::discard);
                ok
            }
            (None, None, Some(canceled), soft) => {
                soft.into_iter().for_each(BackendResponse::discard);
                canceled
            }
            (None, None, None, Some(soft)) => {
                debug!(backend = %soft.backend(), "Only maintenance backends failed the delete");
                let backend = soft.backend().to_string();
                soft.discard();
                let mut response = Response::new(Bytes::new());
                *response.status_mut() = StatusCode::NO_CONTENT;
                BackendResponse::new(backend, true, Ok(response))
            }
            (None, None, None, None) => {
                return Err(ReplicationError::NoBackends("delete".into()));
            }
        };

        Ok(Picked { response: chosen, summary: SummaryHandle::Ready(summary) })
    }
}

/// Merges the listings of every successful backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct ListPicker {
    params: ListParams,
}

impl ListPicker {
    /// Creates a picker for a listing with the given parameters.
    pub fn new(params: ListParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl ResponsePicker for ListPicker {
    async fn pick(
        &self,
        mut responses: mpsc::Receiver<BackendResponse>,
    ) -> Result<Picked, ReplicationError> {
        let mut summary = ReplicationSummary::default();
        let mut failures = FirstFailure::default();
        let mut template: Option<BackendResponse> = None;
        let mut listings = Vec::new();
        let mut unparsable = false;

        while let Some(response) = responses.recv().await {
            summary.record(&response);
            if !response.is_success() {
                failures.offer(response);
                continue;
            }

            let parsed = match response.result() {
                Ok(r) => ListBucketResult::parse(r.body()),
                Err(_) => continue,
            };
            match parsed {
                Ok(listing) => listings.push(listing),
                Err(e) => {
                    unparsable = true;
                    warn!(backend = %response.backend(), error = %e, "Unparsable listing body");
                }
            }
            match template {
                None => template = Some(response),
                Some(_) => response.discard(),
            }
        }

        let Some(template) = template else {
            return match failures.into_chosen() {
                Some(response) => Ok(Picked { response, summary: SummaryHandle::Ready(summary) }),
                None => Err(ReplicationError::NoBackends("listing".into())),
            };
        };
        failures.discard();

        let Some(merged) = merge_listings(listings, self.params) else {
            return Ok(Picked { response: template, summary: SummaryHandle::Ready(summary) });
        };
        let body = match merged.result.to_xml() {
            Ok(xml) => Bytes::from(xml),
            Err(e) => {
                warn!(error = %e, "Failed to serialize merged listing");
                return Ok(Picked { response: template, summary: SummaryHandle::Ready(summary) });
            }
        };

        let backend = template.backend().to_string();
        let maintenance = template.is_maintenance();
        let response = template.into_result().map(|response| {
            let (mut parts, _) = response.into_parts();
            parts.headers.remove(CONTENT_LENGTH);
            parts.headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/xml"));
            if merged.mismatch || unparsable {
                parts.headers.insert(LISTING_MISMATCH_HEADER, HeaderValue::from_static("true"));
            }
            http::Response::from_parts(parts, body)
        });

        Ok(Picked {
            response: BackendResponse::new(backend, maintenance, response),
            summary: SummaryHandle::Ready(summary),
        })
    }
}
