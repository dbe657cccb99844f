//! Drift detection: decides what, if anything, a record still needs.

use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use http::header::{HeaderName, HeaderValue};
use http::{Method, Request, StatusCode};
use shardgate_core::ObjectVersion;
use shardgate_replication::{Backend, S3Request, ShardResolver, ACCESS_KEY_HEADER};
use shardgate_watchdog::{ConsistencyRecord, RecordMethod};
use tracing::{debug, trace};

use crate::error::{RepairError, RepairErrorKind, Result};

/// What one backend holds for an object.
#[derive(Clone)]
pub struct StorageState {
    /// The probed backend.
    pub backend: Arc<dyn Backend>,
    /// Version stamped on the stored object; `None` if absent or unstamped.
    pub version: Option<ObjectVersion>,
    /// The backend has no such object.
    pub not_found: bool,
}

impl StorageState {
    fn is_present(&self) -> bool {
        !self.not_found
    }
}

impl std::fmt::Debug for StorageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageState")
            .field("backend", &self.backend.name())
            .field("version", &self.version)
            .field("not_found", &self.not_found)
            .finish()
    }
}

/// The migration needed to converge one record. Empty means converged.
#[derive(Clone)]
pub struct RepairTask {
    /// The record being converged.
    pub record: ConsistencyRecord,
    /// Backend holding the authoritative copy (PUT only).
    pub source: Option<Arc<dyn Backend>>,
    /// Backends to write to (PUT) or delete from (DELETE).
    pub destinations: Vec<Arc<dyn Backend>>,
}

impl RepairTask {
    fn converged(record: &ConsistencyRecord) -> Self {
        Self { record: record.clone(), source: None, destinations: Vec::new() }
    }

    /// True if nothing needs to move.
    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    /// Returns the mutation being converged.
    pub fn method(&self) -> RecordMethod {
        self.record.method
    }
}

impl std::fmt::Debug for RepairTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepairTask")
            .field("object", &self.record.object_id)
            .field("method", &self.record.method)
            .field("source", &self.source.as_ref().map(|b| b.name().to_string()))
            .field(
                "destinations",
                &self.destinations.iter().map(|b| b.name().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Probes every backend of a record's shard and plans the repair.
pub struct DriftFilter {
    resolver: Arc<dyn ShardResolver>,
    version_header: HeaderName,
}

impl DriftFilter {
    /// Creates a filter reading versions from `version_header`.
    pub fn new(resolver: Arc<dyn ShardResolver>, version_header: HeaderName) -> Self {
        Self { resolver, version_header }
    }

    /// HEADs the object on every backend of the record's shard.
    ///
    /// # Errors
    ///
    /// Fails if the shard cannot be resolved or any probe gets no usable
    /// answer.
    pub async fn probe(&self, record: &ConsistencyRecord) -> Result<Vec<StorageState>> {
        let backends = self.resolver.pick(&record.domain, &record.object_id)?;
        let probes = backends.into_iter().map(|backend| self.probe_one(backend, record));
        join_all(probes).await.into_iter().collect()
    }

    async fn probe_one(
        &self,
        backend: Arc<dyn Backend>,
        record: &ConsistencyRecord,
    ) -> Result<StorageState> {
        let response = backend.send(object_request(Method::HEAD, record, "")?).await?;
        let status = response.status();
        trace!(backend = %backend.name(), status = status.as_u16(), "Probed object");

        if status == StatusCode::NOT_FOUND {
            return Ok(StorageState { backend, version: None, not_found: true });
        }
        if !status.is_success() {
            return Err(RepairError::probe_failed(
                backend.name(),
                status.as_u16(),
                response.body(),
            ));
        }
        let version = response
            .headers()
            .get(&self.version_header)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        Ok(StorageState { backend, version, not_found: false })
    }

    /// Probes and plans in one step.
    ///
    /// # Errors
    ///
    /// See [`probe`](Self::probe).
    pub async fn plan(&self, record: &ConsistencyRecord) -> Result<RepairTask> {
        let states = self.probe(record).await?;
        let task = decide(record, &states);
        debug!(?task, "Planned repair");
        Ok(task)
    }
}

/// Applies the drift rules to a set of probes.
///
/// - Any present copy newer than the record wins: nothing to do.
/// - PUT: the copy stamped with the record's version is the source (the
///   newest stamped copy if none matches exactly); every other backend is a
///   destination. No present or no stamped copy: nothing to do.
/// - DELETE: present copies at or below the record's version are removed.
pub fn decide(record: &ConsistencyRecord, states: &[StorageState]) -> RepairTask {
    let target = record.object_version;
    let present: Vec<&StorageState> = states.iter().filter(|s| s.is_present()).collect();

    if present.iter().any(|s| s.version.is_some_and(|v| v > target)) {
        return RepairTask::converged(record);
    }

    match record.method {
        RecordMethod::Put => {
            let source = present
                .iter()
                .filter(|s| s.version.is_some())
                .max_by_key(|s| (s.version == Some(target), s.version));
            let Some(source) = source else {
                return RepairTask::converged(record);
            };
            let destinations = states
                .iter()
                .filter(|s| s.not_found || s.version != source.version)
                .map(|s| Arc::clone(&s.backend))
                .collect();
            RepairTask {
                record: record.clone(),
                source: Some(Arc::clone(&source.backend)),
                destinations,
            }
        }
        RecordMethod::Delete => RepairTask {
            record: record.clone(),
            source: None,
            destinations: present.iter().map(|s| Arc::clone(&s.backend)).collect(),
        },
    }
}

/// Builds a request for the record's object, tagged with its access key.
pub(crate) fn object_request(
    method: Method,
    record: &ConsistencyRecord,
    query: &str,
) -> Result<S3Request> {
    let uri = if query.is_empty() {
        format!("/{}", record.object_id)
    } else {
        format!("/{}?{query}", record.object_id)
    };
    build_request(method, &uri, &record.access_key, Bytes::new())
}

pub(crate) fn build_request(
    method: Method,
    uri: &str,
    access_key: &str,
    body: Bytes,
) -> Result<S3Request> {
    let mut request = Request::builder()
        .method(method)
        .uri(uri)
        .body(body)
        .map_err(|e| RepairError::new(RepairErrorKind::Internal, e.to_string()))?;
    if !access_key.is_empty() {
        if let Ok(value) = HeaderValue::from_str(access_key) {
            request.headers_mut().insert(ACCESS_KEY_HEADER, value);
        }
    }
    Ok(request)
}
