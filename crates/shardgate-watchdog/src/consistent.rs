//! Consistency-aware shard client.
//!
//! Wraps a [`ShardClient`] so that every mutation that may leave backends
//! diverged is recorded in the ledger before it is dispatched, and settled
//! once every backend has reported:
//!
//! ```text
//! Dispatched ─► LoggingDecided ─► BackendCalled ─► CompletionAwaited ─┬─► ReadRepaired
//!                                                                    ├─► DelayExtended
//!                                                                    ├─► Compacted
//!                                                                    └─► Ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Method, Response};
use metrics::counter;
use shardgate_core::{
    error_document, ConsistencyLevel, ObjectVersion, RequestShape, S3ErrorCode, WatchdogConfig,
};
use shardgate_replication::{
    ReplicationError, ReplicationSummary, S3Request, S3Response, ShardClient, SummaryHandle,
    REQUEST_ID_HEADER,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ledger::Ledger;
use crate::record::{DeleteMarker, NewRecord, RecordMethod};

/// Per-request values supplied by the HTTP front end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// Domain the request was addressed to.
    pub domain: String,
    /// Correlation id, echoed in error documents and stored in records.
    pub request_id: String,
    /// Access key of the caller.
    pub access_key: String,
}

/// Sent by the front end once the response has been delivered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Version observed on a read that should be re-replicated.
    pub read_repair: Option<ObjectVersion>,
}

/// What the completion step did with a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// A fresh record was inserted for a read that saw divergence.
    ReadRepaired,
    /// A completed multipart upload's record was pushed back.
    DelayExtended,
    /// Every backend succeeded; this and older records were deleted.
    Compacted,
    /// Nothing to do; the record, if any, stays for the feeder.
    Ignored,
}

impl Completion {
    /// Returns the name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadRepaired => "read_repaired",
            Self::DelayExtended => "delay_extended",
            Self::Compacted => "compacted",
            Self::Ignored => "ignored",
        }
    }
}

/// The response to return and the task settling the ledger.
#[derive(Debug)]
pub struct Handled {
    /// Response for the client.
    pub response: S3Response,
    /// Completion task. `None` when the request was rejected before dispatch.
    pub completion: Option<JoinHandle<Completion>>,
}

/// Immutable facts the completion step decides on.
struct CompletionSummary {
    marker: Option<DeleteMarker>,
    no_errors: bool,
    multipart_completed: bool,
    read_repair: Option<ObjectVersion>,
}

/// Everything the completion task needs, moved out of the request.
struct Settle {
    ledger: Option<Arc<dyn Ledger>>,
    ctx: RequestContext,
    object_id: Option<String>,
    level: ConsistencyLevel,
    marker: Option<DeleteMarker>,
    /// Multipart requests reach one backend, so their summary never proves
    /// replication.
    single_backend: bool,
    multipart_completed: bool,
    observed: Option<ObjectVersion>,
    default_delay: Duration,
    completion_extension: Duration,
}

/// A [`ShardClient`] that keeps the consistency ledger up to date.
#[derive(Clone)]
pub struct ConsistentShardClient {
    shard: ShardClient,
    ledger: Option<Arc<dyn Ledger>>,
    version_header: HeaderName,
    version_response_header: HeaderName,
    default_delay: Duration,
    multipart_delay: Duration,
    completion_extension: Duration,
}

impl ConsistentShardClient {
    /// Creates a wrapper. With `ledger` unset nothing is ever recorded.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a configured header name is invalid.
    pub fn new(
        shard: ShardClient,
        ledger: Option<Arc<dyn Ledger>>,
        config: &WatchdogConfig,
    ) -> shardgate_core::Result<Self> {
        let header = |name: &str| {
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                shardgate_core::Error::Config(format!("invalid header name {name:?}: {e}"))
            })
        };
        Ok(Self {
            shard,
            ledger,
            version_header: header(&config.version_header)?,
            version_response_header: header(&config.version_response_header)?,
            default_delay: config.default_delay_duration(),
            multipart_delay: config.multipart_delay_duration(),
            completion_extension: config.completion_extension_duration(),
        })
    }

    /// Returns the wrapped shard client.
    pub fn shard(&self) -> &ShardClient {
        &self.shard
    }

    /// Records, dispatches and schedules settlement of one request.
    ///
    /// The completion task waits for `done` (a dropped sender counts as a
    /// default outcome) and for every backend to report.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain is unknown or its shard is empty.
    pub async fn handle(
        &self,
        ctx: RequestContext,
        mut request: S3Request,
        done: oneshot::Receiver<RequestOutcome>,
    ) -> Result<Handled, ReplicationError> {
        let shape = RequestShape::new(request.method(), request.uri());
        let props = self.shard.resolver().ring_props(&ctx.domain)?;
        let level = props.consistency_level;

        let marker = match self.record_for(&ctx, &shape, &request, level).await {
            Some(record) => match self.insert(record).await {
                Ok(marker) => Some(marker),
                Err(reason) if level == ConsistencyLevel::Strong => {
                    warn!(
                        domain = %ctx.domain,
                        request_id = %ctx.request_id,
                        error = %reason,
                        "Rejecting request: consistency record not durable"
                    );
                    return Ok(Handled {
                        response: service_unavailable(&reason, &ctx.request_id),
                        completion: None,
                    });
                }
                Err(reason) => {
                    debug!(
                        domain = %ctx.domain,
                        request_id = %ctx.request_id,
                        error = %reason,
                        "Consistency record not written"
                    );
                    None
                }
            },
            None => None,
        };

        if let Some(marker) = &marker {
            if stamps_version(&shape) {
                if let Ok(value) = HeaderValue::from_str(&marker.version.to_string()) {
                    request.headers_mut().insert(self.version_header.clone(), value);
                }
            }
        }

        let dispatched = self.shard.dispatch(&ctx.domain, request).await?;
        let mut response = dispatched.response;
        let succeeded = response.status().as_u16() < 400;

        if let (Some(marker), true) = (&marker, shape.is_initiate_multipart() && succeeded) {
            if let Ok(value) = HeaderValue::from_str(&marker.version.to_string()) {
                response.headers_mut().insert(self.version_response_header.clone(), value);
            }
        }

        let observed = if props.read_repair
            && matches!(*shape.method(), Method::GET | Method::HEAD)
            && shape.is_object_path()
            && succeeded
        {
            self.header_version(response.headers())
        } else {
            None
        };

        let settle = Settle {
            ledger: self.ledger.clone(),
            object_id: shape.object_id().map(str::to_owned),
            ctx,
            level,
            marker,
            single_backend: shape.is_multipart(),
            multipart_completed: shape.is_complete_multipart() && succeeded,
            observed,
            default_delay: self.default_delay,
            completion_extension: self.completion_extension,
        };
        let completion = tokio::spawn(settle.run(dispatched.summary, done));

        Ok(Handled { response, completion: Some(completion) })
    }

    /// Decides whether the request is recorded and builds its record.
    async fn record_for(
        &self,
        ctx: &RequestContext,
        shape: &RequestShape,
        request: &S3Request,
        level: ConsistencyLevel,
    ) -> Option<NewRecord> {
        if self.ledger.is_none() || !level.records() {
            return None;
        }
        let method = logged_mutation(shape)?;
        let delay =
            if shape.is_initiate_multipart() { self.multipart_delay } else { self.default_delay };
        let object_id = shape.object_id()?;

        let mut record = NewRecord::new(&ctx.domain, object_id, method, delay)
            .request_id(&ctx.request_id)
            .access_key(&ctx.access_key);
        if shape.is_complete_multipart() {
            if let Some(echoed) = self.echoed_version(ctx, object_id, request).await {
                record = record.version(echoed);
            }
        }
        Some(record)
    }

    /// Returns the version a completion echoes, if it names a record already
    /// stored for the same object.
    async fn echoed_version(
        &self,
        ctx: &RequestContext,
        object_id: &str,
        request: &S3Request,
    ) -> Option<ObjectVersion> {
        let echoed = self.header_version(request.headers())?;
        let ledger = self.ledger.as_ref()?;
        match ledger.records(&ctx.domain, object_id).await {
            Ok(records) if records.iter().any(|r| r.object_version == echoed) => Some(echoed),
            Ok(_) => {
                debug!(
                    object = %object_id,
                    version = %echoed,
                    "Ignoring echoed version without a matching record"
                );
                None
            }
            Err(e) => {
                debug!(object = %object_id, error = %e, "Could not check echoed version");
                None
            }
        }
    }

    async fn insert(&self, record: NewRecord) -> Result<DeleteMarker, String> {
        let Some(ledger) = &self.ledger else {
            return Err("no ledger configured".to_string());
        };
        ledger.insert(record).await.map_err(|e| e.to_string())
    }

    fn header_version(&self, headers: &http::HeaderMap) -> Option<ObjectVersion> {
        headers.get(&self.version_header)?.to_str().ok()?.parse().ok()
    }
}

/// Logged: DELETE on an object (not an abort), PUT or POST on an object
/// that is not a raw part upload.
fn logged_mutation(shape: &RequestShape) -> Option<RecordMethod> {
    if !shape.is_object_path() {
        return None;
    }
    match *shape.method() {
        Method::DELETE if shape.is_object_delete() => Some(RecordMethod::Delete),
        Method::PUT | Method::POST if !shape.is_part_upload() => Some(RecordMethod::Put),
        _ => None,
    }
}

/// Writes that create object data carry the version to backends.
fn stamps_version(shape: &RequestShape) -> bool {
    shape.is_initiate_multipart()
        || (*shape.method() == Method::PUT && !shape.is_multipart() && !shape.has_query("acl"))
}

impl Settle {
    async fn run(
        self,
        summary: SummaryHandle,
        done: oneshot::Receiver<RequestOutcome>,
    ) -> Completion {
        let outcome = done.await.unwrap_or_default();
        let summary = summary.wait().await;

        let diverged = if summary.no_errors() { None } else { self.observed };
        let decided = CompletionSummary {
            marker: self.marker.clone(),
            no_errors: summary.no_errors() && !self.single_backend,
            multipart_completed: self.multipart_completed,
            read_repair: outcome.read_repair.or(diverged),
        };

        let completion = self.apply(decided, &summary).await;
        counter!("shardgate_completions_total", "action" => completion.name()).increment(1);
        completion
    }

    async fn apply(&self, decided: CompletionSummary, summary: &ReplicationSummary) -> Completion {
        let Some(ledger) = &self.ledger else {
            return Completion::Ignored;
        };

        if let Some(version) = decided.read_repair {
            let Some(object_id) = &self.object_id else {
                return Completion::Ignored;
            };
            if !self.level.records() {
                return Completion::Ignored;
            }
            let record =
                NewRecord::new(&self.ctx.domain, object_id, RecordMethod::Put, self.default_delay)
                    .request_id(&self.ctx.request_id)
                    .access_key(&self.ctx.access_key)
                    .version(version);
            return match ledger.insert(record).await {
                Ok(_) => {
                    debug!(object = %object_id, version = %version, "Scheduled read repair");
                    Completion::ReadRepaired
                }
                Err(e) => {
                    warn!(object = %object_id, error = %e, "Failed to schedule read repair");
                    Completion::Ignored
                }
            };
        }

        let Some(marker) = decided.marker else {
            return Completion::Ignored;
        };

        if decided.multipart_completed {
            return match ledger.extend_execution_delay(&marker, self.completion_extension).await {
                Ok(()) => Completion::DelayExtended,
                Err(e) => {
                    warn!(object = %marker.object_id, error = %e, "Failed to extend record delay");
                    Completion::Ignored
                }
            };
        }

        if decided.no_errors {
            return match ledger.delete(&marker).await {
                Ok(_) => Completion::Compacted,
                Err(e) => {
                    warn!(object = %marker.object_id, error = %e, "Failed to compact records");
                    Completion::Ignored
                }
            };
        }

        debug!(
            object = %marker.object_id,
            version = %marker.version,
            failed = summary.failed.len(),
            incomplete = summary.incomplete,
            "Leaving record for repair"
        );
        Completion::Ignored
    }
}

fn service_unavailable(reason: &str, request_id: &str) -> S3Response {
    let code = S3ErrorCode::ServiceUnavailable;
    let message = format!("consistency record not durable: {reason}");
    let body = error_document(code, &message, request_id);
    let mut response = Response::new(Bytes::from(body));
    *response.status_mut() = code.status_code();
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/xml"));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use http::{Request, StatusCode};
    use shardgate_core::RingProps;
    use shardgate_replication::testing::MemoryBackend;
    use shardgate_replication::{Backend, StaticShardResolver};

    use super::*;
    use crate::error::{LedgerError, Result as LedgerResult};
    use crate::record::ConsistencyRecord;
    use crate::RedbLedger;

    const DOMAIN: &str = "s3.example.com";

    /// Ledger whose inserts can be made to fail.
    struct FlakyLedger {
        inner: RedbLedger,
        fail_inserts: AtomicBool,
    }

    #[async_trait]
    impl Ledger for FlakyLedger {
        async fn insert(&self, record: NewRecord) -> LedgerResult<DeleteMarker> {
            if self.fail_inserts.load(Ordering::SeqCst) {
                return Err(LedgerError::Database("disk full".into()));
            }
            self.inner.insert(record).await
        }
        async fn delete(&self, marker: &DeleteMarker) -> LedgerResult<usize> {
            self.inner.delete(marker).await
        }
        async fn extend_execution_delay(
            &self,
            marker: &DeleteMarker,
            extra: Duration,
        ) -> LedgerResult<()> {
            self.inner.extend_execution_delay(marker, extra).await
        }
        async fn claim_due(
            &self,
            limit: usize,
            lease: Duration,
        ) -> LedgerResult<Vec<ConsistencyRecord>> {
            self.inner.claim_due(limit, lease).await
        }
        async fn defer(
            &self,
            record: &ConsistencyRecord,
            error: &str,
            failure_delay: Duration,
        ) -> LedgerResult<()> {
            self.inner.defer(record, error, failure_delay).await
        }
        async fn release(&self, records: &[ConsistencyRecord]) -> LedgerResult<()> {
            self.inner.release(records).await
        }
        async fn records(
            &self,
            domain: &str,
            object_id: &str,
        ) -> LedgerResult<Vec<ConsistencyRecord>> {
            self.inner.records(domain, object_id).await
        }
        async fn len(&self) -> LedgerResult<usize> {
            self.inner.len().await
        }
    }

    struct Fixture {
        backends: Vec<Arc<MemoryBackend>>,
        ledger: Arc<FlakyLedger>,
        client: ConsistentShardClient,
    }

    fn fixture(level: ConsistencyLevel, read_repair: bool) -> Fixture {
        let backends: Vec<Arc<MemoryBackend>> = (0..2)
            .map(|i| {
                let b = Arc::new(MemoryBackend::new(format!("backend-{i}")));
                b.create_bucket("b");
                b
            })
            .collect();
        let resolver = StaticShardResolver::new().with_region(
            DOMAIN,
            backends.iter().map(|b| Arc::clone(b) as Arc<dyn Backend>).collect(),
            RingProps { consistency_level: level, read_repair },
        );
        let ledger = Arc::new(FlakyLedger {
            inner: RedbLedger::open_in_memory().unwrap(),
            fail_inserts: AtomicBool::new(false),
        });
        let client = ConsistentShardClient::new(
            ShardClient::new(Arc::new(resolver)),
            Some(Arc::clone(&ledger) as Arc<dyn Ledger>),
            &WatchdogConfig::default(),
        )
        .unwrap();
        Fixture { backends, ledger, client }
    }

    fn ctx() -> RequestContext {
        static NEXT_ID: AtomicUsize = AtomicUsize::new(1);
        RequestContext {
            domain: DOMAIN.to_string(),
            request_id: format!("req-{}", NEXT_ID.fetch_add(1, Ordering::SeqCst)),
            access_key: "AKIA".to_string(),
        }
    }

    fn request(method: Method, uri: &str) -> S3Request {
        Request::builder().method(method).uri(uri).body(Bytes::from_static(b"data")).unwrap()
    }

    async fn run(client: &ConsistentShardClient, request: S3Request) -> (S3Response, Completion) {
        let (tx, rx) = oneshot::channel();
        let handled = client.handle(ctx(), request, rx).await.unwrap();
        tx.send(RequestOutcome::default()).unwrap();
        let completion = handled.completion.unwrap().await.unwrap();
        (handled.response, completion)
    }

    #[tokio::test]
    async fn test_clean_put_is_compacted() {
        let f = fixture(ConsistencyLevel::Strong, false);
        let (response, completion) = run(&f.client, request(Method::PUT, "/b/k")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(completion, Completion::Compacted);
        assert!(f.ledger.is_empty().await.unwrap());

        let stored = f.backends[0].object("b", "k").unwrap();
        let version: ObjectVersion =
            stored.header("x-amz-meta-object-version").unwrap().parse().unwrap();
        let replica = f.backends[1].object("b", "k").unwrap();
        assert_eq!(replica.header("x-amz-meta-object-version"), Some(version.to_string().as_str()));
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_record() {
        let f = fixture(ConsistencyLevel::Strong, false);
        f.backends[1].set_failing(true);

        let (response, completion) = run(&f.client, request(Method::PUT, "/b/k")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(completion, Completion::Ignored);
        let records = f.ledger.records(DOMAIN, "b/k").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, RecordMethod::Put);
        assert!(records[0].request_id.starts_with("req-"));
        assert_eq!(records[0].access_key, "AKIA");
        assert_eq!(records[0].execution_delay, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_strong_rejects_when_ledger_fails() {
        let f = fixture(ConsistencyLevel::Strong, false);
        f.ledger.fail_inserts.store(true, Ordering::SeqCst);

        let (_tx, rx) = oneshot::channel();
        let handled = f.client.handle(ctx(), request(Method::PUT, "/b/k"), rx).await.unwrap();

        assert_eq!(handled.response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(handled.completion.is_none());
        let body = std::str::from_utf8(handled.response.body()).unwrap();
        assert!(body.contains("<Code>ServiceUnavailable</Code>"));
        assert!(!f.backends[0].has_object("b", "k"));
    }

    #[tokio::test]
    async fn test_weak_proceeds_when_ledger_fails() {
        let f = fixture(ConsistencyLevel::Weak, false);
        f.ledger.fail_inserts.store(true, Ordering::SeqCst);

        let (response, completion) = run(&f.client, request(Method::PUT, "/b/k")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(completion, Completion::Ignored);
        assert!(f.backends[0].has_object("b", "k"));
        let stored = f.backends[0].object("b", "k").unwrap();
        assert!(stored.header("x-amz-meta-object-version").is_none());
    }

    #[tokio::test]
    async fn test_level_none_records_nothing() {
        let f = fixture(ConsistencyLevel::None, false);
        f.backends[1].set_failing(true);

        let (_, completion) = run(&f.client, request(Method::PUT, "/b/k")).await;
        assert_eq!(completion, Completion::Ignored);
        assert!(f.ledger.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_unlogged_requests() {
        let f = fixture(ConsistencyLevel::Strong, false);
        f.backends[1].set_failing(true);

        for (method, uri) in [
            (Method::GET, "/b/k"),
            (Method::HEAD, "/b/k"),
            (Method::PUT, "/b2"),
            (Method::GET, "/b"),
            (Method::PUT, "/b/k?partNumber=1&uploadId=u"),
            (Method::DELETE, "/b/k?uploadId=u"),
        ] {
            let (_, completion) = run(&f.client, request(method, uri)).await;
            assert_eq!(completion, Completion::Ignored);
        }
        assert!(f.ledger.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_is_logged() {
        let f = fixture(ConsistencyLevel::Weak, false);
        f.backends[1].set_failing(true);

        run(&f.client, request(Method::DELETE, "/b/k")).await;
        let records = f.ledger.records(DOMAIN, "b/k").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, RecordMethod::Delete);
    }

    #[tokio::test]
    async fn test_multipart_initiate_and_complete() {
        let f = fixture(ConsistencyLevel::Strong, false);

        let (init, completion) = run(&f.client, request(Method::POST, "/b/big?uploads")).await;
        // Only one backend holds the upload, so the record stays.
        assert_eq!(completion, Completion::Ignored);
        let version = init.headers()["x-object-version"].to_str().unwrap().to_string();
        let records = f.ledger.records(DOMAIN, "b/big").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].execution_delay, Duration::from_secs(7 * 24 * 60 * 60));
        assert_eq!(records[0].object_version.to_string(), version);

        let body = std::str::from_utf8(init.body()).unwrap().to_string();
        let upload_id =
            body.split("<UploadId>").nth(1).unwrap().split("</UploadId>").next().unwrap();

        let mut complete = request(Method::POST, &format!("/b/big?uploadId={upload_id}"));
        complete.headers_mut().insert("x-amz-meta-object-version", version.parse().unwrap());
        let (response, completion) = run(&f.client, complete).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(completion, Completion::DelayExtended);
        let records = f.ledger.records(DOMAIN, "b/big").await.unwrap();
        // Initiate and completion records share the echoed version.
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.object_version.to_string() == version));
        let shortest = records.iter().map(|r| r.execution_delay).min().unwrap();
        assert_eq!(shortest, Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_read_repair_on_divergent_get() {
        let f = fixture(ConsistencyLevel::Weak, true);
        f.backends[0].put_object(
            "b",
            "k",
            Bytes::from_static(b"v"),
            &[("x-amz-meta-object-version", "00000000000000000042")],
        );

        let (response, completion) = run(&f.client, request(Method::GET, "/b/k")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(completion, Completion::ReadRepaired);

        let records = f.ledger.records(DOMAIN, "b/k").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].object_version.to_string(), "00000000000000000042");
    }

    #[tokio::test]
    async fn test_unmatched_echoed_version_is_ignored() {
        let f = fixture(ConsistencyLevel::Strong, false);
        let (_, completion) = run(&f.client, request(Method::PUT, "/b/first")).await;
        assert_eq!(completion, Completion::Compacted);
        let before = f.ledger.inner.clock().current();

        let mut complete = request(Method::POST, "/b/x?uploadId=bogus");
        complete
            .headers_mut()
            .insert("x-amz-meta-object-version", "18446744073709551615".parse().unwrap());
        run(&f.client, complete).await;

        let records = f.ledger.records(DOMAIN, "b/x").await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].object_version.timestamp() > before);
        assert_ne!(records[0].object_version.to_string(), "18446744073709551615");

        f.backends[1].set_failing(true);
        run(&f.client, request(Method::PUT, "/b/k")).await;
        let records = f.ledger.records(DOMAIN, "b/k").await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].object_version.timestamp() > before);
    }

    #[tokio::test]
    async fn test_read_repair_ignores_future_version() {
        let f = fixture(ConsistencyLevel::Weak, true);
        f.backends[0].put_object(
            "b",
            "k",
            Bytes::from_static(b"v"),
            &[("x-amz-meta-object-version", "18446744073709551615")],
        );

        let (response, completion) = run(&f.client, request(Method::GET, "/b/k")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(completion, Completion::Ignored);
        assert!(f.ledger.is_empty().await.unwrap());

        let record = NewRecord::new(DOMAIN, "b/k", RecordMethod::Put, Duration::ZERO);
        let next = f.ledger.inner.insert(record).await.unwrap();
        assert!(next.version.timestamp().physical_time() < (1 << 47));
    }

    #[tokio::test]
    async fn test_read_repair_on_divergent_head() {
        let f = fixture(ConsistencyLevel::Weak, true);
        f.backends[1].put_object(
            "b",
            "k",
            Bytes::from_static(b"v"),
            &[("x-amz-meta-object-version", "00000000000000000042")],
        );

        let (response, completion) = run(&f.client, request(Method::HEAD, "/b/k")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(completion, Completion::ReadRepaired);
        let records = f.ledger.records(DOMAIN, "b/k").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].object_version.to_string(), "00000000000000000042");
    }

    #[tokio::test]
    async fn test_unknown_domain() {
        let f = fixture(ConsistencyLevel::Strong, false);
        let (_tx, rx) = oneshot::channel();
        let ctx = RequestContext { domain: "nowhere".into(), ..ctx() };
        let result = f.client.handle(ctx, request(Method::PUT, "/b/k"), rx).await;
        assert!(matches!(result, Err(ReplicationError::UnknownDomain(_))));
    }
}
