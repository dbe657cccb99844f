// Copyright 2024 The Shardgate Authors
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for shardgate-repair.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::HeaderName;
use http::{Method, Request, Response, StatusCode};
use shardgate_core::{
    Config, ConsistencyLevel, FeederConfig, HlcTimestamp, ObjectVersion, RingProps,
    WatchdogConfig,
};
use shardgate_replication::testing::MemoryBackend;
use shardgate_replication::{
    Backend, BackendError, S3Request, S3Response, ShardClient, ShardResolver, StaticShardResolver,
};
use shardgate_repair::{DriftFilter, RepairService};
use shardgate_watchdog::{
    Completion, ConsistentShardClient, Ledger, NewRecord, RecordMethod, RedbLedger, RequestContext,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

const DOMAIN: &str = "s3.example.com";
const VERSION: &str = "x-amz-meta-object-version";

fn resolver(backends: Vec<Arc<dyn Backend>>) -> Arc<dyn ShardResolver> {
    Arc::new(StaticShardResolver::new().with_region(
        DOMAIN,
        backends,
        RingProps { consistency_level: ConsistencyLevel::Strong, read_repair: false },
    ))
}

fn memory(name: &str) -> Arc<MemoryBackend> {
    let backend = Arc::new(MemoryBackend::new(name));
    backend.create_bucket("b");
    backend
}

fn version(n: u64) -> ObjectVersion {
    ObjectVersion::new(HlcTimestamp::from_parts(n, 0))
}

/// Runs the repair service until the ledger drains or a second passes.
async fn drain(ledger: &Arc<RedbLedger>, resolver: Arc<dyn ShardResolver>) {
    let mut config = Config::default();
    config.feeder = FeederConfig::default().poll_interval(Duration::from_millis(10));
    let service =
        RepairService::from_config(&config, Arc::clone(ledger) as Arc<dyn Ledger>, resolver)
            .unwrap();
    let shutdown = CancellationToken::new();
    let handle = service.spawn(shutdown.clone());

    for _ in 0..100 {
        if ledger.is_empty().await.unwrap() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
}

/// A write that reached only one backend is copied to the other and its
/// record compacted.
#[tokio::test]
async fn test_partial_write_is_repaired() {
    let a = memory("a");
    let b = memory("b");
    let resolver = resolver(vec![Arc::clone(&a) as Arc<dyn Backend>, Arc::clone(&b) as _]);
    let ledger = Arc::new(RedbLedger::open_in_memory().unwrap());
    let client = ConsistentShardClient::new(
        ShardClient::new(Arc::clone(&resolver)),
        Some(Arc::clone(&ledger) as Arc<dyn Ledger>),
        &WatchdogConfig::default().default_delay(Duration::ZERO),
    )
    .unwrap();

    b.set_failing(true);
    let request = Request::builder()
        .method(Method::PUT)
        .uri("/b/k")
        .header("content-type", "text/plain")
        .body(Bytes::from_static(b"payload"))
        .unwrap();
    let ctx =
        RequestContext { domain: DOMAIN.into(), request_id: "r1".into(), ..Default::default() };
    let (tx, rx) = oneshot::channel();
    let handled = client.handle(ctx, request, rx).await.unwrap();
    assert_eq!(handled.response.status(), StatusCode::OK);
    drop(tx);
    assert_eq!(handled.completion.unwrap().await.unwrap(), Completion::Ignored);
    b.set_failing(false);

    let records = ledger.records(DOMAIN, "b/k").await.unwrap();
    assert_eq!(records.len(), 1);
    let filter = DriftFilter::new(Arc::clone(&resolver), HeaderName::from_static(VERSION));
    let task = filter.plan(&records[0]).await.unwrap();
    assert_eq!(task.source.as_ref().map(|s| s.name()), Some("a"));
    assert_eq!(task.destinations.iter().map(|d| d.name()).collect::<Vec<_>>(), vec!["b"]);

    tokio::time::sleep(Duration::from_millis(5)).await;
    drain(&ledger, resolver).await;

    assert!(ledger.is_empty().await.unwrap());
    let copy = b.object("b", "k").unwrap();
    assert_eq!(copy.body, Bytes::from_static(b"payload"));
    assert_eq!(copy.header("content-type"), Some("text/plain"));
    assert_eq!(copy.header(VERSION), a.object("b", "k").unwrap().header(VERSION));
}

/// A copy newer than the record is left alone.
#[tokio::test]
async fn test_newer_write_is_not_clobbered() {
    let a = memory("a");
    let b = memory("b");
    let old = version(5).to_string();
    let new = version(9).to_string();
    a.put_object("b", "k", Bytes::from_static(b"old"), &[(VERSION, old.as_str())]);
    b.put_object("b", "k", Bytes::from_static(b"new"), &[(VERSION, new.as_str())]);

    let ledger = Arc::new(RedbLedger::open_in_memory().unwrap());
    ledger
        .insert(
            NewRecord::new(DOMAIN, "b/k", RecordMethod::Put, Duration::ZERO).version(version(5)),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    drain(&ledger, resolver(vec![Arc::clone(&a) as Arc<dyn Backend>, Arc::clone(&b) as _])).await;

    assert!(ledger.is_empty().await.unwrap());
    assert_eq!(a.object("b", "k").unwrap().body, Bytes::from_static(b"old"));
    assert_eq!(b.object("b", "k").unwrap().body, Bytes::from_static(b"new"));
    assert!(a.requests().iter().all(|r| r.method == Method::HEAD));
}

/// Answers DELETE with 404, like a backend that lost the object already.
struct DeleteNotFound(Arc<MemoryBackend>);

#[async_trait]
impl Backend for DeleteNotFound {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn endpoint(&self) -> &str {
        self.0.endpoint()
    }

    fn is_maintenance(&self) -> bool {
        false
    }

    async fn send(&self, request: S3Request) -> Result<S3Response, BackendError> {
        if request.method() == Method::DELETE {
            let body = Bytes::from_static(b"<Error><Code>NoSuchKey</Code></Error>");
            let mut response = Response::new(body);
            *response.status_mut() = StatusCode::NOT_FOUND;
            return Ok(response);
        }
        self.0.send(request).await
    }
}

/// Repairing a delete against a backend that answers 404 still converges.
#[tokio::test]
async fn test_delete_repair_is_idempotent() {
    let a = memory("a");
    let b = memory("b");
    a.put_object("b", "k", Bytes::from_static(b"stale"), &[]);
    b.put_object("b", "k", Bytes::from_static(b"stale"), &[]);

    let ledger = Arc::new(RedbLedger::open_in_memory().unwrap());
    ledger
        .insert(NewRecord::new(DOMAIN, "b/k", RecordMethod::Delete, Duration::ZERO))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let backends: Vec<Arc<dyn Backend>> =
        vec![Arc::new(DeleteNotFound(Arc::clone(&a))) as Arc<dyn Backend>, Arc::clone(&b) as _];
    drain(&ledger, resolver(backends)).await;

    assert!(ledger.is_empty().await.unwrap());
    assert!(!b.has_object("b", "k"));
}

/// A backend refusing the drift check keeps the record for a later cycle.
#[tokio::test]
async fn test_forbidden_head_defers_record() {
    let a = memory("a");
    let b = memory("b");
    let stamp = version(5).to_string();
    a.put_object("b", "k", Bytes::from_static(b"x"), &[(VERSION, stamp.as_str())]);
    b.set_status_override(Some(StatusCode::FORBIDDEN));

    let ledger = Arc::new(RedbLedger::open_in_memory().unwrap());
    ledger
        .insert(
            NewRecord::new(DOMAIN, "b/k", RecordMethod::Put, Duration::ZERO).version(version(5)),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    drain(&ledger, resolver(vec![a as Arc<dyn Backend>, b as _])).await;

    let records = ledger.records(DOMAIN, "b/k").await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].error.as_deref().is_some_and(|e| e.contains("probe")));
    assert!(records[0].due_at() > chrono::Utc::now());
}

/// A transient failure keeps the record, annotated for the next attempt.
#[tokio::test]
async fn test_unreachable_backend_defers_record() {
    let a = memory("a");
    let b = memory("b");
    let stamp = version(5).to_string();
    a.put_object("b", "k", Bytes::from_static(b"x"), &[(VERSION, stamp.as_str())]);
    b.set_failing(true);

    let ledger = Arc::new(RedbLedger::open_in_memory().unwrap());
    ledger
        .insert(
            NewRecord::new(DOMAIN, "b/k", RecordMethod::Put, Duration::ZERO).version(version(5)),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    drain(&ledger, resolver(vec![a as Arc<dyn Backend>, b as _])).await;

    let records = ledger.records(DOMAIN, "b/k").await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].error.is_some());
    assert!(records[0].due_at() > chrono::Utc::now());
}
