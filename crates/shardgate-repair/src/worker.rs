//! Repair worker: executes the migrations planned by the drift filter.
//!
//! A PUT repair reads the object and its ACL from the source and writes both
//! to every destination. Objects at or above the multipart threshold are
//! copied in parts. When a destination lacks the bucket, the bucket is
//! created (optionally with the source bucket's ACL) and the write retried
//! once. A DELETE repair removes the object from every destination; a 404 is
//! already converged.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::join_all;
use http::header::{
    HeaderMap, HeaderName, HeaderValue, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_ENCODING,
    CONTENT_LENGTH, CONTENT_TYPE, ETAG,
};
use http::{Method, StatusCode};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use shardgate_core::RepairConfig;
use shardgate_replication::{Backend, S3Request, S3Response};
use shardgate_watchdog::{ConsistencyRecord, RecordMethod};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::error::{RepairError, RepairErrorKind, Result};
use crate::filter::{build_request, object_request, RepairTask};

/// Headers carried from the source object to its copies.
fn is_copied(name: &HeaderName) -> bool {
    name == CONTENT_TYPE
        || name == CONTENT_ENCODING
        || name == CONTENT_DISPOSITION
        || name == CACHE_CONTROL
        || name.as_str().starts_with("x-amz-meta-")
}

/// The object as read from the source backend.
struct SourceObject {
    body: Bytes,
    headers: HeaderMap,
    acl: Bytes,
}

#[derive(Deserialize)]
struct InitiateMultipartUploadResult {
    #[serde(rename = "UploadId")]
    upload_id: String,
}

#[derive(Serialize)]
#[serde(rename = "CompleteMultipartUpload")]
struct CompleteMultipartUpload {
    #[serde(rename = "Part")]
    parts: Vec<CompletedPart>,
}

#[derive(Serialize)]
struct CompletedPart {
    #[serde(rename = "PartNumber")]
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
}

/// Executes repair tasks with bounded concurrency.
pub struct RepairWorker {
    semaphore: Arc<Semaphore>,
    config: RepairConfig,
}

impl RepairWorker {
    /// Creates a worker running at most `config.max_concurrent` migrations.
    pub fn new(config: RepairConfig) -> Self {
        Self { semaphore: Arc::new(Semaphore::new(config.max_concurrent.max(1))), config }
    }

    /// Returns the worker configuration.
    pub fn config(&self) -> &RepairConfig {
        &self.config
    }

    /// Converges every destination of `task`.
    ///
    /// # Errors
    ///
    /// Returns the first failure among the destinations. Destinations that
    /// succeeded keep their copy; a retry repeats the work idempotently.
    pub async fn execute(&self, task: &RepairTask) -> Result<()> {
        if task.is_empty() {
            return Ok(());
        }
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| RepairError::new(RepairErrorKind::Internal, e.to_string()))?;

        let start = Instant::now();
        let result = match task.method() {
            RecordMethod::Put => self.copy(task).await,
            RecordMethod::Delete => self.remove(task).await,
        };

        let method = task.method().name();
        match &result {
            Ok(()) => {
                counter!("shardgate_repairs_total", "method" => method, "outcome" => "repaired")
                    .increment(1);
                histogram!("shardgate_repair_duration_seconds")
                    .record(start.elapsed().as_secs_f64());
                info!(
                    object = %task.record.object_id,
                    method,
                    destinations = task.destinations.len(),
                    duration_ms = start.elapsed().as_millis(),
                    "Repair completed"
                );
            }
            Err(e) => {
                let outcome = e.kind().name();
                counter!("shardgate_repairs_total", "method" => method, "outcome" => outcome)
                    .increment(1);
                warn!(object = %task.record.object_id, method, error = %e, "Repair failed");
            }
        }
        result
    }

    async fn copy(&self, task: &RepairTask) -> Result<()> {
        let source = task.source.as_ref().ok_or_else(|| {
            RepairError::new(RepairErrorKind::Internal, "PUT repair without a source")
        })?;
        let object = read_source(source.as_ref(), &task.record).await?;
        counter!("shardgate_repair_bytes_total").increment(object.body.len() as u64);

        let copies = task
            .destinations
            .iter()
            .map(|dest| self.copy_to(source.as_ref(), dest.as_ref(), &task.record, &object));
        first_error(join_all(copies).await)?;

        if self.config.move_objects {
            delete_object(source.as_ref(), &task.record).await?;
        }
        Ok(())
    }

    async fn copy_to(
        &self,
        source: &dyn Backend,
        dest: &dyn Backend,
        record: &ConsistencyRecord,
        object: &SourceObject,
    ) -> Result<()> {
        match self.upload(dest, record, object).await {
            // A write can only miss the bucket.
            Err(e) if e.kind() == RepairErrorKind::NotFound => {
                debug!(backend = %dest.name(), bucket = %record.bucket(), "Creating bucket");
                self.create_bucket(source, dest, record).await?;
                self.upload(dest, record, object).await?;
            }
            other => other?,
        }

        let request = with_body(object_request(Method::PUT, record, "acl")?, object.acl.clone());
        let response = dest.send(request).await?;
        if !response.status().is_success() {
            return Err(status_error(dest, "PUT acl", &response));
        }
        debug!(backend = %dest.name(), object = %record.object_id, "Copied object");
        Ok(())
    }

    async fn upload(
        &self,
        dest: &dyn Backend,
        record: &ConsistencyRecord,
        object: &SourceObject,
    ) -> Result<()> {
        let threshold = self.config.multipart_threshold;
        if threshold > 0 && self.config.part_size > 0 && object.body.len() as u64 >= threshold {
            return self.upload_multipart(dest, record, object).await;
        }

        let mut request = with_body(object_request(Method::PUT, record, "")?, object.body.clone());
        request.headers_mut().extend(object.headers.clone());
        let response = dest.send(request).await?;
        if !response.status().is_success() {
            return Err(status_error(dest, "PUT", &response));
        }
        Ok(())
    }

    async fn upload_multipart(
        &self,
        dest: &dyn Backend,
        record: &ConsistencyRecord,
        object: &SourceObject,
    ) -> Result<()> {
        let mut request = object_request(Method::POST, record, "uploads")?;
        request.headers_mut().extend(object.headers.clone());
        let response = dest.send(request).await?;
        if !response.status().is_success() {
            return Err(status_error(dest, "initiate multipart", &response));
        }
        let upload_id = std::str::from_utf8(response.body())
            .ok()
            .and_then(|text| quick_xml::de::from_str::<InitiateMultipartUploadResult>(text).ok())
            .map(|result| result.upload_id)
            .ok_or_else(|| {
                RepairError::new(
                    RepairErrorKind::Backend,
                    format!("initiate multipart on {} returned no upload id", dest.name()),
                )
            })?;

        let result = self.upload_parts(dest, record, object, &upload_id).await;
        if result.is_err() {
            let query = format!("uploadId={upload_id}");
            let aborted = match object_request(Method::DELETE, record, &query) {
                Ok(request) => dest.send(request).await.is_ok(),
                Err(_) => false,
            };
            if !aborted {
                warn!(backend = %dest.name(), upload_id = %upload_id, "Failed to abort upload");
            }
        }
        result
    }

    async fn upload_parts(
        &self,
        dest: &dyn Backend,
        record: &ConsistencyRecord,
        object: &SourceObject,
        upload_id: &str,
    ) -> Result<()> {
        let part_size = self.config.part_size as usize;
        let total = object.body.len();
        let mut parts = Vec::with_capacity(total.div_ceil(part_size));
        let mut offset = 0;

        while offset < total {
            let end = (offset + part_size).min(total);
            let part_number = parts.len() as u32 + 1;
            let query = format!("partNumber={part_number}&uploadId={upload_id}");
            let request = object_request(Method::PUT, record, &query)?;
            let request = with_body(request, object.body.slice(offset..end));
            let response = dest.send(request).await?;
            if !response.status().is_success() {
                return Err(status_error(dest, "upload part", &response));
            }
            let etag = response
                .headers()
                .get(ETAG)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            parts.push(CompletedPart { part_number, etag });
            offset = end;
        }

        let body = quick_xml::se::to_string(&CompleteMultipartUpload { parts })
            .map_err(|e| RepairError::new(RepairErrorKind::Internal, e.to_string()))?;
        let query = format!("uploadId={upload_id}");
        let request = with_body(object_request(Method::POST, record, &query)?, Bytes::from(body));
        let response = dest.send(request).await?;
        if !response.status().is_success() {
            return Err(status_error(dest, "complete multipart", &response));
        }
        Ok(())
    }

    async fn create_bucket(
        &self,
        source: &dyn Backend,
        dest: &dyn Backend,
        record: &ConsistencyRecord,
    ) -> Result<()> {
        let bucket_uri = format!("/{}", record.bucket());
        let request = build_request(Method::PUT, &bucket_uri, &record.access_key, Bytes::new())?;
        let response = dest.send(request).await?;
        // 409 means the bucket appeared concurrently.
        if !response.status().is_success() && response.status() != StatusCode::CONFLICT {
            return Err(status_error(dest, "create bucket", &response));
        }

        if self.config.copy_bucket_acl {
            let acl_uri = format!("{bucket_uri}?acl");
            let request = build_request(Method::GET, &acl_uri, &record.access_key, Bytes::new())?;
            let response = source.send(request).await?;
            if !response.status().is_success() {
                return Err(status_error(source, "GET bucket acl", &response));
            }
            let request =
                build_request(Method::PUT, &acl_uri, &record.access_key, response.into_body())?;
            let response = dest.send(request).await?;
            if !response.status().is_success() {
                return Err(status_error(dest, "PUT bucket acl", &response));
            }
        }
        counter!("shardgate_repair_buckets_created_total").increment(1);
        Ok(())
    }

    async fn remove(&self, task: &RepairTask) -> Result<()> {
        let deletes =
            task.destinations.iter().map(|dest| delete_object(dest.as_ref(), &task.record));
        first_error(join_all(deletes).await)
    }
}

async fn delete_object(dest: &dyn Backend, record: &ConsistencyRecord) -> Result<()> {
    let response = dest.send(object_request(Method::DELETE, record, "")?).await?;
    let status = response.status();
    if status.is_success() || status == StatusCode::NOT_FOUND {
        debug!(backend = %dest.name(), object = %record.object_id, "Removed object");
        Ok(())
    } else {
        Err(status_error(dest, "DELETE", &response))
    }
}

async fn read_source(source: &dyn Backend, record: &ConsistencyRecord) -> Result<SourceObject> {
    let response = source.send(object_request(Method::GET, record, "")?).await?;
    if !response.status().is_success() {
        return Err(status_error(source, "GET", &response));
    }
    let mut headers = HeaderMap::new();
    for (name, value) in response.headers() {
        if is_copied(name) {
            headers.insert(name.clone(), value.clone());
        }
    }
    let body = response.into_body();

    let response = source.send(object_request(Method::GET, record, "acl")?).await?;
    if !response.status().is_success() {
        return Err(status_error(source, "GET acl", &response));
    }
    Ok(SourceObject { body, headers, acl: response.into_body() })
}

fn with_body(request: S3Request, body: Bytes) -> S3Request {
    let (mut parts, _) = request.into_parts();
    if let Ok(len) = HeaderValue::from_str(&body.len().to_string()) {
        parts.headers.insert(CONTENT_LENGTH, len);
    }
    S3Request::from_parts(parts, body)
}

fn status_error(backend: &dyn Backend, operation: &str, response: &S3Response) -> RepairError {
    RepairError::from_status(backend.name(), operation, response.status().as_u16(), response.body())
}

fn first_error(results: Vec<Result<()>>) -> Result<()> {
    results.into_iter().collect()
}
