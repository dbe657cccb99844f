//! In-memory S3 backend for tests.
//!
//! `MemoryBackend` implements enough of S3 for the proxy and the repair
//! pipeline: buckets, objects with metadata, ACLs, listings, and multipart
//! uploads. Faults are injected with [`set_failing`](MemoryBackend::set_failing)
//! (transport errors), [`set_delay`](MemoryBackend::set_delay) and
//! [`set_status_override`](MemoryBackend::set_status_override).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use http::{HeaderMap, Method, Response, StatusCode};
use parking_lot::Mutex;
use shardgate_core::RequestShape;
use siphasher::sip::SipHasher13;

use crate::backend::{Backend, S3Request, S3Response};
use crate::error::BackendError;
use crate::listing::{CommonPrefix, ListBucketResult, ListEntry, DEFAULT_MAX_KEYS};

const DEFAULT_ACL: &[u8] =
    b"<AccessControlPolicy><Owner><ID>owner</ID></Owner><AccessControlList/></AccessControlPolicy>";

/// An object held by a [`MemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Object data.
    pub body: Bytes,
    /// Content type and `x-amz-meta-*` headers, lower-cased.
    pub headers: Vec<(String, String)>,
    /// Object ACL document, if one was set.
    pub acl: Option<Bytes>,
}

impl StoredObject {
    /// Returns a stored header value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }

    fn etag(&self) -> String {
        etag(&self.body)
    }
}

/// A request observed by a [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// Request method.
    pub method: Method,
    /// Path and query.
    pub uri: String,
    /// Request headers.
    pub headers: HeaderMap,
}

#[derive(Default)]
struct Bucket {
    acl: Option<Bytes>,
    objects: BTreeMap<String, StoredObject>,
}

struct Upload {
    bucket: String,
    key: String,
    headers: Vec<(String, String)>,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Default)]
struct State {
    buckets: BTreeMap<String, Bucket>,
    uploads: HashMap<String, Upload>,
}

/// An in-memory S3 backend with fault injection.
pub struct MemoryBackend {
    name: String,
    endpoint: String,
    state: Mutex<State>,
    requests: Mutex<Vec<RecordedRequest>>,
    failing: AtomicBool,
    maintenance: AtomicBool,
    delay_ms: AtomicU64,
    status_override: Mutex<Option<StatusCode>>,
    next_upload: AtomicU64,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            endpoint: format!("memory://{name}"),
            name,
            state: Mutex::new(State::default()),
            requests: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            maintenance: AtomicBool::new(false),
            delay_ms: AtomicU64::new(0),
            status_override: Mutex::new(None),
            next_upload: AtomicU64::new(1),
        }
    }

    /// Makes every request fail with a transport error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Flags the backend as under maintenance.
    pub fn set_maintenance(&self, maintenance: bool) {
        self.maintenance.store(maintenance, Ordering::SeqCst);
    }

    /// Delays every response.
    pub fn set_delay(&self, delay: Duration) {
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.delay_ms.store(delay_ms, Ordering::SeqCst);
    }

    /// Answers every request with `status` and an S3 error body.
    pub fn set_status_override(&self, status: Option<StatusCode>) {
        *self.status_override.lock() = status;
    }

    /// Returns every request received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Creates a bucket directly.
    pub fn create_bucket(&self, bucket: &str) {
        self.state.lock().buckets.entry(bucket.to_string()).or_default();
    }

    /// Returns true if the bucket exists.
    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.state.lock().buckets.contains_key(bucket)
    }

    /// Returns the bucket ACL, if one was set.
    pub fn bucket_acl(&self, bucket: &str) -> Option<Bytes> {
        self.state.lock().buckets.get(bucket).and_then(|b| b.acl.clone())
    }

    /// Stores an object directly, creating the bucket if needed.
    pub fn put_object(&self, bucket: &str, key: &str, body: Bytes, headers: &[(&str, &str)]) {
        let headers =
            headers.iter().map(|(k, v)| (k.to_ascii_lowercase(), (*v).to_string())).collect();
        self.state
            .lock()
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .objects
            .insert(key.to_string(), StoredObject { body, headers, acl: None });
    }

    /// Returns a stored object.
    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.state.lock().buckets.get(bucket).and_then(|b| b.objects.get(key).cloned())
    }

    /// Returns true if the object exists.
    pub fn has_object(&self, bucket: &str, key: &str) -> bool {
        self.object(bucket, key).is_some()
    }

    /// Returns the number of multipart uploads still open.
    pub fn open_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    fn handle(&self, request: &S3Request) -> S3Response {
        if let Some(status) = *self.status_override.lock() {
            return error(status, "InjectedFault");
        }

        let shape = RequestShape::new(request.method(), request.uri());
        let Some(bucket) = shape.bucket().map(str::to_owned) else {
            return error(StatusCode::BAD_REQUEST, "InvalidRequest");
        };
        let key = shape
            .object_id()
            .and_then(|id| id.split_once('/'))
            .map(|(_, key)| key.to_string());

        let mut state = self.state.lock();
        match key {
            None => self.bucket_request(&mut state, &shape, &bucket, request),
            Some(key) => self.object_request(&mut state, &shape, &bucket, &key, request),
        }
    }

    fn bucket_request(
        &self,
        state: &mut State,
        shape: &RequestShape,
        bucket: &str,
        request: &S3Request,
    ) -> S3Response {
        let method = shape.method().clone();
        if method == Method::PUT && shape.has_query("acl") {
            return match state.buckets.get_mut(bucket) {
                Some(b) => {
                    b.acl = Some(request.body().clone());
                    empty(StatusCode::OK)
                }
                None => error(StatusCode::NOT_FOUND, "NoSuchBucket"),
            };
        }
        if method == Method::GET && shape.has_query("acl") {
            return match state.buckets.get(bucket) {
                Some(b) => xml(b.acl.clone().unwrap_or_else(|| Bytes::from_static(DEFAULT_ACL))),
                None => error(StatusCode::NOT_FOUND, "NoSuchBucket"),
            };
        }
        if method == Method::PUT {
            state.buckets.entry(bucket.to_string()).or_default();
            return empty(StatusCode::OK);
        }
        if method == Method::HEAD {
            return if state.buckets.contains_key(bucket) {
                empty(StatusCode::OK)
            } else {
                empty(StatusCode::NOT_FOUND)
            };
        }
        if method == Method::DELETE {
            return match state.buckets.get(bucket) {
                None => error(StatusCode::NOT_FOUND, "NoSuchBucket"),
                Some(b) if !b.objects.is_empty() => error(StatusCode::CONFLICT, "BucketNotEmpty"),
                Some(_) => {
                    state.buckets.remove(bucket);
                    empty(StatusCode::NO_CONTENT)
                }
            };
        }
        if shape.is_listing() {
            return match state.buckets.get(bucket) {
                Some(b) => list(bucket, b, shape),
                None => error(StatusCode::NOT_FOUND, "NoSuchBucket"),
            };
        }
        error(StatusCode::NOT_IMPLEMENTED, "NotImplemented")
    }

    fn object_request(
        &self,
        state: &mut State,
        shape: &RequestShape,
        bucket: &str,
        key: &str,
        request: &S3Request,
    ) -> S3Response {
        if shape.is_initiate_multipart() {
            if !state.buckets.contains_key(bucket) {
                return error(StatusCode::NOT_FOUND, "NoSuchBucket");
            }
            let upload_id =
                format!("{}-{}", self.name, self.next_upload.fetch_add(1, Ordering::SeqCst));
            state.uploads.insert(
                upload_id.clone(),
                Upload {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                    headers: kept_headers(request.headers()),
                    parts: BTreeMap::new(),
                },
            );
            return xml(Bytes::from(format!(
                "<InitiateMultipartUploadResult><Bucket>{bucket}</Bucket><Key>{key}</Key><UploadId>{upload_id}</UploadId></InitiateMultipartUploadResult>"
            )));
        }
        if let Some(upload_id) = shape.query_value("uploadId").map(str::to_owned) {
            return self.upload_request(state, shape, &upload_id, request);
        }

        let method = shape.method().clone();
        let Some(b) = state.buckets.get_mut(bucket) else {
            return error(StatusCode::NOT_FOUND, "NoSuchBucket");
        };

        if shape.has_query("acl") {
            let Some(object) = b.objects.get_mut(key) else {
                return error(StatusCode::NOT_FOUND, "NoSuchKey");
            };
            return if method == Method::PUT {
                object.acl = Some(request.body().clone());
                empty(StatusCode::OK)
            } else {
                xml(object.acl.clone().unwrap_or_else(|| Bytes::from_static(DEFAULT_ACL)))
            };
        }

        match method {
            Method::PUT => {
                let object = StoredObject {
                    body: request.body().clone(),
                    headers: kept_headers(request.headers()),
                    acl: None,
                };
                let tag = object.etag();
                b.objects.insert(key.to_string(), object);
                let mut response = empty(StatusCode::OK);
                insert_header(&mut response, ETAG, &tag);
                response
            }
            Method::GET | Method::HEAD => match b.objects.get(key) {
                Some(object) => object_response(object, method == Method::HEAD),
                None if method == Method::HEAD => empty(StatusCode::NOT_FOUND),
                None => error(StatusCode::NOT_FOUND, "NoSuchKey"),
            },
            Method::DELETE => {
                b.objects.remove(key);
                empty(StatusCode::NO_CONTENT)
            }
            _ => error(StatusCode::NOT_IMPLEMENTED, "NotImplemented"),
        }
    }

    fn upload_request(
        &self,
        state: &mut State,
        shape: &RequestShape,
        upload_id: &str,
        request: &S3Request,
    ) -> S3Response {
        if shape.is_abort_multipart() {
            return match state.uploads.remove(upload_id) {
                Some(_) => empty(StatusCode::NO_CONTENT),
                None => error(StatusCode::NOT_FOUND, "NoSuchUpload"),
            };
        }
        if shape.is_part_upload() {
            let Some(number) = shape.query_value("partNumber").and_then(|n| n.parse::<u32>().ok())
            else {
                return error(StatusCode::BAD_REQUEST, "InvalidArgument");
            };
            let Some(upload) = state.uploads.get_mut(upload_id) else {
                return error(StatusCode::NOT_FOUND, "NoSuchUpload");
            };
            let tag = etag(request.body());
            upload.parts.insert(number, request.body().clone());
            let mut response = empty(StatusCode::OK);
            insert_header(&mut response, ETAG, &tag);
            return response;
        }
        if shape.is_complete_multipart() {
            let Some(upload) = state.uploads.remove(upload_id) else {
                return error(StatusCode::NOT_FOUND, "NoSuchUpload");
            };
            let mut body = BytesMut::new();
            for part in upload.parts.values() {
                body.extend_from_slice(part);
            }
            let object = StoredObject { body: body.freeze(), headers: upload.headers, acl: None };
            let tag = object.etag();
            let Some(bucket) = state.buckets.get_mut(&upload.bucket) else {
                return error(StatusCode::NOT_FOUND, "NoSuchBucket");
            };
            bucket.objects.insert(upload.key.clone(), object);
            return xml(Bytes::from(format!(
                "<CompleteMultipartUploadResult><Bucket>{}</Bucket><Key>{}</Key><ETag>{tag}</ETag></CompleteMultipartUploadResult>",
                upload.bucket, upload.key
            )));
        }
        error(StatusCode::NOT_IMPLEMENTED, "NotImplemented")
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_maintenance(&self) -> bool {
        self.maintenance.load(Ordering::SeqCst)
    }

    async fn send(&self, request: S3Request) -> Result<S3Response, BackendError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.requests.lock().push(RecordedRequest {
            method: request.method().clone(),
            uri: request.uri().to_string(),
            headers: request.headers().clone(),
        });
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::Transport {
                backend: self.name.clone(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(self.handle(&request))
    }
}

fn kept_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| *name == CONTENT_TYPE || name.as_str().starts_with("x-amz-meta-"))
        .filter_map(|(name, value)| {
            Some((name.as_str().to_string(), value.to_str().ok()?.to_string()))
        })
        .collect()
}

fn etag(body: &[u8]) -> String {
    let mut hasher = SipHasher13::new();
    hasher.write(body);
    format!("\"{:016x}\"", hasher.finish())
}

fn insert_header(response: &mut S3Response, name: impl http::header::IntoHeaderName, value: &str) {
    if let Ok(value) = http::HeaderValue::from_str(value) {
        response.headers_mut().insert(name, value);
    }
}

fn empty(status: StatusCode) -> S3Response {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = status;
    response
}

fn xml(body: Bytes) -> S3Response {
    let mut response = Response::new(body);
    insert_header(&mut response, CONTENT_TYPE, "application/xml");
    response
}

fn error(status: StatusCode, code: &str) -> S3Response {
    let mut response = xml(Bytes::from(format!("<Error><Code>{code}</Code></Error>")));
    *response.status_mut() = status;
    response
}

fn object_response(object: &StoredObject, head: bool) -> S3Response {
    let mut response =
        if head { empty(StatusCode::OK) } else { Response::new(object.body.clone()) };
    for (name, value) in &object.headers {
        if let Ok(name) = http::HeaderName::from_bytes(name.as_bytes()) {
            insert_header(&mut response, name, value);
        }
    }
    insert_header(&mut response, CONTENT_LENGTH, &object.body.len().to_string());
    insert_header(&mut response, ETAG, &object.etag());
    response
}

fn list(name: &str, bucket: &Bucket, shape: &RequestShape) -> S3Response {
    let v2 = shape.query_value("list-type") == Some("2");
    let prefix = shape.query_value("prefix").unwrap_or_default().to_string();
    let delimiter = shape.query_value("delimiter").filter(|d| !d.is_empty()).map(str::to_owned);
    let max_keys = shape
        .query_value("max-keys")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_KEYS);
    let after = if v2 {
        shape.query_value("continuation-token").or(shape.query_value("start-after"))
    } else {
        shape.query_value("marker")
    }
    .unwrap_or_default()
    .to_string();

    let mut result = ListBucketResult {
        name: name.to_string(),
        prefix: prefix.clone(),
        max_keys: Some(max_keys),
        delimiter: delimiter.clone(),
        ..ListBucketResult::default()
    };
    let mut seen_prefixes = BTreeSet::new();
    let mut count = 0;
    let mut last = None;

    for (key, object) in bucket.objects.iter() {
        if !key.starts_with(&prefix) || key.as_str() <= after.as_str() {
            continue;
        }
        let rolled = delimiter.as_deref().and_then(|d| {
            key[prefix.len()..].find(d).map(|i| key[..prefix.len() + i + d.len()].to_string())
        });
        if let Some(p) = &rolled {
            if seen_prefixes.contains(p) || p.as_str() <= after.as_str() {
                continue;
            }
        }
        if count == max_keys {
            result.is_truncated = true;
            break;
        }
        count += 1;
        match rolled {
            Some(p) => {
                seen_prefixes.insert(p.clone());
                last = Some(p.clone());
                result.common_prefixes.push(CommonPrefix { prefix: p });
            }
            None => {
                last = Some(key.clone());
                result.contents.push(ListEntry {
                    key: key.clone(),
                    last_modified: None,
                    etag: Some(object.etag()),
                    size: Some(object.body.len() as u64),
                    storage_class: Some("STANDARD".to_string()),
                    owner: None,
                });
            }
        }
    }

    if result.is_truncated {
        if v2 {
            result.next_continuation_token = last;
        } else {
            result.next_marker = last;
        }
    }
    if v2 {
        result.key_count = Some(count);
    }
    match result.to_xml() {
        Ok(body) => xml(Bytes::from(body)),
        Err(_) => error(StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
    }
}
