//! Shard resolution and the shard client.
//!
//! The [`ShardClient`] composes a [`ReplicationClient`] with the picker that
//! fits the request kind:
//!
//! ```text
//! request                          | backends        | picker
//! ---------------------------------|-----------------|--------------
//! uploads / uploadId (multipart)   | one, by hash    | ObjectPicker
//! DELETE on an object              | all             | DeletePicker
//! GET on a bucket, no subresource  | all             | ListPicker
//! anything else                    | all             | ObjectPicker
//! ```

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Response, Uri};
use shardgate_core::{error_document, Config, RequestShape, RingProps, S3ErrorCode};
use siphasher::sip::SipHasher13;
use tracing::{debug, warn};

use crate::backend::{Backend, HttpBackend, S3Request, S3Response};
use crate::client::ReplicationClient;
use crate::error::{BackendError, ReplicationError, Result};
use crate::listing::{ListParams, DEFAULT_MAX_KEYS};
use crate::picker::{DeletePicker, ListPicker, ObjectPicker, Picked, ResponsePicker};
use crate::response::{BackendResponse, SummaryHandle};

/// Header used to correlate proxy-generated error bodies with requests.
pub const REQUEST_ID_HEADER: &str = "x-amz-request-id";

/// Resolves the backends and ring properties of a domain.
pub trait ShardResolver: Send + Sync {
    /// Returns every backend holding `object_key` in `domain`.
    fn pick(&self, domain: &str, object_key: &str) -> Result<Vec<Arc<dyn Backend>>>;

    /// Returns the ring properties of `domain`.
    fn ring_props(&self, domain: &str) -> Result<RingProps>;
}

struct Region {
    backends: Vec<Arc<dyn Backend>>,
    props: RingProps,
}

/// A resolver with one fixed shard per domain.
#[derive(Default)]
pub struct StaticShardResolver {
    regions: HashMap<String, Region>,
}

impl StaticShardResolver {
    /// Creates an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the shard of `domain`.
    pub fn with_region(
        mut self,
        domain: impl Into<String>,
        backends: Vec<Arc<dyn Backend>>,
        props: RingProps,
    ) -> Self {
        self.regions.insert(domain.into(), Region { backends, props });
        self
    }

    /// Builds HTTP backends and regions from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend cannot be built or a region references
    /// an unknown backend.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut backends: HashMap<&str, Arc<dyn Backend>> = HashMap::new();
        for (name, backend) in &config.backends {
            let http = HttpBackend::new(name.clone(), backend)
                .map_err(|e| ReplicationError::Internal(e.to_string()))?;
            backends.insert(name.as_str(), Arc::new(http));
        }

        let mut resolver = Self::new();
        for (domain, region) in &config.regions {
            let members = region
                .backends
                .iter()
                .map(|name| {
                    backends.get(name.as_str()).cloned().ok_or_else(|| {
                        ReplicationError::Internal(format!("unknown backend {name} in {domain}"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            debug!(domain = %domain, backends = members.len(), "Configured region");
            resolver = resolver.with_region(domain.clone(), members, region.ring_props());
        }
        Ok(resolver)
    }

    fn region(&self, domain: &str) -> Result<&Region> {
        self.regions.get(domain).ok_or_else(|| ReplicationError::UnknownDomain(domain.to_string()))
    }
}

impl ShardResolver for StaticShardResolver {
    fn pick(&self, domain: &str, _object_key: &str) -> Result<Vec<Arc<dyn Backend>>> {
        Ok(self.region(domain)?.backends.clone())
    }

    fn ring_props(&self, domain: &str) -> Result<RingProps> {
        Ok(self.region(domain)?.props)
    }
}

/// The response chosen for the client and the summary of every backend.
#[derive(Debug)]
pub struct Dispatched {
    /// Response to return.
    pub response: S3Response,
    /// Outcome of every backend.
    pub summary: SummaryHandle,
}

/// Routes requests to the backends of a shard and picks the response.
#[derive(Clone)]
pub struct ShardClient {
    resolver: Arc<dyn ShardResolver>,
}

impl ShardClient {
    /// Creates a shard client over `resolver`.
    pub fn new(resolver: Arc<dyn ShardResolver>) -> Self {
        Self { resolver }
    }

    /// Returns the resolver.
    pub fn resolver(&self) -> &Arc<dyn ShardResolver> {
        &self.resolver
    }

    /// Sends `request` to the shard of `domain` and picks one response.
    ///
    /// # Errors
    ///
    /// Returns an error if the domain is unknown or its shard is empty.
    pub async fn dispatch(&self, domain: &str, request: S3Request) -> Result<Dispatched> {
        let shape = RequestShape::new(request.method(), request.uri());
        let object_key = shape.object_id().or(shape.bucket()).unwrap_or_default().to_string();
        let backends = self.resolver.pick(domain, &object_key)?;
        if backends.is_empty() {
            return Err(ReplicationError::NoBackends(domain.to_string()));
        }

        let request_id = request
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let picked = if shape.is_multipart() {
            let backend = route_multipart(&backends, &object_key);
            debug!(backend = %backend.name(), object = %object_key, "Routing multipart request");
            fan_out(&ObjectPicker, ReplicationClient::new(vec![backend]), request).await?
        } else if shape.is_object_delete() {
            fan_out(&DeletePicker, ReplicationClient::new(backends), request).await?
        } else if shape.is_listing() {
            let picker = ListPicker::new(list_params(&shape));
            let request = rewrite_continuation(request, &shape);
            fan_out(&picker, ReplicationClient::new(backends), request).await?
        } else {
            fan_out(&ObjectPicker, ReplicationClient::new(backends), request).await?
        };

        Ok(Dispatched {
            response: into_client_response(picked.response, &request_id),
            summary: picked.summary,
        })
    }
}

/// Sends `request` through `client` and picks the response.
///
/// If the caller goes away before a response is picked, every backend call
/// still running is canceled. Once picked, the remaining calls complete.
async fn fan_out(
    picker: &dyn ResponsePicker,
    client: ReplicationClient,
    request: S3Request,
) -> Result<Picked> {
    let guard = client.cancel_on_drop();
    let picked = picker.pick(client.send(request)).await?;
    guard.disarm();
    Ok(picked)
}

/// Picks one backend for a multipart upload by hashing the object id over
/// backends not under maintenance. Upload ids are backend-local, so every
/// request of one upload must land on the same backend.
pub fn route_multipart(backends: &[Arc<dyn Backend>], object_id: &str) -> Arc<dyn Backend> {
    let available: Vec<&Arc<dyn Backend>> =
        backends.iter().filter(|b| !b.is_maintenance()).collect();
    let candidates: Vec<&Arc<dyn Backend>> =
        if available.is_empty() { backends.iter().collect() } else { available };

    let mut hasher = SipHasher13::new();
    hasher.write(object_id.as_bytes());
    let index = (hasher.finish() % candidates.len() as u64) as usize;
    Arc::clone(candidates[index])
}

fn list_params(shape: &RequestShape) -> ListParams {
    let max_keys = shape
        .query_value("max-keys")
        .and_then(|v| v.parse::<usize>().ok())
        .map(|n| n.min(DEFAULT_MAX_KEYS))
        .unwrap_or(DEFAULT_MAX_KEYS);
    ListParams { max_keys, v2: shape.query_value("list-type") == Some("2") }
}

/// The merged v2 continuation token is the last returned key, which
/// backends only understand as `start-after`.
fn rewrite_continuation(mut request: S3Request, shape: &RequestShape) -> S3Request {
    let Some(token) = shape.query_value("continuation-token") else {
        return request;
    };
    let token = percent_encoding::utf8_percent_encode(token, QUERY_VALUE).to_string();
    let query: Vec<String> = request
        .uri()
        .query()
        .unwrap_or_default()
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or_default();
            key != "continuation-token" && key != "start-after"
        })
        .map(str::to_owned)
        .chain(std::iter::once(format!("start-after={token}")))
        .collect();
    let path_and_query = format!("{}?{}", request.uri().path(), query.join("&"));
    match path_and_query.parse::<Uri>() {
        Ok(uri) => *request.uri_mut() = uri,
        Err(e) => warn!(error = %e, "Failed to rewrite continuation token"),
    }
    request
}

const QUERY_VALUE: &percent_encoding::AsciiSet = &percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Turns the picked outcome into the client response. Transport-only
/// failures become a `BadGateway` error document.
fn into_client_response(outcome: BackendResponse, request_id: &str) -> S3Response {
    match outcome.into_result() {
        Ok(response) => response,
        Err(e) => bad_gateway(&e, request_id),
    }
}

fn bad_gateway(err: &BackendError, request_id: &str) -> S3Response {
    let code = S3ErrorCode::BadGateway;
    let body = error_document(code, &err.to_string(), request_id);
    let mut response = Response::new(Bytes::from(body));
    *response.status_mut() = code.status_code();
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/xml"));
    response
}

#[cfg(test)]
mod tests {
    use http::{Method, Request, StatusCode};
    use shardgate_core::ConsistencyLevel;

    use super::*;
    use crate::testing::MemoryBackend;

    const DOMAIN: &str = "s3.test";

    fn setup(n: usize) -> (Vec<Arc<MemoryBackend>>, ShardClient) {
        let backends: Vec<Arc<MemoryBackend>> =
            (0..n).map(|i| Arc::new(MemoryBackend::new(format!("b{i}")))).collect();
        for b in &backends {
            b.create_bucket("bucket");
        }
        let resolver = StaticShardResolver::new().with_region(
            DOMAIN,
            backends.iter().map(|b| Arc::clone(b) as Arc<dyn Backend>).collect(),
            RingProps { consistency_level: ConsistencyLevel::Weak, read_repair: false },
        );
        (backends, ShardClient::new(Arc::new(resolver)))
    }

    fn request(method: Method, uri: &str, body: &'static [u8]) -> S3Request {
        Request::builder().method(method).uri(uri).body(Bytes::from_static(body)).unwrap()
    }

    #[tokio::test]
    async fn test_put_replicates_to_all() {
        let (backends, client) = setup(3);
        let out =
            client.dispatch(DOMAIN, request(Method::PUT, "/bucket/k", b"data")).await.unwrap();
        assert_eq!(out.response.status(), StatusCode::OK);
        assert!(out.summary.wait().await.no_errors());
        for b in &backends {
            assert!(b.has_object("bucket", "k"));
        }
    }

    #[tokio::test]
    async fn test_get_survives_one_failure() {
        let (backends, client) = setup(2);
        backends[0].put_object("bucket", "k", Bytes::from_static(b"v"), &[]);
        backends[1].put_object("bucket", "k", Bytes::from_static(b"v"), &[]);
        backends[0].set_failing(true);

        let out = client.dispatch(DOMAIN, request(Method::GET, "/bucket/k", b"")).await.unwrap();
        assert_eq!(out.response.status(), StatusCode::OK);
        assert_eq!(out.response.body().as_ref(), b"v");
        assert!(!out.summary.wait().await.no_errors());
    }

    #[tokio::test]
    async fn test_transport_failure_is_bad_gateway() {
        let (backends, client) = setup(2);
        for b in &backends {
            b.set_failing(true);
        }
        let mut req = request(Method::GET, "/bucket/k", b"");
        req.headers_mut().insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-7"));
        let out = client.dispatch(DOMAIN, req).await.unwrap();
        assert_eq!(out.response.status(), StatusCode::BAD_GATEWAY);
        let body = std::str::from_utf8(out.response.body()).unwrap();
        assert!(body.contains("<Code>BadGateway</Code>"));
        assert!(body.contains("<RequestId>req-7</RequestId>"));
    }

    #[tokio::test]
    async fn test_unknown_domain() {
        let (_, client) = setup(1);
        let err =
            client.dispatch("nope", request(Method::GET, "/bucket/k", b"")).await.unwrap_err();
        assert_eq!(err, ReplicationError::UnknownDomain("nope".into()));
    }

    #[tokio::test]
    async fn test_delete_uses_delete_picker() {
        let (backends, client) = setup(2);
        backends[1].set_failing(true);
        let out = client.dispatch(DOMAIN, request(Method::DELETE, "/bucket/k", b"")).await.unwrap();
        // A hard failure is reported even though b0 succeeded.
        assert_eq!(out.response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_delete_on_maintenance_backend_is_soft() {
        let (backends, client) = setup(2);
        backends[1].set_maintenance(true);
        backends[1].set_failing(true);
        let out = client.dispatch(DOMAIN, request(Method::DELETE, "/bucket/k", b"")).await.unwrap();
        assert_eq!(out.response.status(), StatusCode::NO_CONTENT);
        assert!(!out.summary.wait().await.no_errors());
    }

    #[tokio::test]
    async fn test_listing_is_merged() {
        let (backends, client) = setup(2);
        backends[0].put_object("bucket", "a", Bytes::from_static(b"1"), &[]);
        backends[1].put_object("bucket", "b", Bytes::from_static(b"2"), &[]);

        let out = client.dispatch(DOMAIN, request(Method::GET, "/bucket", b"")).await.unwrap();
        assert_eq!(out.response.status(), StatusCode::OK);
        let body = std::str::from_utf8(out.response.body()).unwrap();
        assert!(body.contains("<Key>a</Key>"));
        assert!(body.contains("<Key>b</Key>"));
        assert_eq!(out.response.headers()[crate::picker::LISTING_MISMATCH_HEADER], "true");
    }

    #[tokio::test]
    async fn test_abandoned_dispatch_cancels_backend_calls() {
        let (backends, client) = setup(2);
        for b in &backends {
            b.set_delay(std::time::Duration::from_millis(200));
        }

        let dispatch = client.dispatch(DOMAIN, request(Method::PUT, "/bucket/k", b"data"));
        let result = tokio::time::timeout(std::time::Duration::from_millis(20), dispatch).await;
        assert!(result.is_err());

        tokio::time::sleep(std::time::Duration::from_millis(400)).await;
        for b in &backends {
            assert!(!b.has_object("bucket", "k"));
            assert!(b.requests().is_empty());
        }
    }

    #[tokio::test]
    async fn test_remaining_calls_finish_after_pick() {
        let (backends, client) = setup(2);
        backends[1].set_delay(std::time::Duration::from_millis(50));

        let out =
            client.dispatch(DOMAIN, request(Method::PUT, "/bucket/k", b"data")).await.unwrap();
        assert_eq!(out.response.status(), StatusCode::OK);
        assert!(out.summary.wait().await.no_errors());
        assert!(backends[1].has_object("bucket", "k"));
    }

    #[tokio::test]
    async fn test_multipart_routes_to_single_backend() {
        let (backends, client) = setup(3);
        let out = client
            .dispatch(DOMAIN, request(Method::POST, "/bucket/big?uploads", b""))
            .await
            .unwrap();
        assert_eq!(out.response.status(), StatusCode::OK);

        let hits: usize = backends.iter().map(|b| b.requests().len()).sum();
        assert_eq!(hits, 1);
    }

    #[test]
    fn test_route_multipart_is_stable_and_skips_maintenance() {
        let a = Arc::new(MemoryBackend::new("a"));
        let b = Arc::new(MemoryBackend::new("b"));
        b.set_maintenance(true);
        let backends: Vec<Arc<dyn Backend>> = vec![a as Arc<dyn Backend>, b];

        for key in ["bucket/x", "bucket/y", "bucket/z"] {
            assert_eq!(route_multipart(&backends, key).name(), "a");
        }

        let c = Arc::new(MemoryBackend::new("c"));
        let d = Arc::new(MemoryBackend::new("d"));
        let backends: Vec<Arc<dyn Backend>> = vec![c as Arc<dyn Backend>, d];
        let first = route_multipart(&backends, "bucket/k").name().to_string();
        assert_eq!(route_multipart(&backends, "bucket/k").name(), first);
    }

    #[test]
    fn test_rewrite_continuation() {
        let req = request(Method::GET, "/bucket?list-type=2&continuation-token=a%2Fb", b"");
        let shape = RequestShape::new(req.method(), req.uri());
        let rewritten = rewrite_continuation(req, &shape);
        assert_eq!(rewritten.uri(), "/bucket?list-type=2&start-after=a%2Fb");
    }

    #[test]
    fn test_list_params() {
        let req = request(Method::GET, "/bucket?max-keys=5000&list-type=2", b"");
        let params = list_params(&RequestShape::new(req.method(), req.uri()));
        assert_eq!(params, ListParams { max_keys: DEFAULT_MAX_KEYS, v2: true });
    }
}
