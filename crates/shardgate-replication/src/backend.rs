//! Storage backends.
//!
//! A backend is one independent S3-compatible cluster. Every object is held
//! by every backend of its shard; the proxy only ever talks to a backend
//! through the [`Backend`] trait.

use async_trait::async_trait;
use bytes::Bytes;
use http::header::HOST;
use http::{HeaderMap, Request, Response};
use shardgate_core::BackendConfig;
use tracing::trace;

use crate::error::BackendError;

/// A buffered S3 request in origin form (`/bucket/key?query`).
pub type S3Request = Request<Bytes>;

/// A buffered S3 response.
pub type S3Response = Response<Bytes>;

/// Header that carries the caller's access key to a backend. Backends own
/// credentials and signing.
pub const ACCESS_KEY_HEADER: &str = "x-shardgate-access-key";

/// Trait for sending requests to one storage backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Returns the backend's configured name.
    fn name(&self) -> &str;

    /// Returns the backend's base URL.
    fn endpoint(&self) -> &str;

    /// Returns true if the backend is under maintenance.
    fn is_maintenance(&self) -> bool;

    /// Sends one request and buffers the response.
    async fn send(&self, request: S3Request) -> Result<S3Response, BackendError>;
}

/// Clones a buffered request. `http::Request` is not `Clone` because of its
/// extensions, which the proxy never uses.
pub fn clone_request(request: &S3Request) -> S3Request {
    let mut builder = Request::builder()
        .method(request.method().clone())
        .uri(request.uri().clone())
        .version(request.version());
    if let Some(headers) = builder.headers_mut() {
        headers.extend(request.headers().iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    builder.body(request.body().clone()).unwrap_or_else(|_| Request::new(request.body().clone()))
}

/// Backend reached over HTTP with `reqwest`.
pub struct HttpBackend {
    name: String,
    endpoint: String,
    maintenance: bool,
    timeout_ms: u64,
    client: reqwest::Client,
}

impl HttpBackend {
    /// Creates a backend from its configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(name: impl Into<String>, config: &BackendConfig) -> Result<Self, BackendError> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| BackendError::Transport { backend: name.clone(), reason: e.to_string() })?;
        Ok(Self {
            name,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            maintenance: config.maintenance,
            timeout_ms: config.timeout_ms,
            client,
        })
    }

    fn map_error(&self, err: reqwest::Error) -> BackendError {
        if err.is_timeout() {
            BackendError::Timeout {
                backend: self.name.clone(),
                timeout_ms: self.timeout_ms,
            }
        } else {
            BackendError::Transport { backend: self.name.clone(), reason: err.to_string() }
        }
    }
}

impl std::fmt::Debug for HttpBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpBackend")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("maintenance", &self.maintenance)
            .finish()
    }
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_maintenance(&self) -> bool {
        self.maintenance
    }

    async fn send(&self, request: S3Request) -> Result<S3Response, BackendError> {
        let (parts, body) = request.into_parts();
        let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let url = format!("{}{}", self.endpoint, path);
        trace!(backend = %self.name, method = %parts.method, url = %url, "Sending backend request");

        let mut headers = HeaderMap::with_capacity(parts.headers.len());
        for (name, value) in &parts.headers {
            if name != HOST {
                headers.append(name.clone(), value.clone());
            }
        }

        let response = self
            .client
            .request(parts.method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| self.map_error(e))?;

        let status = response.status();
        let mut builder = Response::builder().status(status);
        if let Some(out) = builder.headers_mut() {
            for (name, value) in response.headers() {
                out.append(name.clone(), value.clone());
            }
        }
        let body = response.bytes().await.map_err(|e| self.map_error(e))?;
        builder.body(body).map_err(|e| BackendError::Transport {
            backend: self.name.clone(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use http::Method;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn backend_for(server: &MockServer) -> HttpBackend {
        let config = BackendConfig { endpoint: server.uri(), ..BackendConfig::default() };
        HttpBackend::new("a", &config).unwrap()
    }

    #[tokio::test]
    async fn test_http_backend_forwards_request() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/bucket/key"))
            .and(query_param("acl", ""))
            .and(header("x-amz-meta-object-version", "00000000000000000001"))
            .respond_with(ResponseTemplate::new(200).insert_header("etag", "\"abc\""))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        let request = Request::builder()
            .method(Method::PUT)
            .uri("/bucket/key?acl=")
            .header(HOST, "s3.example.com")
            .header("x-amz-meta-object-version", "00000000000000000001")
            .body(Bytes::from_static(b"hello"))
            .unwrap();

        let response = backend.send(request).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.headers()["etag"], "\"abc\"");
    }

    #[tokio::test]
    async fn test_http_backend_passes_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("<Error/>"))
            .mount(&server)
            .await;

        let backend = backend_for(&server);
        let request = Request::builder().uri("/b/missing").body(Bytes::new()).unwrap();
        let response = backend.send(request).await.unwrap();
        assert_eq!(response.status(), 404);
        assert_eq!(response.body().as_ref(), b"<Error/>");
    }

    #[tokio::test]
    async fn test_http_backend_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let config =
            BackendConfig { endpoint: server.uri(), timeout_ms: 50, ..BackendConfig::default() };
        let backend = HttpBackend::new("slow", &config).unwrap();
        let request = Request::builder().uri("/b/k").body(Bytes::new()).unwrap();
        let err = backend.send(request).await.unwrap_err();
        assert_eq!(err, BackendError::Timeout { backend: "slow".into(), timeout_ms: 50 });
    }

    #[test]
    fn test_http_backend_keeps_configured_timeout() {
        let config = BackendConfig { timeout_ms: u64::MAX, ..BackendConfig::default() };
        let backend = HttpBackend::new("patient", &config).unwrap();
        assert_eq!(backend.timeout_ms, u64::MAX);
    }

    #[tokio::test]
    async fn test_http_backend_connection_refused() {
        let config = BackendConfig {
            endpoint: "http://127.0.0.1:1".to_string(),
            ..BackendConfig::default()
        };
        let backend = HttpBackend::new("down", &config).unwrap();
        let request = Request::builder().uri("/b/k").body(Bytes::new()).unwrap();
        let err = backend.send(request).await.unwrap_err();
        assert!(matches!(err, BackendError::Transport { .. }));
    }

    #[test]
    fn test_clone_request() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/b/k?uploads")
            .header("content-type", "text/plain")
            .body(Bytes::from_static(b"x"))
            .unwrap();
        let copy = clone_request(&request);
        assert_eq!(copy.method(), Method::POST);
        assert_eq!(copy.uri(), "/b/k?uploads");
        assert_eq!(copy.headers()["content-type"], "text/plain");
        assert_eq!(copy.body(), request.body());
    }
}
