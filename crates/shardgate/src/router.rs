//! HTTP front end: every request is proxied to the shard of its domain.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use bytes::Bytes;
use http::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, HOST};
use http::{HeaderMap, Method, Request, Uri};
use shardgate_core::types::parse_query;
use shardgate_core::{error_document, S3ErrorCode};
use shardgate_replication::{ReplicationError, REQUEST_ID_HEADER};
use shardgate_watchdog::{ConsistentShardClient, RequestContext, RequestOutcome};
use tokio::sync::oneshot;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{trace, warn, Level};
use uuid::Uuid;

/// State shared by the proxy handler.
#[derive(Clone)]
pub struct ProxyState {
    client: Arc<ConsistentShardClient>,
}

/// Creates the proxy router.
///
/// `max_body_size` bounds buffered request bodies; 0 disables the limit.
pub fn create_router(
    client: Arc<ConsistentShardClient>,
    max_body_size: u64,
    log_requests: bool,
) -> Router {
    let router = Router::new().fallback(proxy).with_state(ProxyState { client });

    let router = if log_requests {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO));
        router.layer(trace_layer)
    } else {
        router
    };

    if max_body_size > 0 {
        router.layer(DefaultBodyLimit::max(usize::try_from(max_body_size).unwrap_or(usize::MAX)))
    } else {
        router.layer(DefaultBodyLimit::disable())
    }
}

async fn proxy(
    State(state): State<ProxyState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = Uuid::new_v4().simple().to_string().to_uppercase();
    let Some(domain) = domain_of(&headers) else {
        return error_response(S3ErrorCode::InvalidRequest, "missing Host header", &request_id);
    };

    let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(out) = builder.headers_mut() {
        for (name, value) in &headers {
            if name != HOST {
                out.append(name.clone(), value.clone());
            }
        }
    }
    let request = match builder.body(body) {
        Ok(request) => request,
        Err(e) => return error_response(S3ErrorCode::InvalidRequest, &e.to_string(), &request_id),
    };

    let ctx = RequestContext {
        domain,
        request_id: request_id.clone(),
        access_key: access_key(&headers, &uri),
    };
    let (done, done_rx) = oneshot::channel();
    let handled = match state.client.handle(ctx, request, done_rx).await {
        Ok(handled) => handled,
        Err(ReplicationError::UnknownDomain(domain)) => {
            let message = format!("no region serves {domain}");
            return error_response(S3ErrorCode::NoSuchRegion, &message, &request_id);
        }
        Err(e) => {
            warn!(request_id = %request_id, error = %e, "Request failed before dispatch");
            return error_response(S3ErrorCode::InternalError, &e.to_string(), &request_id);
        }
    };

    let mut response = handled.response.map(Body::from);
    if !response.headers().contains_key(REQUEST_ID_HEADER) {
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }
    }

    // Completion runs once the response is handed back.
    if done.send(RequestOutcome::default()).is_err() {
        trace!(request_id = %request_id, "Completion already finished");
    }
    response
}

/// Returns the lower-cased Host header without its port.
fn domain_of(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(HOST)?.to_str().ok()?;
    let host = match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    };
    (!host.is_empty()).then(|| host.to_ascii_lowercase())
}

/// Extracts the caller's access key from a SigV4 or SigV2 Authorization
/// header, or from presigned query parameters.
fn access_key(headers: &HeaderMap, uri: &Uri) -> String {
    if let Some(auth) = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if let Some(rest) = auth.strip_prefix("AWS4-HMAC-SHA256") {
            let credential =
                rest.split(',').find_map(|part| part.trim().strip_prefix("Credential="));
            if let Some(key) = credential.and_then(|c| c.split('/').next()) {
                return key.to_string();
            }
        } else if let Some(rest) = auth.strip_prefix("AWS ") {
            if let Some((key, _)) = rest.split_once(':') {
                return key.trim().to_string();
            }
        }
    }

    uri.query()
        .map(parse_query)
        .unwrap_or_default()
        .into_iter()
        .find(|(k, _)| k == "X-Amz-Credential" || k == "AWSAccessKeyId")
        .and_then(|(_, v)| v.split('/').next().map(str::to_owned))
        .unwrap_or_default()
}

fn error_response(code: S3ErrorCode, message: &str, request_id: &str) -> Response {
    let mut response =
        (code.status_code(), error_document(code, message, request_id)).into_response();
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/xml"));
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}
