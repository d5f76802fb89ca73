//! Request proxy: routes end-user traffic into a running environment.
//!
//! Looks the environment up through the runtime manager, strips hop-by-hop
//! headers in both directions, and streams the upstream body back without
//! buffering it. Failures never escape as errors; they always become
//! well-formed 502/503 responses.

use appforge_common::AppId;
use appforge_sandbox::RuntimeManager;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Headers that describe the connection rather than the payload; never
/// forwarded in either direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// Forwards sandboxed app traffic to the owning environment.
pub struct RequestProxy {
    client: reqwest::Client,
    runtime: Arc<RuntimeManager>,
}

impl RequestProxy {
    pub fn new(runtime: Arc<RuntimeManager>, connect_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client, runtime })
    }

    /// Forward one request. `path_and_query` must start with `/` and is
    /// passed to the upstream verbatim.
    pub async fn forward(
        &self,
        app_id: &AppId,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Response {
        // No running environment: answer locally, no network call.
        let Some(environment) = self.runtime.get_environment_by_app_id(app_id).await else {
            debug!(app_id = %app_id, "proxy miss: no running environment");
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                format!("app '{}' has no running environment", app_id),
            );
        };

        let url = format!("http://{}{}", environment.internal_addr, path_and_query);
        let upstream_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
            .unwrap_or(reqwest::Method::GET);

        let mut request = self.client.request(upstream_method, &url);
        for (name, value) in headers {
            if !is_hop_by_hop(name.as_str()) {
                request = request.header(name.as_str(), value.as_bytes());
            }
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let upstream = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(app_id = %app_id, environment = %environment.id,
                    "upstream unreachable: {}", e);
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    format!("upstream environment unreachable: {}", e),
                );
            }
        };

        let status = StatusCode::from_u16(upstream.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let mut builder = Response::builder().status(status);
        let mut has_content_type = false;
        for (name, value) in upstream.headers() {
            if is_hop_by_hop(name.as_str()) {
                continue;
            }
            if name.as_str().eq_ignore_ascii_case("content-type") {
                has_content_type = true;
            }
            builder = builder.header(name.as_str(), value.as_bytes());
        }
        if !has_content_type {
            if let Some(mime) = content_type_for_path(path_and_query) {
                builder = builder.header("content-type", mime);
            }
        }

        // Stream the upstream body through; large and streaming payloads
        // never get buffered here.
        builder
            .body(Body::from_stream(upstream.bytes_stream()))
            .unwrap_or_else(|e| {
                error_response(
                    StatusCode::BAD_GATEWAY,
                    format!("invalid upstream response: {}", e),
                )
            })
    }
}

/// Infer a content type from the request path's extension, for upstreams
/// that omit the header.
fn content_type_for_path(path_and_query: &str) -> Option<&'static str> {
    let path = path_and_query.split('?').next().unwrap_or(path_and_query);
    let extension = path.rsplit('/').next()?.rsplit_once('.')?.1;
    let mime = match extension {
        "html" | "htm" => "text/html; charset=utf-8",
        "js" | "mjs" => "text/javascript",
        "css" => "text/css",
        "json" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "ico" => "image/x-icon",
        "txt" => "text/plain; charset=utf-8",
        "wasm" => "application/wasm",
        _ => return None,
    };
    Some(mime)
}

fn error_response(status: StatusCode, message: String) -> Response {
    let body = serde_json::json!({ "error": message }).to_string();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
