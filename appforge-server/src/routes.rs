//! HTTP surface of the sandbox subsystem.
//!
//! The surrounding API layer adds auth/ownership checks before calling in;
//! these routes assume an already-authorized caller.

use crate::state::AppState;
use appforge_common::{
    AppId, AppLifecycleStatus, EnvironmentId, EnvironmentView, Stats,
};
use appforge_sandbox::{SandboxError, SchemaDescription};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{error, info};

/// Forwarded request bodies are buffered up to this size; responses are
/// streamed and have no such bound.
const MAX_PROXY_BODY_BYTES: usize = 10 * 1024 * 1024;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route(
            "/runtime/:app_id",
            post(launch_app).get(runtime_status).delete(destroy_app),
        )
        .route("/runtime/:app_id/events", get(runtime_events))
        .route("/sandbox/:app_id", any(proxy_app_root))
        .route("/sandbox/:app_id/*path", any(proxy_app_path))
        .with_state(state)
}

/// Serve the router until the listener closes.
pub async fn start_server(
    listener: tokio::net::TcpListener,
    state: AppState,
) -> anyhow::Result<()> {
    let bind_addr = listener.local_addr()?;
    info!("appforge server listening on {}", bind_addr);
    axum::serve(listener, create_router(state)).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct DeployRequest {
    /// Relative path → source text, as produced by the generation pipeline.
    pub files: HashMap<String, String>,
    /// Optional schema description used to seed sample data.
    #[serde(default)]
    pub schema: Option<SchemaDescription>,
}

#[derive(Debug, Serialize)]
pub struct DeployResponse {
    pub environment_id: EnvironmentId,
    pub url: String,
    pub status: AppLifecycleStatus,
}

#[derive(Debug, Serialize)]
pub struct RuntimeStatusResponse {
    pub status: AppLifecycleStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<Stats>,
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// `POST /runtime/:app_id`: bundle, acquire an environment, deploy, start.
async fn launch_app(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    Json(request): Json<DeployRequest>,
) -> Response {
    let app_id = AppId::new(app_id);

    let artifact = match state
        .bundler
        .bundle(&app_id, &request.files, request.schema.as_ref())
    {
        Ok(artifact) => artifact,
        Err(e) => return sandbox_error_response(&e),
    };

    match state.runtime.launch(&app_id, artifact).await {
        Ok((environment, _record)) => {
            info!(app_id = %app_id, environment = %environment.id, "app launched");
            Json(DeployResponse {
                environment_id: environment.id,
                url: format!("/sandbox/{}", app_id),
                status: AppLifecycleStatus::Active,
            })
            .into_response()
        }
        Err(e) => {
            error!(app_id = %app_id, "launch failed: {}", e);
            sandbox_error_response(&e)
        }
    }
}

/// `GET /runtime/:app_id`: current status, environment, and stats.
async fn runtime_status(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> Json<RuntimeStatusResponse> {
    let app_id = AppId::new(app_id);

    if let Some(environment) = state.runtime.get_environment_by_app_id(&app_id).await {
        let stats = state.runtime.get_stats(environment.id).await;
        return Json(RuntimeStatusResponse {
            status: AppLifecycleStatus::Active,
            environment: Some(environment),
            stats: Some(stats),
        });
    }

    // Leased but not (yet) serving traffic.
    let environment = state.runtime.lease_for(&app_id).await;
    Json(RuntimeStatusResponse {
        status: AppLifecycleStatus::Draft,
        environment,
        stats: None,
    })
}

/// `DELETE /runtime/:app_id`: idempotent teardown.
async fn destroy_app(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> Response {
    let app_id = AppId::new(app_id);
    match state.runtime.destroy_app(&app_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!(app_id = %app_id, "destroy failed: {}", e);
            sandbox_error_response(&e)
        }
    }
}

/// `GET /runtime/:app_id/events`: SSE stream of status events.
async fn runtime_events(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.events.subscribe(Some(AppId::new(app_id))).await;
    let stream = ReceiverStream::new(subscription.rx).map(|envelope| {
        let event = Event::default()
            .json_data(&envelope)
            .unwrap_or_else(|_| Event::default().data("{}"));
        Ok(event)
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// `ANY /sandbox/:app_id`: proxy the app's root path.
async fn proxy_app_root(
    State(state): State<AppState>,
    Path(app_id): Path<String>,
    request: Request,
) -> Response {
    forward(state, app_id, "/".to_string(), request).await
}

/// `ANY /sandbox/:app_id/*path`: proxy an arbitrary app path.
async fn proxy_app_path(
    State(state): State<AppState>,
    Path((app_id, path)): Path<(String, String)>,
    request: Request,
) -> Response {
    forward(state, app_id, format!("/{}", path), request).await
}

async fn forward(state: AppState, app_id: String, path: String, request: Request) -> Response {
    let app_id = AppId::new(app_id);
    let method = request.method().clone();
    let headers = request.headers().clone();
    let path_and_query = match request.uri().query() {
        Some(query) => format!("{}?{}", path, query),
        None => path,
    };

    let body = match axum::body::to_bytes(request.into_body(), MAX_PROXY_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_body(
                StatusCode::PAYLOAD_TOO_LARGE,
                "request body exceeds proxy limit",
            )
        }
    };

    state
        .proxy
        .forward(&app_id, method, &path_and_query, &headers, body)
        .await
}

/// Map a sandbox error onto the HTTP boundary, carrying captured logs so
/// the caller can surface actionable diagnostics.
fn sandbox_error_response(error: &SandboxError) -> Response {
    let status = StatusCode::from_u16(error.status_code())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut payload = serde_json::json!({
        "error": error.to_string(),
        "retryable": error.is_retryable(),
    });
    if !error.logs().is_empty() {
        payload["logs"] = serde_json::json!(error.logs());
    }
    if let SandboxError::SecurityViolation(findings) = error {
        payload["findings"] = serde_json::json!(findings);
    }

    (status, Json(payload)).into_response()
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
