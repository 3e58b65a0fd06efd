//! HTTP server for milestoned.
//!
//! `POST /` speaks the oracle external-adapter protocol: the node posts a job
//! run id with a video id and metric name, and gets back the current count
//! and whether a new milestone was crossed. The `/resources` routes are
//! administrative.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use milestone_core::lock::ResourceLocks;
use milestone_core::{EngineError, MilestoneEngine, ResourceId, ResourceStatus};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::source::{MetricSource, SourceError};

/// Shared state for HTTP handlers.
pub struct AppState {
    pub engine: Arc<MilestoneEngine>,
    pub source: Arc<dyn MetricSource>,
    pub locks: ResourceLocks,
    pub auth_token: Option<String>,
    pub source_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(engine: Arc<MilestoneEngine>, source: Arc<dyn MetricSource>) -> Self {
        Self {
            engine,
            source,
            locks: ResourceLocks::new(),
            auth_token: None,
            source_timeout: None,
        }
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }

    pub fn with_source_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.source_timeout = timeout;
        self
    }
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", post(adapter_request))
        .route("/resources/{id}", get(get_resource).delete(delete_resource))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve `router` on `addr` until `shutdown` is cancelled.
pub async fn start_server(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("HTTP server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// Validate auth token if configured.
fn check_auth(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<(), (StatusCode, Json<ErrorResponse>)> {
    if let Some(expected) = &state.auth_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

        match provided {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "invalid auth token".to_string(),
                }),
            )),
            None => Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse {
                    error: "missing auth token".to_string(),
                }),
            )),
        }
    } else {
        Ok(())
    }
}

/// HTTP status for an engine failure.
fn engine_error_status(e: &EngineError) -> StatusCode {
    if e.is_caller_error() {
        StatusCode::BAD_REQUEST
    } else if e.requires_recheck() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

// --- Request/Response types ---

/// Error response body for the administrative routes.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// External adapter request.
#[derive(Debug, Deserialize)]
pub struct AdapterRequest {
    /// Job run id, echoed back verbatim. Nodes send strings or numbers.
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub data: AdapterRequestData,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterRequestData {
    #[serde(default)]
    pub video_id: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Successful external adapter response.
#[derive(Debug, Serialize)]
pub struct AdapterResponse {
    #[serde(rename = "jobRunID")]
    pub job_run_id: Value,
    pub data: AdapterResult,
    pub result: u64,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterResult {
    pub value: u64,
    pub views: Option<u64>,
    pub likes: Option<u64>,
    pub should_trigger: bool,
    pub milestone: Option<u64>,
    pub source_regressed: bool,
}

/// Failed external adapter response.
#[derive(Debug, Serialize)]
pub struct AdapterErrorResponse {
    #[serde(rename = "jobRunID")]
    pub job_run_id: Value,
    pub status: &'static str,
    pub error: String,
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    /// The write may have landed; read state before resubmitting.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub recheck: bool,
}

type AdapterFailure = (StatusCode, Json<AdapterErrorResponse>);

fn errored(job_run_id: &Value, status: StatusCode, error: impl Into<String>) -> AdapterFailure {
    (
        status,
        Json(AdapterErrorResponse {
            job_run_id: job_run_id.clone(),
            status: "errored",
            error: error.into(),
            status_code: status.as_u16(),
            recheck: false,
        }),
    )
}

/// Response for DELETE /resources/{id}.
#[derive(Debug, Serialize)]
pub struct DeleteResourceResponse {
    pub resource_id: String,
    pub removed: bool,
}

// --- Handlers ---

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

/// POST / - Fetch a metric and report whether it crossed a milestone.
async fn adapter_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AdapterRequest>,
) -> Result<Json<AdapterResponse>, AdapterFailure> {
    let job_run_id = req
        .id
        .unwrap_or_else(|| Value::String(Uuid::now_v7().to_string()));

    check_auth(&state, &headers)
        .map_err(|(status, Json(body))| errored(&job_run_id, status, body.error))?;

    let video_id = req.data.video_id.as_deref().map(str::trim).unwrap_or("");
    let endpoint = req.data.endpoint.as_deref().map(str::trim).unwrap_or("");
    if video_id.is_empty() || endpoint.is_empty() {
        return Err(errored(
            &job_run_id,
            StatusCode::BAD_REQUEST,
            "Missing videoId or endpoint",
        ));
    }
    let resource_id = ResourceId::new(video_id);

    // Reject before spending a source request.
    if state.engine.catalog().rule_for(&resource_id, endpoint).is_none() {
        return Err(errored(
            &job_run_id,
            StatusCode::BAD_REQUEST,
            format!("Unknown endpoint: {endpoint}"),
        ));
    }

    let _guard = state.locks.acquire(&resource_id).await;

    let fetch = state.source.fetch(&resource_id);
    let fetched = match state.source_timeout {
        Some(limit) => tokio::time::timeout(limit, fetch)
            .await
            .unwrap_or(Err(SourceError::Timeout(limit))),
        None => fetch.await,
    };
    let snapshot = fetched.map_err(|e| {
        warn!(resource_id = %resource_id, error = %e, "metric fetch failed");
        errored(
            &job_run_id,
            StatusCode::BAD_GATEWAY,
            format!("Failed to fetch metrics: {e}"),
        )
    })?;

    let Some(&value) = snapshot.get(endpoint) else {
        warn!(resource_id = %resource_id, metric = endpoint, "metric not reported by source");
        return Err(errored(
            &job_run_id,
            StatusCode::BAD_GATEWAY,
            format!("No {endpoint} data for {resource_id}"),
        ));
    };
    let observed = i64::try_from(value).map_err(|_| {
        errored(
            &job_run_id,
            StatusCode::BAD_GATEWAY,
            format!("{endpoint} count out of range: {value}"),
        )
    })?;

    let decision = state
        .engine
        .check_and_advance(video_id, endpoint, observed)
        .await
        .map_err(|e| {
            let status = engine_error_status(&e);
            let (status, Json(mut body)) = errored(&job_run_id, status, e.to_string());
            body.recheck = e.requires_recheck();
            (status, Json(body))
        })?;

    info!(
        resource_id = %resource_id,
        metric = endpoint,
        value,
        should_trigger = decision.crossed,
        "processed adapter request"
    );

    Ok(Json(AdapterResponse {
        job_run_id,
        data: AdapterResult {
            value,
            views: snapshot.get("views").copied(),
            likes: snapshot.get("likes").copied(),
            should_trigger: decision.crossed,
            milestone: decision.milestone_value,
            source_regressed: decision.source_regressed,
        },
        result: value,
        status_code: StatusCode::OK.as_u16(),
    }))
}

/// GET /resources/{id} - Stored counters and next trigger per metric.
async fn get_resource(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ResourceStatus>, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;

    let status = state.engine.status(&id).await.map_err(|e| {
        (
            engine_error_status(&e),
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })?;
    Ok(Json(status))
}

/// DELETE /resources/{id} - Remove a resource's stored state.
async fn delete_resource(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<DeleteResourceResponse>, (StatusCode, Json<ErrorResponse>)> {
    check_auth(&state, &headers)?;

    let resource_id = ResourceId::new(id.as_str());
    let _guard = state.locks.acquire(&resource_id).await;
    let removed = state.engine.forget(&id).await.map_err(|e| {
        (
            engine_error_status(&e),
            Json(ErrorResponse {
                error: e.to_string(),
            }),
        )
    })?;

    Ok(Json(DeleteResourceResponse {
        resource_id: id,
        removed,
    }))
}
