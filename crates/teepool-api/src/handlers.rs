//! REST API handlers.
//!
//! Successful responses are the bare JSON documents callers expect;
//! failures share one error body.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::debug;

use teepool_core::{PoolError, TeeDescriptor, WorkerId};
use teepool_state::{Warmth, Worker, WorkerStatus};

use crate::ApiState;

/// Error body for every failed request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiError {
    success: bool,
    error: String,
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_ms: Option<u64>,
}

fn error_response(msg: &str, kind: &'static str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiError {
            success: false,
            error: msg.to_string(),
            kind,
            retry_after_ms: None,
        }),
    )
        .into_response()
}

fn status_for(error: &PoolError) -> StatusCode {
    match error {
        PoolError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        PoolError::CapacityExceeded { .. } | PoolError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        PoolError::ProvisioningFailure { .. } | PoolError::HealthCheckFailure { .. } => {
            StatusCode::BAD_GATEWAY
        }
        PoolError::UnknownCapability(_) => StatusCode::BAD_REQUEST,
    }
}

/// Map a pool error to a response carrying the retry hint.
fn pool_error_response(error: &PoolError) -> Response {
    let retry_after = error.retry_after();
    let body = ApiError {
        success: false,
        error: error.to_string(),
        kind: error.kind(),
        retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
    };
    let mut response = (status_for(error), Json(body)).into_response();
    if let Some(delay) = retry_after
        && let Ok(value) = HeaderValue::from_str(&delay.as_secs().max(1).to_string())
    {
        response.headers_mut().insert(header::RETRY_AFTER, value);
    }
    response
}

// ── Routing ────────────────────────────────────────────────────

/// Route request body. An absent capability matches any worker.
#[derive(Debug, Default, Deserialize)]
pub struct RouteRequest {
    #[serde(default)]
    pub capability: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteResponse {
    pub endpoint: String,
    pub used_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<WorkerId>,
    pub waited_ms: u64,
}

/// POST /route
pub async fn route(State(state): State<ApiState>, Json(req): Json<RouteRequest>) -> Response {
    match state.orchestrator.route(req.capability.as_deref()).await {
        Ok(outcome) => Json(RouteResponse {
            endpoint: outcome.endpoint,
            used_fallback: outcome.used_fallback,
            worker_id: outcome.worker_id,
            waited_ms: outcome.waited.as_millis() as u64,
        })
        .into_response(),
        Err(e) => {
            debug!(error = %e, capability = ?req.capability, "route failed");
            pool_error_response(&e)
        }
    }
}

// ── Nodes ──────────────────────────────────────────────────────

/// One worker as exposed over HTTP.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub id: WorkerId,
    pub capability: String,
    pub status: WorkerStatus,
    pub warmth: Warmth,
    pub endpoint: Option<String>,
    pub tee_descriptor: TeeDescriptor,
    pub cold_start_duration_ms: Option<u64>,
    pub requests_served: u64,
    pub error_count: u64,
    pub created_at_ms: u64,
}

impl From<Worker> for NodeView {
    fn from(w: Worker) -> Self {
        Self {
            id: w.id,
            warmth: w.warmth(),
            capability: w.capability,
            status: w.status,
            endpoint: w.endpoint,
            tee_descriptor: w.tee,
            cold_start_duration_ms: w.cold_start_duration_ms,
            requests_served: w.requests_served,
            error_count: w.error_count,
            created_at_ms: w.created_at_ms,
        }
    }
}

/// GET /nodes
pub async fn list_nodes(State(state): State<ApiState>) -> Json<Vec<NodeView>> {
    Json(
        state
            .orchestrator
            .nodes()
            .into_iter()
            .map(NodeView::from)
            .collect(),
    )
}

/// GET /nodes/{id}
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    let Ok(worker_id) = id.parse::<WorkerId>() else {
        return error_response("invalid worker id", "bad_request", StatusCode::BAD_REQUEST);
    };
    match state.orchestrator.node(worker_id) {
        Some(worker) => Json(NodeView::from(worker)).into_response(),
        None => error_response("worker not found", "not_found", StatusCode::NOT_FOUND),
    }
}

/// Outcome report body.
#[derive(Debug, Deserialize)]
pub struct ReportRequest {
    pub success: bool,
}

/// POST /nodes/{id}/report
pub async fn report(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<ReportRequest>,
) -> Response {
    let Ok(worker_id) = id.parse::<WorkerId>() else {
        return error_response("invalid worker id", "bad_request", StatusCode::BAD_REQUEST);
    };
    if !state.orchestrator.report(worker_id, req.success) {
        return error_response("worker not found", "not_found", StatusCode::NOT_FOUND);
    }
    match state.orchestrator.node(worker_id) {
        Some(worker) => Json(NodeView::from(worker)).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

// ── Stats ──────────────────────────────────────────────────────

/// GET /stats
pub async fn stats(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.orchestrator.stats())
}

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        state.orchestrator.metrics(),
    )
}
