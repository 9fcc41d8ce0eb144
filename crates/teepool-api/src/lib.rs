//! teepool-api — HTTP surface of the orchestrator.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/route` | Assign-or-enqueue: `{capability}` → `{endpoint, usedFallback}` |
//! | GET | `/nodes` | Registry snapshot |
//! | GET | `/nodes/{id}` | One worker |
//! | POST | `/nodes/{id}/report` | Report a request outcome: `{success}` |
//! | GET | `/stats` | Pool statistics |
//! | GET | `/metrics` | Prometheus exposition |
//!
//! Failures are returned as `{success: false, error, kind, retryAfterMs}`
//! with a `retry-after` header when retrying makes sense.

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use teepool_orchestrator::Orchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: Arc<Orchestrator>,
}

/// Build the complete API router.
pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    let state = ApiState { orchestrator };

    Router::new()
        .route("/route", post(handlers::route))
        .route("/nodes", get(handlers::list_nodes))
        .route("/nodes/{id}", get(handlers::get_node))
        .route("/nodes/{id}/report", post(handlers::report))
        .route("/stats", get(handlers::stats))
        .route("/metrics", get(handlers::prometheus_metrics))
        .with_state(state)
}
