//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use super::sagas::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub worker_id: String,
    pub step_log: &'static str,
}

/// GET /health: returns liveness plus the worker identity and backend.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        worker_id: state.coordinator.worker_id().to_string(),
        step_log: state.backend,
    })
}
