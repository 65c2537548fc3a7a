//! Saga submission and status endpoints.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use common::SagaId;
use saga::{
    InMemoryAccountService, InMemoryInventoryService, InMemoryOrderService, SagaCoordinator,
    SagaOutcome, SagaSummary,
};
use serde::{Deserialize, Serialize};
use step_log::{SagaQuery, SagaStatus, SagaStore, StepDefinition};

use crate::error::ApiError;

/// Upper bound for `GET /sagas/{id}/outcome?timeout_ms=`.
const MAX_AWAIT_MS: u64 = 300_000;
const DEFAULT_AWAIT_MS: u64 = 30_000;
const DEFAULT_PAGE_SIZE: usize = 50;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub coordinator: SagaCoordinator<dyn SagaStore>,
    pub orders: InMemoryOrderService,
    pub accounts: InMemoryAccountService,
    pub inventory: InMemoryInventoryService,
    /// Name of the step log backend, reported by `/health`.
    pub backend: &'static str,
}

// -- Request types --

#[derive(Deserialize)]
pub struct SubmitSagaRequest {
    pub steps: Vec<StepRequest>,
}

#[derive(Deserialize)]
pub struct StepRequest {
    pub action_name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Deserialize)]
pub struct OutcomeParams {
    pub timeout_ms: Option<u64>,
}

// -- Response types --

#[derive(Serialize)]
pub struct SagaSubmittedResponse {
    pub saga_id: String,
    pub status: SagaStatus,
}

// -- Handlers --

/// POST /sagas: persist a saga and start it in the background.
#[tracing::instrument(skip(state, req), fields(steps = req.steps.len()))]
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitSagaRequest>,
) -> Result<(StatusCode, Json<SagaSubmittedResponse>), ApiError> {
    let steps = req
        .steps
        .into_iter()
        .map(|step| StepDefinition::new(step.action_name, step.payload))
        .collect();

    let saga_id = state.coordinator.submit(steps).await?;

    let response = SagaSubmittedResponse {
        saga_id: saga_id.to_string(),
        status: SagaStatus::Running,
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /sagas: list sagas, oldest first, optionally filtered by status.
#[tracing::instrument(skip(state, params))]
pub async fn list(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<SagaSummary>>, ApiError> {
    let mut query = SagaQuery::new()
        .limit(params.limit.unwrap_or(DEFAULT_PAGE_SIZE))
        .offset(params.offset.unwrap_or(0));

    if let Some(status) = params.status.as_deref() {
        let status: SagaStatus = status
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("Invalid status: {status}")))?;
        query = query.status(status);
    }

    Ok(Json(state.coordinator.list(query).await?))
}

/// GET /sagas/{id}: current status and per-step progress.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaSummary>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    Ok(Json(state.coordinator.status(saga_id).await?))
}

/// GET /sagas/{id}/outcome: wait for the saga to finish.
#[tracing::instrument(skip(state, params))]
pub async fn outcome(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(params): Query<OutcomeParams>,
) -> Result<Json<SagaOutcome>, ApiError> {
    let saga_id = parse_saga_id(&id)?;
    let timeout_ms = params
        .timeout_ms
        .unwrap_or(DEFAULT_AWAIT_MS)
        .min(MAX_AWAIT_MS);

    let outcome = state
        .coordinator
        .await_outcome(saga_id, Duration::from_millis(timeout_ms))
        .await?;
    Ok(Json(outcome))
}

pub(crate) fn parse_saga_id(id: &str) -> Result<SagaId, ApiError> {
    id.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid saga id: {e}")))
}
