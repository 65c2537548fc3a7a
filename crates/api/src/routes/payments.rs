//! Demo payment saga: mark order paid, debit account, decrement inventory.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use saga::{OrderPaymentState, PaymentOrder, SagaOutcome, payment_steps};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::sagas::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct PaymentRequest {
    pub account_id: String,
    pub amount: u64,
    pub product_id: String,
    pub count: u32,
}

#[derive(Deserialize)]
pub struct PaymentParams {
    /// Run the saga to completion before responding.
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub fault: PaymentFault,
}

/// Failure injected into the demo inventory before the saga starts.
///
/// The toggles are one-shot and shared by the whole service, so the next
/// decrement fails whichever payment reaches it first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentFault {
    #[default]
    None,
    /// The decrement is rejected, so the saga compensates.
    InventoryException,
    /// The run dies mid-saga and is left for recovery.
    Shutdown,
}

#[derive(Serialize)]
pub struct PaymentResponse {
    pub saga_id: String,
    pub order_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SagaOutcome>,
}

#[derive(Serialize)]
pub struct AccountResponse {
    pub account_id: String,
    pub balance: u64,
}

#[derive(Serialize)]
pub struct OrderResponse {
    pub order_id: Uuid,
    pub payment_state: OrderPaymentState,
}

/// POST /payments: start a payment saga for a new order.
///
/// Returns 202 immediately, or 200 with the outcome when `?wait=true`.
/// `?fault=shutdown` always returns 202 since the run never finishes.
#[tracing::instrument(
    skip(state, params, req),
    fields(account_id = %req.account_id, amount = req.amount, fault = ?params.fault)
)]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Query(params): Query<PaymentParams>,
    Json(req): Json<PaymentRequest>,
) -> Result<(StatusCode, Json<PaymentResponse>), ApiError> {
    if req.amount == 0 || req.count == 0 {
        return Err(ApiError::BadRequest(
            "amount and count must be positive".to_string(),
        ));
    }

    let order = PaymentOrder::new(req.account_id, req.amount, req.product_id, req.count);
    let steps = payment_steps(&order);

    match params.fault {
        PaymentFault::None => {}
        PaymentFault::InventoryException => state.inventory.fail_next_decrement(),
        PaymentFault::Shutdown => state.inventory.crash_on_next_decrement(),
    }

    if params.wait && params.fault != PaymentFault::Shutdown {
        let outcome = state.coordinator.execute(steps).await?;
        let response = PaymentResponse {
            saga_id: outcome.saga_id.to_string(),
            order_id: order.order_id,
            outcome: Some(outcome),
        };
        return Ok((StatusCode::OK, Json(response)));
    }

    let saga_id = state.coordinator.submit(steps).await?;
    let response = PaymentResponse {
        saga_id: saga_id.to_string(),
        order_id: order.order_id,
        outcome: None,
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// GET /accounts/{id}: demo account balance.
pub async fn account(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> Json<AccountResponse> {
    let balance = state.accounts.balance(&account_id);
    Json(AccountResponse {
        account_id,
        balance,
    })
}

/// GET /orders/{id}: demo order payment state.
pub async fn order(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = Uuid::parse_str(&order_id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid order id: {e}")))?;
    let payment_state = state
        .orders
        .payment_state(order_id)
        .ok_or_else(|| ApiError::NotFound(format!("Order {order_id} not found")))?;

    Ok(Json(OrderResponse {
        order_id,
        payment_state,
    }))
}
