//! Payment saga definition.
//!
//! Paying for an order takes three steps:
//! 1. Mark the order paid (compensated by cancelling the payment)
//! 2. Debit the customer account (compensated by crediting it back)
//! 3. Decrement inventory (compensated by restocking)
//!
//! If any step fails, completed steps are compensated in reverse order.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use step_log::StepDefinition;
use uuid::Uuid;

use crate::error::ActionFailure;
use crate::registry::ActionRegistry;
use crate::services::{InMemoryAccountService, InMemoryInventoryService, InMemoryOrderService};

/// Action name: mark the order paid.
pub const ACTION_MARK_ORDER_PAID: &str = "mark_order_paid";

/// Action name: debit the customer account.
pub const ACTION_DEBIT_ACCOUNT: &str = "debit_account";

/// Action name: decrement stock for the ordered product.
pub const ACTION_DECREMENT_INVENTORY: &str = "decrement_inventory";

/// Payload shared by every step of a payment saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentOrder {
    pub order_id: Uuid,
    pub account_id: String,
    /// Amount in cents.
    pub amount: u64,
    pub product_id: String,
    pub count: u32,
}

impl PaymentOrder {
    /// Creates a payment for a new order.
    pub fn new(
        account_id: impl Into<String>,
        amount: u64,
        product_id: impl Into<String>,
        count: u32,
    ) -> Self {
        Self {
            order_id: Uuid::new_v4(),
            account_id: account_id.into(),
            amount,
            product_id: product_id.into(),
            count,
        }
    }

    /// Decodes a step payload. Malformed payloads are rejected as a business
    /// failure so the saga compensates instead of stalling.
    pub fn from_payload(payload: &Value) -> Result<Self, ActionFailure> {
        serde_json::from_value(payload.clone())
            .map_err(|e| ActionFailure::rejected(format!("invalid payment payload: {e}")))
    }

    /// Encodes the order with its serde derive, the inverse of
    /// [`from_payload`](Self::from_payload).
    pub fn to_payload(&self) -> Value {
        serde_json::json!(self)
    }
}

/// Builds the ordered steps of a payment saga.
pub fn payment_steps(order: &PaymentOrder) -> Vec<StepDefinition> {
    let payload = order.to_payload();
    vec![
        StepDefinition::new(ACTION_MARK_ORDER_PAID, payload.clone()),
        StepDefinition::new(ACTION_DEBIT_ACCOUNT, payload.clone()),
        StepDefinition::new(ACTION_DECREMENT_INVENTORY, payload),
    ]
}

/// Registers the three payment participants.
pub fn register_payment_actions(
    registry: &mut ActionRegistry,
    orders: InMemoryOrderService,
    accounts: InMemoryAccountService,
    inventory: InMemoryInventoryService,
) {
    registry
        .register(ACTION_MARK_ORDER_PAID, Arc::new(orders))
        .register(ACTION_DEBIT_ACCOUNT, Arc::new(accounts))
        .register(ACTION_DECREMENT_INVENTORY, Arc::new(inventory));
}
