//! Order service: marks an order paid, cancels the payment on compensation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::ActionFailure;
use crate::payment::PaymentOrder;
use crate::registry::{ActionResult, SagaAction};

/// Payment state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderPaymentState {
    Paid,
    Cancelled,
}

#[derive(Debug, Default)]
struct InMemoryOrderState {
    orders: HashMap<Uuid, OrderPaymentState>,
    fail_on_mark_paid: bool,
    fail_on_cancel: bool,
}

/// In-memory order service for testing and the demo server.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderService {
    state: Arc<RwLock<InMemoryOrderState>>,
}

impl InMemoryOrderService {
    /// Creates a new in-memory order service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the service to fail when marking orders paid.
    pub fn set_fail_on_mark_paid(&self, fail: bool) {
        self.state.write().unwrap().fail_on_mark_paid = fail;
    }

    /// Configures the service to fail when cancelling payments.
    pub fn set_fail_on_cancel(&self, fail: bool) {
        self.state.write().unwrap().fail_on_cancel = fail;
    }

    pub fn payment_state(&self, order_id: Uuid) -> Option<OrderPaymentState> {
        self.state.read().unwrap().orders.get(&order_id).copied()
    }

    fn mark_paid(&self, order: &PaymentOrder) -> ActionResult {
        let mut state = self.state.write().unwrap();

        if state.fail_on_mark_paid {
            return Err(ActionFailure::rejected("Order store unavailable"));
        }

        match state.orders.get(&order.order_id) {
            Some(OrderPaymentState::Cancelled) => Err(ActionFailure::rejected(format!(
                "Order {} payment was cancelled",
                order.order_id
            ))),
            Some(OrderPaymentState::Paid) | None => {
                state
                    .orders
                    .insert(order.order_id, OrderPaymentState::Paid);
                Ok(json!({ "order_id": order.order_id, "state": OrderPaymentState::Paid }))
            }
        }
    }

    /// Cancelling an order that was never paid still records the
    /// cancellation, so a late `mark_paid` cannot succeed afterwards.
    fn cancel_payment(&self, order: &PaymentOrder) -> ActionResult {
        let mut state = self.state.write().unwrap();

        if state.fail_on_cancel {
            return Err(ActionFailure::rejected("Order store unavailable"));
        }

        state
            .orders
            .insert(order.order_id, OrderPaymentState::Cancelled);
        Ok(json!({ "order_id": order.order_id, "state": OrderPaymentState::Cancelled }))
    }
}

#[async_trait]
impl SagaAction for InMemoryOrderService {
    async fn forward(&self, payload: &Value) -> ActionResult {
        self.mark_paid(&PaymentOrder::from_payload(payload)?)
    }

    async fn compensate(&self, payload: &Value) -> ActionResult {
        self.cancel_payment(&PaymentOrder::from_payload(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mark_paid_and_cancel() {
        let service = InMemoryOrderService::new();
        let order = PaymentOrder::new("acct-1", 100, "SKU-001", 1);

        service.forward(&order.to_payload()).await.unwrap();
        service.forward(&order.to_payload()).await.unwrap();
        assert_eq!(
            service.payment_state(order.order_id),
            Some(OrderPaymentState::Paid)
        );

        service.compensate(&order.to_payload()).await.unwrap();
        assert_eq!(
            service.payment_state(order.order_id),
            Some(OrderPaymentState::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_cancelled_order_cannot_be_paid() {
        let service = InMemoryOrderService::new();
        let order = PaymentOrder::new("acct-1", 100, "SKU-001", 1);

        service.compensate(&order.to_payload()).await.unwrap();
        let result = service.forward(&order.to_payload()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_fail_on_mark_paid() {
        let service = InMemoryOrderService::new();
        service.set_fail_on_mark_paid(true);
        let order = PaymentOrder::new("acct-1", 100, "SKU-001", 1);

        assert!(service.forward(&order.to_payload()).await.is_err());
        assert_eq!(service.payment_state(order.order_id), None);
    }
}
