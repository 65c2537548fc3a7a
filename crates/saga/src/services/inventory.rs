//! Inventory service: decrements stock, restocks on compensation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::ActionFailure;
use crate::payment::PaymentOrder;
use crate::registry::{ActionResult, SagaAction};

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    stock: HashMap<String, u32>,
    /// Decrements applied per order.
    decrements: HashMap<Uuid, (String, u32)>,
    decrement_calls: usize,
    restock_calls: usize,
    fail_on_decrement: bool,
    fail_next_decrement: bool,
    fail_on_restock: bool,
    crash_on_next_decrement: bool,
}

/// In-memory inventory service for testing and the demo server.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds units of a product to stock.
    pub fn add_stock(&self, product_id: &str, count: u32) {
        *self
            .state
            .write()
            .unwrap()
            .stock
            .entry(product_id.to_string())
            .or_default() += count;
    }

    pub fn stock(&self, product_id: &str) -> u32 {
        self.state
            .read()
            .unwrap()
            .stock
            .get(product_id)
            .copied()
            .unwrap_or(0)
    }

    /// Configures the service to reject decrements.
    pub fn set_fail_on_decrement(&self, fail: bool) {
        self.state.write().unwrap().fail_on_decrement = fail;
    }

    /// Rejects only the next decrement.
    pub fn fail_next_decrement(&self) {
        self.state.write().unwrap().fail_next_decrement = true;
    }

    /// Configures the service to reject restocks.
    pub fn set_fail_on_restock(&self, fail: bool) {
        self.state.write().unwrap().fail_on_restock = fail;
    }

    /// Makes the next decrement panic before touching stock.
    pub fn crash_on_next_decrement(&self) {
        self.state.write().unwrap().crash_on_next_decrement = true;
    }

    pub fn decrement_calls(&self) -> usize {
        self.state.read().unwrap().decrement_calls
    }

    pub fn restock_calls(&self) -> usize {
        self.state.read().unwrap().restock_calls
    }

    fn decrement(&self, order: &PaymentOrder) -> ActionResult {
        let crash = std::mem::take(&mut self.state.write().unwrap().crash_on_next_decrement);
        if crash {
            panic!("simulated crash while decrementing stock for order {}", order.order_id);
        }

        let mut state = self.state.write().unwrap();
        state.decrement_calls += 1;

        let fail_once = std::mem::take(&mut state.fail_next_decrement);
        if state.fail_on_decrement || fail_once {
            return Err(ActionFailure::rejected("Insufficient stock"));
        }

        if let Some((product_id, count)) = state.decrements.get(&order.order_id) {
            return Ok(json!({ "product_id": product_id, "decremented": count }));
        }

        let available = state.stock.entry(order.product_id.clone()).or_default();
        if *available < order.count {
            return Err(ActionFailure::rejected(format!(
                "Insufficient stock for {}",
                order.product_id
            )));
        }
        *available -= order.count;
        let remaining = *available;
        state
            .decrements
            .insert(order.order_id, (order.product_id.clone(), order.count));

        Ok(json!({
            "product_id": order.product_id,
            "decremented": order.count,
            "remaining": remaining,
        }))
    }

    fn restock(&self, order: &PaymentOrder) -> ActionResult {
        let mut state = self.state.write().unwrap();
        state.restock_calls += 1;

        if state.fail_on_restock {
            return Err(ActionFailure::rejected("Restock rejected"));
        }

        let decrement = state.decrements.remove(&order.order_id);
        let restocked = match decrement {
            Some((product_id, count)) => {
                *state.stock.entry(product_id).or_default() += count;
                count
            }
            None => 0,
        };
        Ok(json!({ "product_id": order.product_id, "restocked": restocked }))
    }
}

#[async_trait]
impl SagaAction for InMemoryInventoryService {
    async fn forward(&self, payload: &Value) -> ActionResult {
        self.decrement(&PaymentOrder::from_payload(payload)?)
    }

    async fn compensate(&self, payload: &Value) -> ActionResult {
        self.restock(&PaymentOrder::from_payload(payload)?)
    }
}
