//! Account service: debits a customer account, credits it back on
//! compensation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::ActionFailure;
use crate::payment::PaymentOrder;
use crate::registry::{ActionResult, SagaAction};

#[derive(Debug, Default)]
struct InMemoryAccountState {
    balances: HashMap<String, u64>,
    /// Debits applied per order, so repeats and credits are idempotent.
    debits: HashMap<Uuid, (String, u64)>,
    debit_calls: usize,
    credit_calls: usize,
    fail_on_debit: bool,
    fail_on_credit: bool,
    crash_on_next_debit: bool,
}

/// In-memory account service for testing and the demo server.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAccountService {
    state: Arc<RwLock<InMemoryAccountState>>,
}

impl InMemoryAccountService {
    /// Creates a new in-memory account service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds funds to an account.
    pub fn deposit(&self, account_id: &str, amount: u64) {
        *self
            .state
            .write()
            .unwrap()
            .balances
            .entry(account_id.to_string())
            .or_default() += amount;
    }

    pub fn balance(&self, account_id: &str) -> u64 {
        self.state
            .read()
            .unwrap()
            .balances
            .get(account_id)
            .copied()
            .unwrap_or(0)
    }

    /// Configures the service to reject debits.
    pub fn set_fail_on_debit(&self, fail: bool) {
        self.state.write().unwrap().fail_on_debit = fail;
    }

    /// Configures the service to reject credits.
    pub fn set_fail_on_credit(&self, fail: bool) {
        self.state.write().unwrap().fail_on_credit = fail;
    }

    /// Makes the next debit panic before touching any balance.
    pub fn crash_on_next_debit(&self) {
        self.state.write().unwrap().crash_on_next_debit = true;
    }

    /// Number of debit requests received.
    pub fn debit_calls(&self) -> usize {
        self.state.read().unwrap().debit_calls
    }

    /// Number of credit requests received.
    pub fn credit_calls(&self) -> usize {
        self.state.read().unwrap().credit_calls
    }

    /// Returns true if a debit for the order is currently applied.
    pub fn has_debit(&self, order_id: Uuid) -> bool {
        self.state.read().unwrap().debits.contains_key(&order_id)
    }

    fn debit(&self, order: &PaymentOrder) -> ActionResult {
        let crash = std::mem::take(&mut self.state.write().unwrap().crash_on_next_debit);
        if crash {
            panic!("simulated crash while debiting order {}", order.order_id);
        }

        let mut state = self.state.write().unwrap();
        state.debit_calls += 1;

        if state.fail_on_debit {
            return Err(ActionFailure::rejected("Debit declined"));
        }

        if let Some((account_id, amount)) = state.debits.get(&order.order_id) {
            return Ok(json!({ "account_id": account_id, "debited": amount }));
        }

        let balance = state.balances.entry(order.account_id.clone()).or_default();
        if *balance < order.amount {
            return Err(ActionFailure::rejected(format!(
                "Insufficient funds in account {}",
                order.account_id
            )));
        }
        *balance -= order.amount;
        let remaining = *balance;
        state
            .debits
            .insert(order.order_id, (order.account_id.clone(), order.amount));

        Ok(json!({
            "account_id": order.account_id,
            "debited": order.amount,
            "balance": remaining,
        }))
    }

    fn credit(&self, order: &PaymentOrder) -> ActionResult {
        let mut state = self.state.write().unwrap();
        state.credit_calls += 1;

        if state.fail_on_credit {
            return Err(ActionFailure::rejected("Credit rejected by ledger"));
        }

        let debit = state.debits.remove(&order.order_id);
        let credited = match debit {
            Some((account_id, amount)) => {
                *state.balances.entry(account_id).or_default() += amount;
                amount
            }
            None => 0,
        };
        Ok(json!({ "account_id": order.account_id, "credited": credited }))
    }
}

#[async_trait]
impl SagaAction for InMemoryAccountService {
    async fn forward(&self, payload: &Value) -> ActionResult {
        self.debit(&PaymentOrder::from_payload(payload)?)
    }

    async fn compensate(&self, payload: &Value) -> ActionResult {
        self.credit(&PaymentOrder::from_payload(payload)?)
    }
}
