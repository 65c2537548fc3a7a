//! Integration tests for the payment saga.

use std::sync::Arc;
use std::time::Duration;

use saga::{
    ActionRegistry, ExecutorConfig, IdempotencyGuard, InMemoryAccountService,
    InMemoryInventoryService, InMemoryOrderService, OrderPaymentState, PaymentOrder,
    RecoveryConfig, RecoveryScanner, SagaAction, SagaCoordinator, SagaError, SagaExecutor,
    payment_steps, register_payment_actions,
};
use step_log::{
    InMemoryStepLog, InvocationKey, InvocationOutcome, LeaseStore, Phase, SagaStatus, StepLog,
    StepState,
};

const ACCOUNT: &str = "acct-1";
const PRODUCT: &str = "SKU-001";

struct TestHarness {
    store: InMemoryStepLog,
    orders: InMemoryOrderService,
    accounts: InMemoryAccountService,
    inventory: InMemoryInventoryService,
    coordinator: SagaCoordinator<InMemoryStepLog>,
}

impl TestHarness {
    fn new() -> Self {
        Self::with_config(test_config())
    }

    fn with_config(config: ExecutorConfig) -> Self {
        let store = InMemoryStepLog::new();
        let orders = InMemoryOrderService::new();
        let accounts = InMemoryAccountService::new();
        let inventory = InMemoryInventoryService::new();

        accounts.deposit(ACCOUNT, 1_000);
        inventory.add_stock(PRODUCT, 10);

        let executor = build_executor(&store, &orders, &accounts, &inventory, config);
        let coordinator = SagaCoordinator::new(executor, "coordinator");

        Self {
            store,
            orders,
            accounts,
            inventory,
            coordinator,
        }
    }

    /// An executor as a freshly restarted process would build it: new
    /// registry and guard, same step log and participants.
    fn restarted_executor(&self) -> SagaExecutor<InMemoryStepLog> {
        build_executor(
            &self.store,
            &self.orders,
            &self.accounts,
            &self.inventory,
            test_config(),
        )
    }

    fn scanner(&self, worker_id: &str) -> RecoveryScanner<InMemoryStepLog> {
        RecoveryScanner::new(
            self.restarted_executor(),
            RecoveryConfig::default().with_worker_id(worker_id),
        )
    }
}

fn test_config() -> ExecutorConfig {
    ExecutorConfig::default()
        .with_retry_backoff(Duration::from_millis(1))
        .with_action_timeout(Duration::from_secs(1))
}

fn build_executor(
    store: &InMemoryStepLog,
    orders: &InMemoryOrderService,
    accounts: &InMemoryAccountService,
    inventory: &InMemoryInventoryService,
    config: ExecutorConfig,
) -> SagaExecutor<InMemoryStepLog> {
    let mut registry = ActionRegistry::new();
    register_payment_actions(
        &mut registry,
        orders.clone(),
        accounts.clone(),
        inventory.clone(),
    );
    SagaExecutor::new(Arc::new(store.clone()), Arc::new(registry), config)
}

fn step_states(saga: &step_log::SagaInstance) -> Vec<StepState> {
    saga.steps.iter().map(|s| s.state).collect()
}

#[tokio::test]
async fn test_happy_path_commits_every_step() {
    let h = TestHarness::new();
    let order = PaymentOrder::new(ACCOUNT, 100, PRODUCT, 1);

    let outcome = h.coordinator.execute(payment_steps(&order)).await.unwrap();

    assert_eq!(outcome.status, SagaStatus::Committed);
    assert!(outcome.failure.is_none());

    let saga = h.store.load_saga(outcome.saga_id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Committed);
    assert_eq!(step_states(&saga), vec![StepState::ForwardDone; 3]);

    assert_eq!(
        h.orders.payment_state(order.order_id),
        Some(OrderPaymentState::Paid)
    );
    assert_eq!(h.accounts.balance(ACCOUNT), 900);
    assert_eq!(h.inventory.stock(PRODUCT), 9);
}

#[tokio::test]
async fn test_inventory_failure_credits_account_back() {
    let h = TestHarness::new();
    h.inventory.set_fail_on_decrement(true);
    let order = PaymentOrder::new(ACCOUNT, 100, PRODUCT, 1);

    let outcome = h.coordinator.execute(payment_steps(&order)).await.unwrap();

    assert_eq!(outcome.status, SagaStatus::Compensated);
    let failure = outcome.failure.unwrap();
    assert_eq!(failure.sequence_no, 2);
    assert_eq!(failure.phase, Phase::Forward);
    assert_eq!(failure.action_name, "decrement_inventory");

    let saga = h.store.load_saga(outcome.saga_id).await.unwrap().unwrap();
    assert_eq!(
        step_states(&saga),
        vec![
            StepState::CompensateDone,
            StepState::CompensateDone,
            StepState::Pending
        ]
    );

    // Account credited back, payment cancelled, stock untouched
    assert_eq!(h.accounts.balance(ACCOUNT), 1_000);
    assert_eq!(h.accounts.credit_calls(), 1);
    assert_eq!(
        h.orders.payment_state(order.order_id),
        Some(OrderPaymentState::Cancelled)
    );
    assert_eq!(h.inventory.stock(PRODUCT), 10);
    assert_eq!(h.inventory.restock_calls(), 0);
}

#[tokio::test]
async fn test_first_step_failure_needs_no_compensation() {
    let h = TestHarness::new();
    h.orders.set_fail_on_mark_paid(true);
    let order = PaymentOrder::new(ACCOUNT, 100, PRODUCT, 1);

    let outcome = h.coordinator.execute(payment_steps(&order)).await.unwrap();

    assert_eq!(outcome.status, SagaStatus::Compensated);
    assert_eq!(outcome.failure.unwrap().sequence_no, 0);
    assert_eq!(h.accounts.debit_calls(), 0);
    assert_eq!(h.accounts.credit_calls(), 0);
}

#[tokio::test]
async fn test_insufficient_funds_compensates_order() {
    let h = TestHarness::new();
    let order = PaymentOrder::new(ACCOUNT, 5_000, PRODUCT, 1);

    let outcome = h.coordinator.execute(payment_steps(&order)).await.unwrap();

    assert_eq!(outcome.status, SagaStatus::Compensated);
    assert!(outcome.failure.unwrap().reason.contains("Insufficient funds"));
    assert_eq!(
        h.orders.payment_state(order.order_id),
        Some(OrderPaymentState::Cancelled)
    );
    assert_eq!(h.accounts.balance(ACCOUNT), 1_000);
}

#[tokio::test]
async fn test_crash_before_inventory_resumes_without_repeating_debit() {
    let h = TestHarness::with_config(test_config().with_lease_ttl(Duration::from_millis(100)));
    h.inventory.crash_on_next_decrement();
    let order = PaymentOrder::new(ACCOUNT, 100, PRODUCT, 1);

    // The participant dies mid-run; the saga is left behind.
    let result = h.coordinator.execute(payment_steps(&order)).await;
    assert!(matches!(result, Err(SagaError::Task(_))));

    let sagas = h.store.scan_non_terminal().await.unwrap();
    assert_eq!(sagas.len(), 1);
    let saga_id = sagas[0].id;
    assert_eq!(
        step_states(&sagas[0]),
        vec![
            StepState::ForwardDone,
            StepState::ForwardDone,
            StepState::Pending
        ]
    );

    // The dead run still holds its lease
    let report = h.scanner("recovery").scan_once().await.unwrap();
    assert_eq!(report.skipped, 1);

    tokio::time::sleep(Duration::from_millis(150)).await;

    let report = h.scanner("recovery").scan_once().await.unwrap();
    assert_eq!(report.resumed, 1);

    let saga = h.store.load_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Committed);
    assert_eq!(saga.steps[1].attempt, 1);
    assert_eq!(h.accounts.debit_calls(), 1);
    assert_eq!(h.inventory.decrement_calls(), 1);
    assert_eq!(h.accounts.balance(ACCOUNT), 900);
    assert_eq!(h.inventory.stock(PRODUCT), 9);
}

#[tokio::test]
async fn test_crash_then_inventory_failure_compensates_on_restart() {
    let h = TestHarness::with_config(test_config().with_lease_ttl(Duration::from_millis(50)));
    h.inventory.crash_on_next_decrement();
    let order = PaymentOrder::new(ACCOUNT, 100, PRODUCT, 1);

    let result = h.coordinator.execute(payment_steps(&order)).await;
    assert!(result.is_err());

    h.inventory.set_fail_on_decrement(true);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = h.scanner("recovery").scan_once().await.unwrap();
    assert_eq!(report.resumed, 1);

    let saga = h.store.list_sagas(Default::default()).await.unwrap().remove(0);
    assert_eq!(saga.status, SagaStatus::Compensated);
    assert_eq!(h.accounts.debit_calls(), 1);
    assert_eq!(h.accounts.credit_calls(), 1);
    assert_eq!(h.accounts.balance(ACCOUNT), 1_000);
}

#[tokio::test]
async fn test_restart_after_step_marked_done_does_not_reinvoke() {
    let h = TestHarness::new();
    let order = PaymentOrder::new(ACCOUNT, 100, PRODUCT, 1);

    // Simulate a run that died right after the debit reached ForwardDone.
    let saga = h.store.create_saga(payment_steps(&order)).await.unwrap();
    let executor = h.restarted_executor();
    for seq in 0..2 {
        let step = &saga.steps[seq as usize];
        let action = executor.registry().resolve(&step.action_name).unwrap();
        let output = action.forward(&step.payload).await.unwrap();
        executor
            .guard()
            .get_or_invoke(InvocationKey::forward(saga.id, seq), || async move {
                Ok(InvocationOutcome::Succeeded { output })
            })
            .await
            .unwrap();
        h.store
            .update_step_state(saga.id, seq, StepState::Pending, StepState::ForwardDone)
            .await
            .unwrap();
    }
    assert_eq!(h.accounts.debit_calls(), 1);

    let outcome = h.restarted_executor().run(saga.id).await.unwrap();

    assert_eq!(outcome.status, SagaStatus::Committed);
    assert_eq!(h.accounts.debit_calls(), 1);
    assert_eq!(h.inventory.decrement_calls(), 1);
}

#[tokio::test]
async fn test_failed_compensation_is_terminal() {
    let h = TestHarness::new();
    h.inventory.set_fail_on_decrement(true);
    h.accounts.set_fail_on_credit(true);
    let order = PaymentOrder::new(ACCOUNT, 100, PRODUCT, 1);

    let outcome = h.coordinator.execute(payment_steps(&order)).await.unwrap();

    assert_eq!(outcome.status, SagaStatus::Failed);
    let failure = outcome.failure.clone().unwrap();
    assert_eq!(failure.sequence_no, 1);
    assert_eq!(failure.phase, Phase::Compensate);

    let saga = h.store.load_saga(outcome.saga_id).await.unwrap().unwrap();
    assert_eq!(
        step_states(&saga),
        vec![
            StepState::ForwardDone,
            StepState::CompensateFailed,
            StepState::Pending
        ]
    );
    // Retried exactly as configured, then given up
    assert_eq!(h.accounts.credit_calls(), 3);
    assert_eq!(
        h.orders.payment_state(order.order_id),
        Some(OrderPaymentState::Paid)
    );

    // Neither a re-run nor a scan touches a failed saga again
    h.accounts.set_fail_on_credit(false);
    let rerun = h.restarted_executor().run(outcome.saga_id).await.unwrap();
    assert_eq!(rerun, outcome);
    let report = h.scanner("recovery").scan_once().await.unwrap();
    assert_eq!(report.scanned, 0);
    assert_eq!(h.accounts.credit_calls(), 3);
}

#[tokio::test]
async fn test_guard_runs_side_effect_once() {
    let h = TestHarness::new();
    let order = PaymentOrder::new(ACCOUNT, 100, PRODUCT, 1);
    let saga = h.store.create_saga(payment_steps(&order)).await.unwrap();
    let guard = IdempotencyGuard::new(Arc::new(h.store.clone()));
    let key = InvocationKey::forward(saga.id, 1);

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let accounts = h.accounts.clone();
        let payload = order.to_payload();
        let record = guard
            .get_or_invoke(key, || async move {
                let output = accounts.forward(&payload).await.unwrap();
                Ok(InvocationOutcome::Succeeded { output })
            })
            .await
            .unwrap();
        outcomes.push(record.outcome);
    }

    assert_eq!(h.accounts.debit_calls(), 1);
    assert_eq!(outcomes[0], outcomes[1]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_scanners_never_double_drive() {
    let h = TestHarness::new();
    let mut saga_ids = Vec::new();
    for _ in 0..10 {
        let order = PaymentOrder::new(ACCOUNT, 10, PRODUCT, 1);
        saga_ids.push(h.store.create_saga(payment_steps(&order)).await.unwrap().id);
    }

    let a = h.scanner("worker-a");
    let b = h.scanner("worker-b");
    let (ra, rb) = tokio::join!(a.scan_once(), b.scan_once());
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.errors + rb.errors, 0);
    assert!(ra.resumed + rb.resumed >= 10);
    assert_eq!(h.accounts.debit_calls(), 10);
    assert_eq!(h.inventory.decrement_calls(), 10);
    assert_eq!(h.accounts.balance(ACCOUNT), 900);

    for id in saga_ids {
        let saga = h.store.load_saga(id).await.unwrap().unwrap();
        assert_eq!(saga.status, SagaStatus::Committed);
        assert!(saga.steps.iter().all(|s| s.attempt == 1));
    }
}

#[tokio::test]
async fn test_slow_step_keeps_its_lease_against_a_second_scanner() {
    let store = InMemoryStepLog::new();
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = calls.clone();
    let mut registry = ActionRegistry::new();
    registry.register_fn(
        "slow_debit",
        move |_| {
            let calls = counter.clone();
            async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(serde_json::json!("debited"))
            }
        },
        |_| async { Ok(serde_json::Value::Null) },
    );
    let registry = Arc::new(registry);
    let ttl = Duration::from_millis(100);
    let scanner = |worker_id: &str| {
        let executor = SagaExecutor::new(
            Arc::new(store.clone()),
            registry.clone(),
            test_config().with_lease_ttl(ttl),
        );
        RecoveryScanner::new(
            executor,
            RecoveryConfig::default()
                .with_worker_id(worker_id)
                .with_lease_ttl(ttl),
        )
    };

    let saga = store
        .create_saga(vec![step_log::StepDefinition::new(
            "slow_debit",
            serde_json::json!({}),
        )])
        .await
        .unwrap();

    let (a, b) = (scanner("worker-a"), scanner("worker-b"));
    let late_scan = async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        b.scan_once().await
    };
    let (ra, rb) = tokio::join!(a.scan_once(), late_scan);
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.resumed, 1);
    assert_eq!(rb.skipped, 1);
    assert_eq!(rb.resumed, 0);
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    let saga = store.load_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Committed);
    assert_eq!(saga.steps[0].attempt, 1);
}

#[tokio::test]
async fn test_expired_lease_is_taken_over() {
    let h = TestHarness::new();
    let order = PaymentOrder::new(ACCOUNT, 100, PRODUCT, 1);
    let saga = h.store.create_saga(payment_steps(&order)).await.unwrap();

    // A worker claims the saga and dies without doing anything.
    h.store
        .try_acquire_lease(saga.id, "dead-worker", Duration::from_millis(50))
        .await
        .unwrap()
        .unwrap();

    let report = h.scanner("worker-b").scan_once().await.unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(h.accounts.debit_calls(), 0);

    tokio::time::sleep(Duration::from_millis(80)).await;

    let report = h.scanner("worker-b").scan_once().await.unwrap();
    assert_eq!(report.resumed, 1);
    let saga = h.store.load_saga(saga.id).await.unwrap().unwrap();
    assert_eq!(saga.status, SagaStatus::Committed);
}

#[tokio::test]
async fn test_submit_runs_in_background() {
    let h = TestHarness::new();
    let order = PaymentOrder::new(ACCOUNT, 100, PRODUCT, 1);

    let saga_id = h.coordinator.submit(payment_steps(&order)).await.unwrap();
    let outcome = h
        .coordinator
        .await_outcome(saga_id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(outcome.status, SagaStatus::Committed);
    let summary = h.coordinator.status(saga_id).await.unwrap();
    assert_eq!(summary.steps.len(), 3);
    assert!(summary.steps.iter().all(|s| s.state == StepState::ForwardDone));
}
