//! Caller-facing API for submitting and observing sagas.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use step_log::{
    Lease, LeaseStore, SagaId, SagaInstance, SagaQuery, SagaStatus, SagaStore, StepDefinition,
    StepFailure, StepLog, StepState,
};
use tracing::Instrument;

use crate::error::{Result, SagaError};
use crate::executor::{SagaExecutor, SagaOutcome};

/// Point-in-time view of a saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaSummary {
    pub saga_id: SagaId,
    pub status: SagaStatus,
    pub failure: Option<StepFailure>,
    pub steps: Vec<StepSummary>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Progress of a single step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummary {
    pub sequence_no: u32,
    pub action_name: String,
    pub state: StepState,
    pub attempt: u32,
}

impl From<&SagaInstance> for SagaSummary {
    fn from(saga: &SagaInstance) -> Self {
        Self {
            saga_id: saga.id,
            status: saga.status,
            failure: saga.failure.clone(),
            steps: saga
                .steps
                .iter()
                .map(|step| StepSummary {
                    sequence_no: step.sequence_no,
                    action_name: step.action_name.clone(),
                    state: step.state,
                    attempt: step.attempt,
                })
                .collect(),
            created_at: saga.created_at,
            updated_at: saga.updated_at,
        }
    }
}

/// Submits sagas, drives them under a lease and reports their progress.
///
/// Submitted sagas run on background tasks. If this process dies mid-run
/// the lease expires and a [`RecoveryScanner`](crate::RecoveryScanner)
/// finishes the work.
pub struct SagaCoordinator<S: ?Sized> {
    executor: SagaExecutor<S>,
    worker_id: String,
    lease_ttl: Duration,
    poll_interval: Duration,
    execute_timeout: Duration,
}

impl<S: SagaStore + ?Sized + 'static> SagaCoordinator<S> {
    /// Creates a coordinator whose leases are owned by `worker_id`.
    pub fn new(executor: SagaExecutor<S>, worker_id: impl Into<String>) -> Self {
        let lease_ttl = executor.config().lease_ttl;
        Self {
            executor,
            worker_id: worker_id.into(),
            lease_ttl,
            poll_interval: Duration::from_millis(25),
            execute_timeout: Duration::from_secs(300),
        }
    }

    /// Sets how often [`await_outcome`](Self::await_outcome) polls the step log.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets how long [`execute`](Self::execute) waits when another worker
    /// claimed the saga first.
    pub fn with_execute_timeout(mut self, timeout: Duration) -> Self {
        self.execute_timeout = timeout;
        self
    }

    pub fn executor(&self) -> &SagaExecutor<S> {
        &self.executor
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Validates, persists and starts a saga in the background.
    #[tracing::instrument(skip(self, steps), fields(steps = steps.len()))]
    pub async fn submit(&self, steps: Vec<StepDefinition>) -> Result<SagaId> {
        let (saga_id, lease) = self.create(steps).await?;

        if let Some(lease) = lease {
            let executor = self.executor.clone();
            tokio::spawn(
                async move {
                    if let Err(err) = drive_leased(executor, lease).await {
                        tracing::warn!(error = %err, "saga run interrupted, left for recovery");
                    }
                }
                .instrument(tracing::info_span!("saga_run", %saga_id)),
            );
        }

        Ok(saga_id)
    }

    /// Submits a saga and waits for its outcome.
    ///
    /// A participant that panics surfaces as [`SagaError::Task`]; the saga
    /// keeps its lease until it expires, exactly as if the process had died.
    #[tracing::instrument(skip(self, steps), fields(steps = steps.len()))]
    pub async fn execute(&self, steps: Vec<StepDefinition>) -> Result<SagaOutcome> {
        let (saga_id, lease) = self.create(steps).await?;

        match lease {
            Some(lease) => {
                let executor = self.executor.clone();
                tokio::spawn(drive_leased(executor, lease))
                    .await
                    .map_err(|e| SagaError::Task(e.to_string()))?
            }
            None => self.await_outcome(saga_id, self.execute_timeout).await,
        }
    }

    /// Polls the step log until the saga reaches a terminal status.
    pub async fn await_outcome(&self, saga_id: SagaId, timeout: Duration) -> Result<SagaOutcome> {
        let poll = async {
            loop {
                let saga = self.load(saga_id).await?;
                if let Some(outcome) = SagaOutcome::from_terminal(&saga) {
                    return Ok(outcome);
                }
                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| SagaError::AwaitTimeout {
                saga_id,
                waited: timeout,
            })?
    }

    /// Returns the current state of a saga.
    pub async fn status(&self, saga_id: SagaId) -> Result<SagaSummary> {
        Ok(SagaSummary::from(&self.load(saga_id).await?))
    }

    /// Lists sagas matching a query.
    pub async fn list(&self, query: SagaQuery) -> Result<Vec<SagaSummary>> {
        let sagas = self.executor.store().list_sagas(query).await?;
        Ok(sagas.iter().map(SagaSummary::from).collect())
    }

    async fn load(&self, saga_id: SagaId) -> Result<SagaInstance> {
        self.executor
            .store()
            .load_saga(saga_id)
            .await?
            .ok_or(SagaError::SagaNotFound(saga_id))
    }

    fn validate(&self, steps: &[StepDefinition]) -> Result<()> {
        if steps.is_empty() {
            return Err(SagaError::EmptySaga);
        }
        for step in steps {
            self.executor.registry().resolve(&step.action_name)?;
        }
        Ok(())
    }

    /// Persists a saga and claims it for this worker.
    async fn create(&self, steps: Vec<StepDefinition>) -> Result<(SagaId, Option<Lease>)> {
        self.validate(&steps)?;

        let store = self.executor.store();
        let saga = store.create_saga(steps).await?;
        let lease = store
            .try_acquire_lease(saga.id, &self.worker_id, self.lease_ttl)
            .await?;
        if lease.is_none() {
            tracing::info!(saga_id = %saga.id, "saga claimed by another worker before it started");
        }

        tracing::info!(saga_id = %saga.id, steps = saga.step_count(), "saga submitted");
        Ok((saga.id, lease))
    }
}

async fn drive_leased<S: SagaStore + ?Sized>(
    executor: SagaExecutor<S>,
    lease: Lease,
) -> Result<SagaOutcome> {
    let result = executor.run_leased(lease.saga_id, &lease).await;
    if let Err(err) = executor.store().release_lease(&lease).await {
        tracing::warn!(saga_id = %lease.saga_id, error = %err, "failed to release lease");
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{Value, json};
    use step_log::InMemoryStepLog;

    use super::*;
    use crate::executor::ExecutorConfig;
    use crate::registry::ActionRegistry;

    fn coordinator(store: &InMemoryStepLog) -> SagaCoordinator<InMemoryStepLog> {
        let mut registry = ActionRegistry::new();
        registry.register_fn(
            "ok",
            |_| async { Ok(json!("done")) },
            |_| async { Ok(Value::Null) },
        );
        let executor = SagaExecutor::new(
            Arc::new(store.clone()),
            Arc::new(registry),
            ExecutorConfig::default(),
        );
        SagaCoordinator::new(executor, "test-worker")
    }

    #[tokio::test]
    async fn submit_rejects_empty_saga() {
        let store = InMemoryStepLog::new();
        let result = coordinator(&store).submit(vec![]).await;
        assert!(matches!(result, Err(SagaError::EmptySaga)));
        assert_eq!(store.saga_count().await, 0);
    }

    #[tokio::test]
    async fn submit_rejects_unknown_action() {
        let store = InMemoryStepLog::new();
        let result = coordinator(&store)
            .submit(vec![
                StepDefinition::new("ok", json!({})),
                StepDefinition::new("nope", json!({})),
            ])
            .await;
        assert!(matches!(result, Err(SagaError::UnknownAction(name)) if name == "nope"));
        assert_eq!(store.saga_count().await, 0);
    }

    #[tokio::test]
    async fn submit_then_await() {
        let store = InMemoryStepLog::new();
        let coordinator = coordinator(&store);

        let saga_id = coordinator
            .submit(vec![StepDefinition::new("ok", json!({}))])
            .await
            .unwrap();
        let outcome = coordinator
            .await_outcome(saga_id, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(outcome.status, SagaStatus::Committed);
        let summary = coordinator.status(saga_id).await.unwrap();
        assert_eq!(summary.steps[0].state, StepState::ForwardDone);
        assert_eq!(summary.steps[0].attempt, 1);
    }

    #[tokio::test]
    async fn await_times_out_on_stuck_saga() {
        let store = InMemoryStepLog::new();
        let coordinator = coordinator(&store);
        let saga = store
            .create_saga(vec![StepDefinition::new("ok", json!({}))])
            .await
            .unwrap();

        let result = coordinator
            .await_outcome(saga.id, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(SagaError::AwaitTimeout { .. })));
    }

    #[tokio::test]
    async fn status_of_missing_saga() {
        let store = InMemoryStepLog::new();
        let result = coordinator(&store).status(SagaId::new()).await;
        assert!(matches!(result, Err(SagaError::SagaNotFound(_))));
    }

    #[tokio::test]
    async fn lease_is_released_after_execute() {
        let store = InMemoryStepLog::new();
        let outcome = coordinator(&store)
            .execute(vec![StepDefinition::new("ok", json!({}))])
            .await
            .unwrap();

        assert!(outcome.is_committed());
        assert!(store.current_lease(outcome.saga_id).await.is_none());

        let listed = coordinator(&store)
            .list(SagaQuery::new().status(SagaStatus::Committed))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }
}
