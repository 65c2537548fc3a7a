//! Saga executor.
//!
//! Drives one saga instance from whatever state the step log holds to a
//! terminal status. Nothing held in memory between two step log writes is
//! load-bearing: a crash at any point leaves a saga that a later `run` picks
//! up where the log says it stopped.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use step_log::{
    InvocationKey, InvocationOutcome, InvocationRecord, InvocationStore, Lease, LeaseStore, Phase, SagaId,
    SagaInstance, SagaStatus, SagaStore, StepFailure, StepLog, StepRecord, StepState,
};

use tokio::time::MissedTickBehavior;

use crate::error::{ActionFailure, Result, SagaError};
use crate::guard::IdempotencyGuard;
use crate::registry::{ActionRegistry, SagaAction};

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on a single forward or compensate call.
    pub action_timeout: Duration,

    /// How many times a failing compensation is tried before the saga is
    /// marked failed.
    pub compensation_attempts: u32,

    /// Pause between compensation attempts and conflict retries.
    pub retry_backoff: Duration,

    /// How many times a run reloads the saga after losing an optimistic
    /// check.
    pub conflict_retries: u32,

    /// TTL applied when renewing a lease. While an action runs the lease
    /// is renewed every third of this.
    pub lease_ttl: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(30),
            compensation_attempts: 3,
            retry_backoff: Duration::from_millis(100),
            conflict_retries: 3,
            lease_ttl: Duration::from_secs(30),
        }
    }
}

impl ExecutorConfig {
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = timeout;
        self
    }

    /// At least one attempt is always made.
    pub fn with_compensation_attempts(mut self, attempts: u32) -> Self {
        self.compensation_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_conflict_retries(mut self, retries: u32) -> Self {
        self.conflict_retries = retries;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }
}

/// Terminal result of a saga run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaOutcome {
    pub saga_id: SagaId,

    /// One of Committed, Compensated or Failed.
    pub status: SagaStatus,

    /// The step that sent the saga into compensation, or the compensation
    /// that failed.
    pub failure: Option<StepFailure>,
}

impl SagaOutcome {
    /// Returns the outcome of a saga that already reached a terminal status.
    pub fn from_terminal(saga: &SagaInstance) -> Option<Self> {
        saga.status.is_terminal().then(|| Self {
            saga_id: saga.id,
            status: saga.status,
            failure: saga.failure.clone(),
        })
    }

    pub fn is_committed(&self) -> bool {
        self.status == SagaStatus::Committed
    }
}

/// Runs saga instances against a step log and an action registry.
pub struct SagaExecutor<S: ?Sized> {
    store: Arc<S>,
    registry: Arc<ActionRegistry>,
    guard: IdempotencyGuard<S>,
    config: ExecutorConfig,
}

impl<S: ?Sized> Clone for SagaExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            guard: self.guard.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: SagaStore + ?Sized> SagaExecutor<S> {
    /// Creates a new executor.
    pub fn new(store: Arc<S>, registry: Arc<ActionRegistry>, config: ExecutorConfig) -> Self {
        let guard = IdempotencyGuard::new(Arc::clone(&store));
        Self {
            store,
            registry,
            guard,
            config,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    pub fn guard(&self) -> &IdempotencyGuard<S> {
        &self.guard
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Drives a saga to a terminal status.
    ///
    /// The caller is responsible for making sure nobody else drives the
    /// same saga; use [`run_leased`](Self::run_leased) when that is enforced
    /// with a lease. Re-running a terminal saga returns its outcome without
    /// side effects.
    #[tracing::instrument(skip(self), fields(saga_id = %saga_id))]
    pub async fn run(&self, saga_id: SagaId) -> Result<SagaOutcome> {
        self.drive(saga_id, None).await
    }

    /// Drives a saga while holding `lease`.
    ///
    /// The lease is renewed before every step, on a heartbeat while an
    /// action runs, and again before every step log write. If renewal fails
    /// the run stops with `LeaseExpired` without writing anything further;
    /// an action still running at that point is dropped.
    #[tracing::instrument(skip(self, lease), fields(saga_id = %saga_id, owner = %lease.owner))]
    pub async fn run_leased(&self, saga_id: SagaId, lease: &Lease) -> Result<SagaOutcome> {
        self.drive(saga_id, Some(lease)).await
    }

    async fn drive(&self, saga_id: SagaId, lease: Option<&Lease>) -> Result<SagaOutcome> {
        metrics::counter!("saga_runs_total").increment(1);
        let mut conflicts = 0;
        loop {
            match self.drive_once(saga_id, lease).await {
                Err(err @ SagaError::ConcurrentModification { .. })
                    if conflicts < self.config.conflict_retries =>
                {
                    conflicts += 1;
                    tracing::warn!(error = %err, conflicts, "step changed underneath us, reloading");
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
                result => return result,
            }
        }
    }

    async fn drive_once(&self, saga_id: SagaId, lease: Option<&Lease>) -> Result<SagaOutcome> {
        let saga = self
            .store
            .load_saga(saga_id)
            .await?
            .ok_or(SagaError::SagaNotFound(saga_id))?;

        if let Some(outcome) = SagaOutcome::from_terminal(&saga) {
            tracing::debug!(status = %saga.status, "saga already finished");
            return Ok(outcome);
        }

        // Resolve everything up front so a registry miss leaves the saga
        // untouched.
        let actions = saga
            .steps
            .iter()
            .map(|step| self.registry.resolve(&step.action_name))
            .collect::<Result<Vec<_>>>()?;

        let failure = match saga.status {
            SagaStatus::Running => match self.run_forward(&saga, &actions, lease).await? {
                None => return self.commit(&saga, lease).await,
                Some(failure) => {
                    tracing::warn!(%failure, "forward step failed, compensating");
                    self.renew(lease).await?;
                    self.store
                        .update_saga_status(saga.id, SagaStatus::Compensating, Some(failure.clone()))
                        .await?;
                    Some(failure)
                }
            },
            _ => {
                tracing::info!("resuming compensation");
                saga.failure.clone()
            }
        };

        self.compensate(&saga, &actions, lease, failure).await
    }

    /// Runs forward actions in sequence order. Returns the failing step, if
    /// any.
    async fn run_forward(
        &self,
        saga: &SagaInstance,
        actions: &[Arc<dyn SagaAction>],
        lease: Option<&Lease>,
    ) -> Result<Option<StepFailure>> {
        for (step, action) in saga.steps.iter().zip(actions) {
            if step.state == StepState::ForwardDone {
                continue;
            }

            self.renew(lease).await?;
            let key = InvocationKey::forward(saga.id, step.sequence_no);
            let record = self
                .guarded_invoke(key, step, action.as_ref(), Phase::Forward, 1, lease)
                .await?;

            match record.outcome {
                InvocationOutcome::Succeeded { .. } => {
                    self.renew(lease).await?;
                    self.store
                        .update_step_state(
                            saga.id,
                            step.sequence_no,
                            StepState::Pending,
                            StepState::ForwardDone,
                        )
                        .await?;
                    tracing::debug!(sequence_no = step.sequence_no, action = %step.action_name, "step done");
                }
                InvocationOutcome::Failed { reason } => {
                    return Ok(Some(StepFailure {
                        sequence_no: step.sequence_no,
                        action_name: step.action_name.clone(),
                        phase: Phase::Forward,
                        reason,
                    }));
                }
            }
        }
        Ok(None)
    }

    async fn commit(&self, saga: &SagaInstance, lease: Option<&Lease>) -> Result<SagaOutcome> {
        self.renew(lease).await?;
        self.store
            .update_saga_status(saga.id, SagaStatus::Committed, None)
            .await?;
        metrics::counter!("saga_committed").increment(1);
        tracing::info!(saga_id = %saga.id, steps = saga.step_count(), "saga committed");
        Ok(SagaOutcome {
            saga_id: saga.id,
            status: SagaStatus::Committed,
            failure: None,
        })
    }

    /// Walks completed steps from the highest sequence number down,
    /// compensating each.
    async fn compensate(
        &self,
        saga: &SagaInstance,
        actions: &[Arc<dyn SagaAction>],
        lease: Option<&Lease>,
        failure: Option<StepFailure>,
    ) -> Result<SagaOutcome> {
        for (step, action) in saga.steps.iter().zip(actions).rev() {
            match step.state {
                StepState::ForwardDone => {}
                // Crashed between marking the step and failing the saga.
                StepState::CompensateFailed => {
                    let reason = self.stored_failure_reason(saga.id, step.sequence_no).await?;
                    return self.fail(saga, step, lease, reason).await;
                }
                StepState::Pending | StepState::CompensateDone => continue,
            }

            self.renew(lease).await?;
            let key = InvocationKey::compensate(saga.id, step.sequence_no);
            let attempts = self.config.compensation_attempts.max(1);
            let record = self
                .guarded_invoke(key, step, action.as_ref(), Phase::Compensate, attempts, lease)
                .await?;

            self.renew(lease).await?;
            match record.outcome {
                InvocationOutcome::Succeeded { .. } => {
                    self.store
                        .update_step_state(
                            saga.id,
                            step.sequence_no,
                            StepState::ForwardDone,
                            StepState::CompensateDone,
                        )
                        .await?;
                    tracing::debug!(sequence_no = step.sequence_no, action = %step.action_name, "step compensated");
                }
                InvocationOutcome::Failed { reason } => {
                    self.store
                        .update_step_state(
                            saga.id,
                            step.sequence_no,
                            StepState::ForwardDone,
                            StepState::CompensateFailed,
                        )
                        .await?;
                    return self.fail(saga, step, lease, reason).await;
                }
            }
        }

        self.renew(lease).await?;
        self.store
            .update_saga_status(saga.id, SagaStatus::Compensated, None)
            .await?;
        metrics::counter!("saga_compensated").increment(1);
        tracing::info!(saga_id = %saga.id, "saga compensated");
        Ok(SagaOutcome {
            saga_id: saga.id,
            status: SagaStatus::Compensated,
            failure,
        })
    }

    async fn fail(
        &self,
        saga: &SagaInstance,
        step: &StepRecord,
        lease: Option<&Lease>,
        reason: String,
    ) -> Result<SagaOutcome> {
        let failure = StepFailure {
            sequence_no: step.sequence_no,
            action_name: step.action_name.clone(),
            phase: Phase::Compensate,
            reason,
        };
        self.renew(lease).await?;
        self.store
            .update_saga_status(saga.id, SagaStatus::Failed, Some(failure.clone()))
            .await?;
        metrics::counter!("saga_failed").increment(1);
        tracing::error!(saga_id = %saga.id, %failure, "compensation failed, saga needs manual intervention");
        Ok(SagaOutcome {
            saga_id: saga.id,
            status: SagaStatus::Failed,
            failure: Some(failure),
        })
    }

    async fn stored_failure_reason(&self, saga_id: SagaId, sequence_no: u32) -> Result<String> {
        let key = InvocationKey::compensate(saga_id, sequence_no);
        Ok(match self.store.get_invocation(key).await? {
            Some(record) => match record.outcome {
                InvocationOutcome::Failed { reason } => reason,
                InvocationOutcome::Succeeded { .. } => "compensation failed".to_string(),
            },
            None => "compensation failed".to_string(),
        })
    }

    async fn renew(&self, lease: Option<&Lease>) -> Result<()> {
        if let Some(lease) = lease {
            self.store.renew_lease(lease, self.config.lease_ttl).await?;
        }
        Ok(())
    }

    /// Runs an action through the idempotency guard.
    ///
    /// Under a lease the reservation is held by the lease, the lease is kept
    /// alive while the action runs, and the outcome is stored only if the
    /// lease is still ours once the action returns.
    async fn guarded_invoke(
        &self,
        key: InvocationKey,
        step: &StepRecord,
        action: &dyn SagaAction,
        phase: Phase,
        attempts: u32,
        lease: Option<&Lease>,
    ) -> Result<InvocationRecord> {
        let invoke = move || async move {
            let outcome = self.invoke(step, action, phase, attempts).await?;
            self.renew(lease).await?;
            Ok::<_, SagaError>(outcome)
        };
        match lease {
            Some(lease) => {
                let work = self.guard.get_or_invoke_leased(key, lease, invoke);
                self.with_heartbeat(lease, work).await
            }
            None => self.guard.get_or_invoke(key, invoke).await,
        }
    }

    /// Polls `work` while renewing `lease` every third of the lease TTL.
    /// A failed renewal drops `work` and returns the error.
    async fn with_heartbeat<T>(
        &self,
        lease: &Lease,
        work: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let period = (self.config.lease_ttl / 3).max(Duration::from_millis(1));
        let heartbeat = async {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.store.renew_lease(lease, self.config.lease_ttl).await {
                    return SagaError::from(err);
                }
                tracing::trace!(saga_id = %lease.saga_id, "lease renewed");
            }
        };

        tokio::select! {
            result = work => result,
            err = heartbeat => {
                metrics::counter!("saga_leases_lost_total").increment(1);
                tracing::warn!(error = %err, "lease lost while an action was running, abandoning it");
                Err(err)
            }
        }
    }

    /// Invokes an action up to `attempts` times under the action timeout and
    /// converts the last result into a storable outcome.
    async fn invoke(
        &self,
        step: &StepRecord,
        action: &dyn SagaAction,
        phase: Phase,
        attempts: u32,
    ) -> Result<InvocationOutcome> {
        let mut tried = 0;
        loop {
            tried += 1;
            let attempt = self
                .store
                .record_attempt(step.saga_id, step.sequence_no)
                .await?;

            let started = Instant::now();
            let call = async {
                match phase {
                    Phase::Forward => action.forward(&step.payload).await,
                    Phase::Compensate => action.compensate(&step.payload).await,
                }
            };
            let result = tokio::time::timeout(self.config.action_timeout, call)
                .await
                .unwrap_or_else(|_| Err(ActionFailure::timed_out(self.config.action_timeout)));
            metrics::histogram!(
                "saga_step_duration_seconds",
                "action" => step.action_name.clone(),
                "phase" => phase.as_str()
            )
            .record(started.elapsed().as_secs_f64());

            match result {
                Ok(output) => return Ok(InvocationOutcome::Succeeded { output }),
                Err(failure) if tried >= attempts => {
                    tracing::warn!(
                        sequence_no = step.sequence_no,
                        action = %step.action_name,
                        %phase,
                        attempt,
                        error = %failure,
                        "action failed"
                    );
                    return Ok(InvocationOutcome::Failed {
                        reason: failure.to_string(),
                    });
                }
                Err(failure) => {
                    tracing::warn!(
                        sequence_no = step.sequence_no,
                        action = %step.action_name,
                        %phase,
                        attempt,
                        error = %failure,
                        "action failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_backoff).await;
                }
            }
        }
    }
}
