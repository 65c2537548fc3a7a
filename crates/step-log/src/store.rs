use std::time::Duration;

use async_trait::async_trait;

use crate::{
    InvocationClaim, InvocationKey, InvocationRecord, Lease, Result, SagaId, SagaInstance, SagaQuery, SagaStatus,
    StepDefinition, StepFailure, StepState,
};

/// Durable store of saga instances and their step records.
///
/// Every write is atomic per record: no partially applied update is ever
/// observable. All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait StepLog: Send + Sync {
    /// Persists a new running saga whose steps are all pending.
    async fn create_saga(&self, steps: Vec<StepDefinition>) -> Result<SagaInstance>;

    /// Loads a saga with its step records, ordered by sequence number.
    ///
    /// Returns None if the saga doesn't exist.
    async fn load_saga(&self, saga_id: SagaId) -> Result<Option<SagaInstance>>;

    /// Moves a step from `expected` to `new`.
    ///
    /// Fails with `ConcurrentModification` if the stored state is not
    /// `expected`, and with `InvalidStepTransition` if `new` is
    /// `ForwardDone` while an earlier step is not.
    async fn update_step_state(
        &self,
        saga_id: SagaId,
        sequence_no: u32,
        expected: StepState,
        new: StepState,
    ) -> Result<()>;

    /// Increments the attempt counter of a step and returns the new value.
    async fn record_attempt(&self, saga_id: SagaId, sequence_no: u32) -> Result<u32>;

    /// Moves a saga to `status`, optionally recording the failing step in
    /// the same write.
    ///
    /// Re-applying the current status succeeds without effect. Any other
    /// transition not allowed by [`SagaStatus::can_transition_to`] fails
    /// with `InvalidStatusTransition`.
    async fn update_saga_status(
        &self,
        saga_id: SagaId,
        status: SagaStatus,
        failure: Option<StepFailure>,
    ) -> Result<()>;

    /// Scans sagas matching a query.
    async fn list_sagas(&self, query: SagaQuery) -> Result<Vec<SagaInstance>>;

    /// Returns every saga left in a non-terminal status.
    async fn scan_non_terminal(&self) -> Result<Vec<SagaInstance>> {
        self.list_sagas(SagaQuery::non_terminal()).await
    }
}

/// Write-once storage for idempotency guard outcomes.
#[async_trait]
pub trait InvocationStore: Send + Sync {
    /// Retrieves the stored outcome for a key, if any.
    async fn get_invocation(&self, key: InvocationKey) -> Result<Option<InvocationRecord>>;

    /// Stores `record` unless an outcome already exists for its key.
    ///
    /// Returns whichever record is durable after the call: the new one, or
    /// the one written first by a competing caller.
    async fn put_invocation(&self, record: InvocationRecord) -> Result<InvocationRecord>;

    /// Reserves `key` for `holder` before the action runs.
    ///
    /// A reservation already owned by `holder` is granted again. One owned
    /// by another holder is replaced only when `takeover` is set; callers
    /// set it while holding the saga's live lease, which the previous
    /// holder can no longer have. Returns `Completed` once an outcome is
    /// recorded, whoever holds the reservation.
    async fn claim_invocation(
        &self,
        key: InvocationKey,
        holder: &str,
        takeover: bool,
    ) -> Result<InvocationClaim>;
}

/// Storage for recovery ownership leases.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Claims a saga for `owner` for `ttl`.
    ///
    /// Succeeds only if no lease exists or the existing lease has expired;
    /// every acquisition gets a fresh token. Returns None while any live
    /// lease exists, including one held by `owner` itself.
    async fn try_acquire_lease(
        &self,
        saga_id: SagaId,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>>;

    /// Extends a held lease by `ttl` from now.
    ///
    /// Fails with `LeaseExpired` if the lease has expired or was claimed
    /// by someone else.
    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease>;

    /// Gives up a lease. Releasing a lease that is no longer held is a no-op.
    async fn release_lease(&self, lease: &Lease) -> Result<()>;
}

/// Everything the executor and recovery scanner need from storage.
pub trait SagaStore: StepLog + InvocationStore + LeaseStore {}

// Blanket implementation for any store offering all three contracts
impl<T: StepLog + InvocationStore + LeaseStore + ?Sized> SagaStore for T {}

/// Validates a saga before it is created.
pub fn validate_steps(steps: &[StepDefinition]) -> std::result::Result<(), String> {
    if steps.is_empty() {
        return Err("a saga needs at least one step".to_string());
    }
    if let Some(step) = steps.iter().find(|s| s.action_name.trim().is_empty()) {
        return Err(format!("step with payload {} has no action name", step.payload));
    }
    Ok(())
}
