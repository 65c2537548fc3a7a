use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    InvocationClaim, InvocationKey, InvocationRecord, Lease, Result, SagaId, SagaInstance, SagaQuery, SagaStatus,
    StepDefinition, StepFailure, StepLogError, StepState,
    record::expiry_from,
    store::{InvocationStore, LeaseStore, StepLog, validate_steps},
};

/// In-memory step log implementation for testing.
///
/// Provides the same interface and atomicity guarantees as the PostgreSQL
/// implementation. Clones share the same underlying state, so a "restarted"
/// coordinator can be simulated by building a fresh executor over a clone.
#[derive(Clone, Default)]
pub struct InMemoryStepLog {
    sagas: Arc<RwLock<HashMap<SagaId, SagaInstance>>>,
    invocations: Arc<RwLock<HashMap<InvocationKey, InvocationRecord>>>,
    claims: Arc<RwLock<HashMap<InvocationKey, String>>>,
    leases: Arc<RwLock<HashMap<SagaId, Lease>>>,
}

impl InMemoryStepLog {
    /// Creates a new empty in-memory step log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of sagas stored.
    pub async fn saga_count(&self) -> usize {
        self.sagas.read().await.len()
    }

    /// Returns the total number of invocation outcomes stored.
    pub async fn invocation_count(&self) -> usize {
        self.invocations.read().await.len()
    }

    /// Returns the holder of an invocation key's reservation.
    pub async fn claim_holder(&self, key: InvocationKey) -> Option<String> {
        self.claims.read().await.get(&key).cloned()
    }

    /// Returns the current lease on a saga, expired or not.
    pub async fn current_lease(&self, saga_id: SagaId) -> Option<Lease> {
        self.leases.read().await.get(&saga_id).cloned()
    }

    /// Clears all sagas, invocations, reservations and leases.
    pub async fn clear(&self) {
        self.sagas.write().await.clear();
        self.invocations.write().await.clear();
        self.claims.write().await.clear();
        self.leases.write().await.clear();
    }
}

#[async_trait]
impl StepLog for InMemoryStepLog {
    async fn create_saga(&self, steps: Vec<StepDefinition>) -> Result<SagaInstance> {
        validate_steps(&steps).map_err(StepLogError::InvalidSaga)?;

        let saga = SagaInstance::new(SagaId::new(), steps);
        self.sagas.write().await.insert(saga.id, saga.clone());
        Ok(saga)
    }

    async fn load_saga(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        Ok(self.sagas.read().await.get(&saga_id).cloned())
    }

    async fn update_step_state(
        &self,
        saga_id: SagaId,
        sequence_no: u32,
        expected: StepState,
        new: StepState,
    ) -> Result<()> {
        let mut sagas = self.sagas.write().await;
        let saga = sagas
            .get_mut(&saga_id)
            .ok_or(StepLogError::SagaNotFound(saga_id))?;

        if let Err(err) = saga.check_step_transition(sequence_no, expected, new) {
            if matches!(err, StepLogError::ConcurrentModification { .. }) {
                metrics::counter!("step_log_conflicts_total", "backend" => "memory").increment(1);
            }
            return Err(err);
        }

        let now = Utc::now();
        if let Some(step) = saga.steps.iter_mut().find(|s| s.sequence_no == sequence_no) {
            step.state = new;
            step.updated_at = now;
        }
        saga.updated_at = now;
        Ok(())
    }

    async fn record_attempt(&self, saga_id: SagaId, sequence_no: u32) -> Result<u32> {
        let mut sagas = self.sagas.write().await;
        let saga = sagas
            .get_mut(&saga_id)
            .ok_or(StepLogError::SagaNotFound(saga_id))?;

        let now = Utc::now();
        let step = saga
            .steps
            .iter_mut()
            .find(|s| s.sequence_no == sequence_no)
            .ok_or(StepLogError::StepNotFound {
                saga_id,
                sequence_no,
            })?;
        step.attempt += 1;
        step.updated_at = now;
        let attempt = step.attempt;
        saga.updated_at = now;
        Ok(attempt)
    }

    async fn update_saga_status(
        &self,
        saga_id: SagaId,
        status: SagaStatus,
        failure: Option<StepFailure>,
    ) -> Result<()> {
        let mut sagas = self.sagas.write().await;
        let saga = sagas
            .get_mut(&saga_id)
            .ok_or(StepLogError::SagaNotFound(saga_id))?;

        if !saga.status.can_transition_to(status) {
            return Err(StepLogError::InvalidStatusTransition {
                saga_id,
                from: saga.status,
                to: status,
            });
        }

        saga.status = status;
        if failure.is_some() {
            saga.failure = failure;
        }
        saga.updated_at = Utc::now();
        Ok(())
    }

    async fn list_sagas(&self, query: SagaQuery) -> Result<Vec<SagaInstance>> {
        let sagas = self.sagas.read().await;
        let mut matching: Vec<_> = sagas
            .values()
            .filter(|saga| query.matches(saga))
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.id.as_uuid().cmp(&b.id.as_uuid()))
        });

        let offset = query.offset.unwrap_or(0);
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }
}

#[async_trait]
impl InvocationStore for InMemoryStepLog {
    async fn get_invocation(&self, key: InvocationKey) -> Result<Option<InvocationRecord>> {
        Ok(self.invocations.read().await.get(&key).cloned())
    }

    async fn put_invocation(&self, record: InvocationRecord) -> Result<InvocationRecord> {
        let mut invocations = self.invocations.write().await;
        let stored = invocations.entry(record.key).or_insert(record);
        Ok(stored.clone())
    }

    async fn claim_invocation(
        &self,
        key: InvocationKey,
        holder: &str,
        takeover: bool,
    ) -> Result<InvocationClaim> {
        // Held across the reservation so no outcome lands in between.
        let invocations = self.invocations.read().await;
        if let Some(record) = invocations.get(&key) {
            return Ok(InvocationClaim::Completed(record.clone()));
        }

        let mut claims = self.claims.write().await;
        match claims.get(&key) {
            Some(current) if current != holder && !takeover => {
                Ok(InvocationClaim::HeldBy(current.clone()))
            }
            _ => {
                claims.insert(key, holder.to_string());
                Ok(InvocationClaim::Granted)
            }
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryStepLog {
    async fn try_acquire_lease(
        &self,
        saga_id: SagaId,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<Lease>> {
        let mut leases = self.leases.write().await;
        let now = Utc::now();

        if leases
            .get(&saga_id)
            .is_some_and(|existing| !existing.is_expired_at(now))
        {
            return Ok(None);
        }

        let lease = Lease {
            saga_id,
            owner: owner.to_string(),
            token: Uuid::new_v4(),
            expires_at: expiry_from(now, ttl),
        };
        leases.insert(saga_id, lease.clone());
        Ok(Some(lease))
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        let mut leases = self.leases.write().await;
        let now = Utc::now();

        match leases.get_mut(&lease.saga_id) {
            Some(current) if current.token == lease.token && !current.is_expired_at(now) => {
                current.expires_at = expiry_from(now, ttl);
                Ok(current.clone())
            }
            _ => Err(StepLogError::LeaseExpired(lease.saga_id)),
        }
    }

    async fn release_lease(&self, lease: &Lease) -> Result<()> {
        let mut leases = self.leases.write().await;
        if leases
            .get(&lease.saga_id)
            .is_some_and(|current| current.token == lease.token)
        {
            leases.remove(&lease.saga_id);
        }
        Ok(())
    }
}
