//! Idempotency guard.
//!
//! Ensures an action's invoke function runs once per `(saga, step, phase)`
//! key. Callers in the same process are serialised by a per-key async
//! mutex. Across processes, a caller first reserves the key in the step log
//! and only the holder of that reservation invokes; everyone else gets the
//! recorded outcome or `InvocationInProgress`.
//!
//! A reservation is taken over only by a caller holding the saga's live
//! lease. If the previous holder died after its side effect but before the
//! outcome was recorded, the action runs again, so participants must
//! tolerate a repeated call after a crash.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use step_log::{
    InvocationClaim, InvocationKey, InvocationOutcome, InvocationRecord, InvocationStore, Lease,
};
use uuid::Uuid;

use crate::error::{Result, SagaError};

type KeyLock = Arc<tokio::sync::Mutex<()>>;

/// Deduplicates repeated invocations of the same step action.
pub struct IdempotencyGuard<S: ?Sized> {
    store: Arc<S>,
    in_flight: Arc<Mutex<HashMap<InvocationKey, KeyLock>>>,
    /// Reservation holder used when no lease is given.
    holder: Arc<str>,
}

impl<S: ?Sized> Clone for IdempotencyGuard<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            in_flight: Arc::clone(&self.in_flight),
            holder: Arc::clone(&self.holder),
        }
    }
}

impl<S: InvocationStore + ?Sized> IdempotencyGuard<S> {
    /// Creates a guard over the given invocation store.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            in_flight: Arc::default(),
            holder: format!("guard-{}", Uuid::new_v4()).into(),
        }
    }

    /// Returns the stored outcome for `key`, or reserves the key, runs
    /// `invoke` and stores its outcome.
    ///
    /// The reservation belongs to this guard and its clones. A key reserved
    /// by another guard and not yet completed fails with
    /// `InvocationInProgress`. If `invoke` itself returns an error, nothing
    /// is stored and the reservation is kept, so a later call through this
    /// guard may try again.
    pub async fn get_or_invoke<F, Fut>(
        &self,
        key: InvocationKey,
        invoke: F,
    ) -> Result<InvocationRecord>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<InvocationOutcome>>,
    {
        let holder = Arc::clone(&self.holder);
        self.guarded(key, &holder, false, invoke).await
    }

    /// Like [`get_or_invoke`](Self::get_or_invoke), but the reservation is
    /// held by `lease`.
    ///
    /// Reservations left by other holders are taken over: a caller with the
    /// saga's live lease is the only one allowed to drive it.
    pub async fn get_or_invoke_leased<F, Fut>(
        &self,
        key: InvocationKey,
        lease: &Lease,
        invoke: F,
    ) -> Result<InvocationRecord>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<InvocationOutcome>>,
    {
        let holder = format!("lease-{}", lease.token);
        self.guarded(key, &holder, true, invoke).await
    }

    #[tracing::instrument(skip(self, invoke), fields(key = %key))]
    async fn guarded<F, Fut>(
        &self,
        key: InvocationKey,
        holder: &str,
        takeover: bool,
        invoke: F,
    ) -> Result<InvocationRecord>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<InvocationOutcome>>,
    {
        if let Some(record) = self.store.get_invocation(key).await? {
            return Ok(replayed(record));
        }

        let lock = self.key_lock(key);
        let result = {
            let _held = lock.lock().await;
            self.invoke_once(key, holder, takeover, invoke).await
        };
        self.forget(key, &lock);
        result
    }

    async fn invoke_once<F, Fut>(
        &self,
        key: InvocationKey,
        holder: &str,
        takeover: bool,
        invoke: F,
    ) -> Result<InvocationRecord>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<InvocationOutcome>>,
    {
        // Also catches an outcome stored by a caller that held the lock before us.
        match self.store.claim_invocation(key, holder, takeover).await? {
            InvocationClaim::Completed(record) => return Ok(replayed(record)),
            InvocationClaim::HeldBy(current) => {
                metrics::counter!("idempotency_claim_conflicts_total").increment(1);
                tracing::debug!(holder = %current, "key reserved elsewhere");
                return Err(SagaError::InvocationInProgress {
                    key,
                    holder: current,
                });
            }
            InvocationClaim::Granted => {}
        }

        let outcome = invoke().await?;
        let stored = self
            .store
            .put_invocation(InvocationRecord::new(key, outcome.clone()))
            .await?;

        if stored.outcome != outcome {
            tracing::warn!("another worker stored an outcome first, discarding ours");
        }
        Ok(stored)
    }

    fn key_lock(&self, key: InvocationKey) -> KeyLock {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(in_flight.entry(key).or_default())
    }

    /// Drops the key's lock once no other caller is waiting on it.
    fn forget(&self, key: InvocationKey, lock: &KeyLock) {
        let mut in_flight = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one held by the caller.
        if Arc::strong_count(lock) <= 2 {
            in_flight.remove(&key);
        }
    }

    /// Number of keys currently being invoked in this process.
    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn replayed(record: InvocationRecord) -> InvocationRecord {
    metrics::counter!("idempotency_replays_total", "phase" => record.key.phase.as_str())
        .increment(1);
    tracing::debug!(key = %record.key, "returning stored outcome");
    record
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use step_log::{InMemoryStepLog, LeaseStore, SagaId};

    use super::*;

    fn succeeded(value: serde_json::Value) -> InvocationOutcome {
        InvocationOutcome::Succeeded { output: value }
    }

    #[tokio::test]
    async fn second_call_returns_stored_outcome() {
        let store = Arc::new(InMemoryStepLog::new());
        let guard = IdempotencyGuard::new(store.clone());
        let key = InvocationKey::forward(SagaId::new(), 0);
        let counter = AtomicUsize::new(0);

        let first = guard
            .get_or_invoke(key, || async {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(succeeded(serde_json::json!({ "count": n })))
            })
            .await
            .unwrap();
        let second = guard
            .get_or_invoke(key, || async {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(succeeded(serde_json::json!({ "count": n })))
            })
            .await
            .unwrap();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(second.outcome, first.outcome);
        assert_eq!(first.outcome, succeeded(serde_json::json!({ "count": 1 })));
        assert_eq!(guard.in_flight(), 0);
    }

    #[tokio::test]
    async fn failures_are_stored_too() {
        let store = Arc::new(InMemoryStepLog::new());
        let guard = IdempotencyGuard::new(store.clone());
        let key = InvocationKey::compensate(SagaId::new(), 1);

        guard
            .get_or_invoke(key, || async {
                Ok(InvocationOutcome::Failed {
                    reason: "declined".into(),
                })
            })
            .await
            .unwrap();

        let replay = guard
            .get_or_invoke(key, || async { Ok(succeeded(serde_json::Value::Null)) })
            .await
            .unwrap();
        assert!(!replay.outcome.is_success());
        assert_eq!(store.invocation_count().await, 1);
    }

    #[tokio::test]
    async fn errors_are_not_stored() {
        let store = Arc::new(InMemoryStepLog::new());
        let guard = IdempotencyGuard::new(store.clone());
        let key = InvocationKey::forward(SagaId::new(), 0);

        let result = guard
            .get_or_invoke(key, || async {
                Err(crate::SagaError::LeaseExpired(key.saga_id))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.invocation_count().await, 0);

        let retried = guard
            .get_or_invoke(key, || async { Ok(succeeded(serde_json::Value::Null)) })
            .await
            .unwrap();
        assert!(retried.outcome.is_success());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_invoke_once() {
        let store = Arc::new(InMemoryStepLog::new());
        let guard = IdempotencyGuard::new(store);
        let key = InvocationKey::forward(SagaId::new(), 0);
        let counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let guard = guard.clone();
            let counter = counter.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .get_or_invoke(key, || async {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(succeeded(serde_json::json!("debited")))
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            let record = handle.await.unwrap();
            assert_eq!(record.outcome, succeeded(serde_json::json!("debited")));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(guard.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn separate_guards_on_one_store_invoke_once() {
        let store = Arc::new(InMemoryStepLog::new());
        let key = InvocationKey::forward(SagaId::new(), 0);
        let counter = Arc::new(AtomicUsize::new(0));
        let a = IdempotencyGuard::new(store.clone());
        let b = IdempotencyGuard::new(store.clone());

        let call = |guard: IdempotencyGuard<InMemoryStepLog>, delay: u64| {
            let counter = counter.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                guard
                    .get_or_invoke(key, || async {
                        counter.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(succeeded(serde_json::json!("debited")))
                    })
                    .await
            })
        };
        let (first, second) = tokio::join!(call(a, 0), call(b.clone(), 20));

        assert!(first.unwrap().unwrap().outcome.is_success());
        assert!(matches!(
            second.unwrap(),
            Err(SagaError::InvocationInProgress { key: k, .. }) if k == key
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Once the outcome is recorded the other guard replays it.
        let replay = b
            .get_or_invoke(key, || async { Ok(succeeded(serde_json::Value::Null)) })
            .await
            .unwrap();
        assert_eq!(replay.outcome, succeeded(serde_json::json!("debited")));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn leased_caller_takes_over_an_abandoned_reservation() {
        let store = Arc::new(InMemoryStepLog::new());
        let key = InvocationKey::forward(SagaId::new(), 1);
        let dead = IdempotencyGuard::new(store.clone());

        // The first holder reserves the key and dies before recording anything.
        let result = dead
            .get_or_invoke(key, || async {
                Err(SagaError::Task("worker died".into()))
            })
            .await;
        assert!(result.is_err());

        let other = IdempotencyGuard::new(store.clone());
        let blocked = other
            .get_or_invoke(key, || async { Ok(succeeded(serde_json::json!(2))) })
            .await;
        assert!(matches!(blocked, Err(SagaError::InvocationInProgress { .. })));

        let lease = store
            .try_acquire_lease(key.saga_id, "recovery", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        let record = other
            .get_or_invoke_leased(key, &lease, || async { Ok(succeeded(serde_json::json!(3))) })
            .await
            .unwrap();
        assert_eq!(record.outcome, succeeded(serde_json::json!(3)));
        assert_eq!(
            store.claim_holder(key).await,
            Some(format!("lease-{}", lease.token))
        );
    }

    #[tokio::test]
    async fn separate_guards_share_the_durable_outcome() {
        let store = Arc::new(InMemoryStepLog::new());
        let key = InvocationKey::forward(SagaId::new(), 2);

        let first = IdempotencyGuard::new(store.clone())
            .get_or_invoke(key, || async { Ok(succeeded(serde_json::json!(1))) })
            .await
            .unwrap();
        let second = IdempotencyGuard::new(store.clone())
            .get_or_invoke(key, || async { Ok(succeeded(serde_json::json!(2))) })
            .await
            .unwrap();

        assert_eq!(second.outcome, first.outcome);
    }
}
