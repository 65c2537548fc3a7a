//! Recovery scanner.
//!
//! Finds sagas left in a non-terminal status, claims each one with a lease
//! and drives it to completion. Several scanners may run against the same
//! step log: the lease makes sure only one of them drives a given saga at a
//! time.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use serde::Serialize;
use step_log::{LeaseStore, SagaId, SagaStore, StepLog};
use tokio::sync::watch;

use crate::error::{Result, SagaError};
use crate::executor::{SagaExecutor, SagaOutcome};

/// Recovery scanner settings.
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Lease owner name of this worker.
    pub worker_id: String,

    /// How long a claim lasts without renewal.
    pub lease_ttl: Duration,

    /// Pause between two scans in [`RecoveryScanner::run`].
    pub scan_interval: Duration,

    /// Upper bound on sagas recovered at once.
    pub max_concurrent_sagas: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            lease_ttl: Duration::from_secs(30),
            scan_interval: Duration::from_secs(10),
            max_concurrent_sagas: 16,
        }
    }
}

impl RecoveryConfig {
    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    pub fn with_max_concurrent_sagas(mut self, max: usize) -> Self {
        self.max_concurrent_sagas = max.max(1);
        self
    }
}

/// Counts from one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Non-terminal sagas found.
    pub scanned: usize,
    /// Sagas this worker drove to a terminal status.
    pub resumed: usize,
    /// Sagas leased by another worker.
    pub skipped: usize,
    /// Sagas whose run ended with an error; they stay for a later scan.
    pub errors: usize,
}

enum Recovery {
    Resumed(SagaOutcome),
    Skipped,
}

/// Background process that resumes interrupted sagas.
pub struct RecoveryScanner<S: ?Sized> {
    executor: SagaExecutor<S>,
    config: RecoveryConfig,
}

impl<S: SagaStore + ?Sized> RecoveryScanner<S> {
    /// Creates a scanner driving sagas with `executor`.
    pub fn new(executor: SagaExecutor<S>, config: RecoveryConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Scans once and recovers every non-terminal saga it can claim.
    #[tracing::instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn scan_once(&self) -> Result<RecoveryReport> {
        let sagas = self.executor.store().scan_non_terminal().await?;
        let scanned = sagas.len();

        let resumed = AtomicUsize::new(0);
        let skipped = AtomicUsize::new(0);
        let errors = AtomicUsize::new(0);
        let counters = (&resumed, &skipped, &errors);

        futures_util::stream::iter(sagas)
            .for_each_concurrent(self.config.max_concurrent_sagas, |saga| {
                let (resumed, skipped, errors) = counters;
                async move {
                    match self.recover(saga.id).await {
                        Ok(Recovery::Resumed(outcome)) => {
                            metrics::counter!("recovery_sagas_resumed").increment(1);
                            tracing::info!(saga_id = %outcome.saga_id, status = %outcome.status, "saga recovered");
                            resumed.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Recovery::Skipped) => {
                            skipped.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            if err.is_retryable() {
                                tracing::warn!(saga_id = %saga.id, error = %err, "recovery interrupted");
                            } else {
                                tracing::error!(saga_id = %saga.id, error = %err, "recovery failed");
                            }
                            errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
            .await;

        let report = RecoveryReport {
            scanned,
            resumed: resumed.into_inner(),
            skipped: skipped.into_inner(),
            errors: errors.into_inner(),
        };
        if report.scanned > 0 {
            tracing::info!(?report, "recovery scan finished");
        }
        Ok(report)
    }

    async fn recover(&self, saga_id: SagaId) -> Result<Recovery> {
        let store = self.executor.store();
        let Some(lease) = store
            .try_acquire_lease(saga_id, &self.config.worker_id, self.config.lease_ttl)
            .await?
        else {
            tracing::debug!(%saga_id, "saga leased elsewhere, skipping");
            return Ok(Recovery::Skipped);
        };

        let result = self.executor.run_leased(saga_id, &lease).await;

        if let Err(err) = store.release_lease(&lease).await {
            tracing::warn!(%saga_id, error = %err, "failed to release lease");
        }

        match result {
            // Another worker took over after our lease ran out.
            Err(SagaError::LeaseExpired(_)) => Ok(Recovery::Skipped),
            other => other.map(Recovery::Resumed),
        }
    }

    /// Scans immediately, then every `scan_interval`, until `shutdown`
    /// turns true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            worker_id = %self.config.worker_id,
            interval_ms = self.config.scan_interval.as_millis() as u64,
            "recovery scanner started"
        );
        let mut interval = tokio::time::interval(self.config.scan_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.scan_once().await {
                        tracing::error!(error = %err, "recovery scan failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!(worker_id = %self.config.worker_id, "recovery scanner stopped");
    }
}

impl<S: SagaStore + ?Sized + 'static> RecoveryScanner<S> {
    /// Runs the scanner on a background task.
    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
