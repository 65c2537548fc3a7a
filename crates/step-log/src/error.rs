use thiserror::Error;

use crate::{SagaId, SagaStatus, StepState};

/// Errors that can occur when interacting with the step log.
#[derive(Debug, Error)]
pub enum StepLogError {
    /// The optimistic state check lost a race: the step was not in the
    /// expected prior state. Callers must reload and retry.
    #[error(
        "Concurrent modification of step {sequence_no} in saga {saga_id}: expected {expected}, found {actual}"
    )]
    ConcurrentModification {
        saga_id: SagaId,
        sequence_no: u32,
        expected: StepState,
        actual: StepState,
    },

    /// The requested step transition would break step ordering.
    #[error("Invalid transition for step {sequence_no} in saga {saga_id}: {reason}")]
    InvalidStepTransition {
        saga_id: SagaId,
        sequence_no: u32,
        reason: String,
    },

    /// The requested saga status transition is not allowed.
    #[error("Invalid status transition for saga {saga_id}: {from} -> {to}")]
    InvalidStatusTransition {
        saga_id: SagaId,
        from: SagaStatus,
        to: SagaStatus,
    },

    /// The submitted steps do not form a valid saga.
    #[error("Invalid saga: {0}")]
    InvalidSaga(String),

    /// The saga was not found in the step log.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// The step was not found in the saga.
    #[error("Step {sequence_no} not found in saga {saga_id}")]
    StepNotFound { saga_id: SagaId, sequence_no: u32 },

    /// The lease is no longer owned by the presented token.
    #[error("Lease expired for saga {0}")]
    LeaseExpired(SagaId),

    /// A stored record could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for step log operations.
pub type Result<T> = std::result::Result<T, StepLogError>;
