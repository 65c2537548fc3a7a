//! Saga error types.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use step_log::{InvocationKey, SagaId, StepLogError, StepState};
use thiserror::Error;

/// Why a participant action did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    /// The participant answered with a business failure.
    Rejected,
    /// The participant did not answer within the action timeout.
    TimedOut,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Rejected => "rejected",
            FailureKind::TimedOut => "timed out",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed failure returned by a forward or compensating action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ActionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ActionFailure {
    /// A business failure reported by the participant.
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Rejected,
            message: message.into(),
        }
    }

    /// No answer within `after`.
    pub fn timed_out(after: Duration) -> Self {
        Self {
            kind: FailureKind::TimedOut,
            message: format!("no response within {}ms", after.as_millis()),
        }
    }
}

/// Errors that can occur while coordinating sagas.
///
/// Action failures never appear here: they are recorded in the step log and
/// drive the saga toward compensation instead.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A step names an action that is not registered.
    #[error("Unknown action: {0}")]
    UnknownAction(String),

    /// A step record changed underneath the executor.
    #[error(
        "Concurrent modification of saga {saga_id} step {sequence_no}: expected {expected}, found {actual}"
    )]
    ConcurrentModification {
        saga_id: SagaId,
        sequence_no: u32,
        expected: StepState,
        actual: StepState,
    },

    /// The recovery lease was lost while driving the saga.
    #[error("Lease expired for saga {0}")]
    LeaseExpired(SagaId),

    /// Another holder reserved the invocation and has not recorded its outcome.
    #[error("Invocation {key} is in progress under {holder}")]
    InvocationInProgress { key: InvocationKey, holder: String },
    /// Saga not found.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// A saga was submitted without steps.
    #[error("A saga needs at least one step")]
    EmptySaga,

    /// The saga did not reach a terminal status in time.
    #[error("Saga {saga_id} not finished after {}ms", waited.as_millis())]
    AwaitTimeout { saga_id: SagaId, waited: Duration },

    /// Step log error.
    #[error("Step log error: {0}")]
    StepLog(StepLogError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A background saga task died before finishing.
    #[error("Saga task failed: {0}")]
    Task(String),
}

impl SagaError {
    /// Returns true if reloading the saga and driving it again may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SagaError::ConcurrentModification { .. }
                | SagaError::LeaseExpired(_)
                | SagaError::InvocationInProgress { .. }
        )
    }
}

impl From<StepLogError> for SagaError {
    fn from(err: StepLogError) -> Self {
        match err {
            StepLogError::ConcurrentModification {
                saga_id,
                sequence_no,
                expected,
                actual,
            } => SagaError::ConcurrentModification {
                saga_id,
                sequence_no,
                expected,
                actual,
            },
            StepLogError::LeaseExpired(saga_id) => SagaError::LeaseExpired(saga_id),
            StepLogError::SagaNotFound(saga_id) => SagaError::SagaNotFound(saga_id),
            other => SagaError::StepLog(other),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
