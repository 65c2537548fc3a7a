use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Phase, Result, SagaId, SagaStatus, StepLogError, StepState};

/// A step as submitted by a caller: the registered action to run and its
/// opaque input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Key into the action registry.
    pub action_name: String,

    /// Input handed to both the forward and the compensating action.
    pub payload: serde_json::Value,
}

impl StepDefinition {
    /// Creates a step definition.
    pub fn new(action_name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            action_name: action_name.into(),
            payload,
        }
    }
}

/// Durable record of one step of a saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// The saga that owns this step.
    pub saga_id: SagaId,

    /// Position within the saga. Defines forward and reverse order.
    pub sequence_no: u32,

    /// Key into the action registry.
    pub action_name: String,

    /// Opaque input to the forward and compensating actions.
    pub payload: serde_json::Value,

    /// Current state of the step.
    pub state: StepState,

    /// Number of times an action was actually invoked for this step.
    pub attempt: u32,

    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

/// Identifies the step (and phase) that made a saga leave the happy path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub sequence_no: u32,
    pub action_name: String,
    pub phase: Phase,
    pub reason: String,
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of step {} ({}) failed: {}",
            self.phase, self.sequence_no, self.action_name, self.reason
        )
    }
}

/// A saga instance together with its ordered step records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    /// Unique, immutable saga ID.
    pub id: SagaId,

    /// Current lifecycle status.
    pub status: SagaStatus,

    /// Steps ordered by `sequence_no`.
    pub steps: Vec<StepRecord>,

    /// The failing step, once the saga has left the forward path.
    pub failure: Option<StepFailure>,

    /// When the saga was created.
    pub created_at: DateTime<Utc>,

    /// When the saga or one of its steps last changed.
    pub updated_at: DateTime<Utc>,
}

impl SagaInstance {
    /// Creates a running saga with all steps pending.
    pub fn new(id: SagaId, steps: Vec<StepDefinition>) -> Self {
        let now = Utc::now();
        let steps = steps
            .into_iter()
            .enumerate()
            .map(|(index, def)| StepRecord {
                saga_id: id,
                sequence_no: index as u32,
                action_name: def.action_name,
                payload: def.payload,
                state: StepState::Pending,
                attempt: 0,
                updated_at: now,
            })
            .collect();

        Self {
            id,
            status: SagaStatus::Running,
            steps,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the step with the given sequence number.
    pub fn step(&self, sequence_no: u32) -> Option<&StepRecord> {
        self.steps.iter().find(|s| s.sequence_no == sequence_no)
    }

    /// Returns the number of steps in the saga.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Returns the sequence numbers of steps in the given state, ascending.
    pub fn steps_in_state(&self, state: StepState) -> Vec<u32> {
        self.steps
            .iter()
            .filter(|s| s.state == state)
            .map(|s| s.sequence_no)
            .collect()
    }

    /// Checks that `sequence_no` may move from `expected` to `new`.
    ///
    /// Enforces the optimistic prior-state check and the rule that a step
    /// may only reach `ForwardDone` once every earlier step has.
    pub fn check_step_transition(
        &self,
        sequence_no: u32,
        expected: StepState,
        new: StepState,
    ) -> Result<()> {
        let step = self.step(sequence_no).ok_or(StepLogError::StepNotFound {
            saga_id: self.id,
            sequence_no,
        })?;

        if step.state != expected {
            return Err(StepLogError::ConcurrentModification {
                saga_id: self.id,
                sequence_no,
                expected,
                actual: step.state,
            });
        }

        if new == StepState::ForwardDone
            && let Some(blocking) = self
                .steps
                .iter()
                .find(|s| s.sequence_no < sequence_no && s.state != StepState::ForwardDone)
        {
            return Err(StepLogError::InvalidStepTransition {
                saga_id: self.id,
                sequence_no,
                reason: format!(
                    "step {} is {}, not ForwardDone",
                    blocking.sequence_no, blocking.state
                ),
            });
        }

        Ok(())
    }
}

/// Identity of one guarded action invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvocationKey {
    pub saga_id: SagaId,
    pub sequence_no: u32,
    pub phase: Phase,
}

impl InvocationKey {
    /// Key for the forward action of a step.
    pub fn forward(saga_id: SagaId, sequence_no: u32) -> Self {
        Self {
            saga_id,
            sequence_no,
            phase: Phase::Forward,
        }
    }

    /// Key for the compensating action of a step.
    pub fn compensate(saga_id: SagaId, sequence_no: u32) -> Self {
        Self {
            saga_id,
            sequence_no,
            phase: Phase::Compensate,
        }
    }
}

impl std::fmt::Display for InvocationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.saga_id, self.sequence_no, self.phase)
    }
}

/// The stored result of an action invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum InvocationOutcome {
    /// The action succeeded with the given output.
    Succeeded { output: serde_json::Value },

    /// The action failed (explicitly or by timing out).
    Failed { reason: String },
}

impl InvocationOutcome {
    /// Returns true if the action succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, InvocationOutcome::Succeeded { .. })
    }
}

/// Write-once record of an invocation outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub key: InvocationKey,
    pub outcome: InvocationOutcome,
    pub completed_at: DateTime<Utc>,
}

impl InvocationRecord {
    /// Creates a record completed now.
    pub fn new(key: InvocationKey, outcome: InvocationOutcome) -> Self {
        Self {
            key,
            outcome,
            completed_at: Utc::now(),
        }
    }
}

/// Result of reserving an invocation key before its action runs.
#[derive(Debug, Clone, PartialEq)]
pub enum InvocationClaim {
    /// The caller holds the key and may invoke the action.
    Granted,
    /// Another holder reserved the key and has not recorded an outcome.
    HeldBy(String),
    /// An outcome is already recorded for the key.
    Completed(InvocationRecord),
}

/// A time-bounded ownership claim on a saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub saga_id: SagaId,

    /// Identifier of the worker holding the lease.
    pub owner: String,

    /// Changes on every fresh acquisition so a stale holder can be detected.
    pub token: Uuid,

    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Returns true if the lease has expired at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Converts a TTL into an absolute expiry.
pub(crate) fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
