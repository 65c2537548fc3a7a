//! Saga and step state machines.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::StepLogError;

/// The status of a saga instance.
///
/// State transitions:
/// ```text
/// Running ──┬──► Committed
///           └──► Compensating ──┬──► Compensated
///                               └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaStatus {
    /// Forward steps are being executed.
    #[default]
    Running,

    /// Every step completed its forward action (terminal state).
    Committed,

    /// A forward step failed and compensations are in progress.
    Compensating,

    /// Every completed step was compensated (terminal state).
    Compensated,

    /// A compensation failed; operator action is required (terminal state).
    Failed,
}

impl SagaStatus {
    /// All statuses, in declaration order.
    pub const ALL: [SagaStatus; 5] = [
        SagaStatus::Running,
        SagaStatus::Committed,
        SagaStatus::Compensating,
        SagaStatus::Compensated,
        SagaStatus::Failed,
    ];

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Committed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }

    /// Returns true if the saga may move from `self` to `next`.
    ///
    /// Re-applying the current status is allowed so that replays of the
    /// same logical transition are no-ops.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (SagaStatus::Running, SagaStatus::Committed)
                | (SagaStatus::Running, SagaStatus::Compensating)
                | (SagaStatus::Compensating, SagaStatus::Compensated)
                | (SagaStatus::Compensating, SagaStatus::Failed)
        )
    }

    /// Statuses from which `self` may be reached, including itself.
    pub fn predecessors(&self) -> Vec<SagaStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(*self))
            .collect()
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Running => "Running",
            SagaStatus::Committed => "Committed",
            SagaStatus::Compensating => "Compensating",
            SagaStatus::Compensated => "Compensated",
            SagaStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SagaStatus {
    type Err = StepLogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| StepLogError::Corrupt(format!("unknown saga status '{s}'")))
    }
}

/// The state of a single step record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum StepState {
    /// The forward action has not completed.
    #[default]
    Pending,

    /// The forward action completed successfully.
    ForwardDone,

    /// The compensating action completed successfully.
    CompensateDone,

    /// The compensating action failed after all configured attempts.
    CompensateFailed,
}

impl StepState {
    const ALL: [StepState; 4] = [
        StepState::Pending,
        StepState::ForwardDone,
        StepState::CompensateDone,
        StepState::CompensateFailed,
    ];

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::Pending => "Pending",
            StepState::ForwardDone => "ForwardDone",
            StepState::CompensateDone => "CompensateDone",
            StepState::CompensateFailed => "CompensateFailed",
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StepState {
    type Err = StepLogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| StepLogError::Corrupt(format!("unknown step state '{s}'")))
    }
}

/// Which action of a step an invocation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Forward,
    Compensate,
}

impl Phase {
    /// Returns the phase name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Forward => "Forward",
            Phase::Compensate => "Compensate",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Phase {
    type Err = StepLogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Forward" => Ok(Phase::Forward),
            "Compensate" => Ok(Phase::Compensate),
            other => Err(StepLogError::Corrupt(format!("unknown phase '{other}'"))),
        }
    }
}
