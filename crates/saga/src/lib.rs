//! Saga transaction coordination.
//!
//! This crate runs multi-step transactions in which every step pairs a
//! forward action with a compensating action:
//! - steps run strictly in order,
//! - when a step fails, completed steps are compensated in reverse order,
//! - progress lives in a durable step log, so a crashed run is resumed by
//!   the recovery scanner,
//! - an idempotency guard makes sure no action runs its side effect twice.
//!
//! The payment saga (mark order paid, debit account, decrement inventory)
//! is provided as a working example.

pub mod coordinator;
pub mod error;
pub mod executor;
pub mod guard;
pub mod payment;
pub mod recovery;
pub mod registry;
pub mod services;

pub use coordinator::{SagaCoordinator, SagaSummary, StepSummary};
pub use error::{ActionFailure, FailureKind, Result, SagaError};
pub use executor::{ExecutorConfig, SagaExecutor, SagaOutcome};
pub use guard::IdempotencyGuard;
pub use payment::{PaymentOrder, payment_steps, register_payment_actions};
pub use recovery::{RecoveryConfig, RecoveryReport, RecoveryScanner};
pub use registry::{ActionRegistry, ActionResult, SagaAction};
pub use services::{
    InMemoryAccountService, InMemoryInventoryService, InMemoryOrderService, OrderPaymentState,
};
