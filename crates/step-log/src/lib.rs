//! Durable storage for saga coordination.
//!
//! The step log is the only source of truth a coordinator consults after a
//! crash. It stores saga instances with their ordered step records, the
//! outcomes recorded by the idempotency guard, and recovery leases.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod record;
pub mod status;
pub mod store;

pub use common::SagaId;
pub use error::{Result, StepLogError};
pub use memory::InMemoryStepLog;
pub use postgres::PostgresStepLog;
pub use query::SagaQuery;
pub use record::{
    InvocationClaim, InvocationKey, InvocationOutcome, InvocationRecord, Lease, SagaInstance,
    StepDefinition, StepFailure, StepRecord,
};
pub use status::{Phase, SagaStatus, StepState};
pub use store::{InvocationStore, LeaseStore, SagaStore, StepLog};
