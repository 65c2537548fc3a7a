//! Shared types used across the saga coordinator crates.

pub mod types;

pub use types::SagaId;
