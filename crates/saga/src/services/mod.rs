//! In-memory participants for the payment saga.

pub mod account;
pub mod inventory;
pub mod order;

pub use account::InMemoryAccountService;
pub use inventory::InMemoryInventoryService;
pub use order::{InMemoryOrderService, OrderPaymentState};
