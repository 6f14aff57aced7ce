//! Shared-expense ledger: turns a group's expenses into the transfers that
//! settle it, and keeps track of which of those transfers have been paid.

pub mod balance;
pub mod config;
pub mod error;
pub mod exchange;
pub mod memory;
pub mod mongo;
pub mod repository;
pub mod routes;
pub mod schemas;
pub mod store;
pub mod telemetry;

pub use balance::{compute_balances, split_equally, Balances};
pub use error::{ConsistencyReason, LedgerError, LedgerResult};
pub use exchange::{reduce_to_settlements, Exchange};
pub use store::SettlementStore;
