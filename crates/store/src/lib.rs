//! Persistence for the PPOB credit saga.
//!
//! Two seams are defined here:
//! - [`CreditLedger`]: the system of record for partner spending limits,
//!   with partner-scoped serialized `reserve`/`restore`
//! - [`TransactionStore`]: transaction rows, with the idempotency mapping
//!   enforced by the same insert that creates the row
//!
//! Each has an in-memory implementation for tests and local development and
//! a PostgreSQL implementation backed by `sqlx`.

pub mod error;
pub mod ledger;
pub mod memory;
pub mod postgres;
pub mod query;
pub mod transactions;

pub use error::{Result, StoreError};
pub use ledger::{CreditLedger, ReservationEntry, ReservationState, ReserveOutcome, RestoreOutcome};
pub use memory::{InMemoryCreditLedger, InMemoryTransactionStore};
pub use postgres::{PostgresCreditLedger, PostgresTransactionStore, run_migrations};
pub use query::TransactionQuery;
pub use transactions::{InsertOutcome, TransactionStore, TransactionStoreExt};
