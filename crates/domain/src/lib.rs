//! Domain layer for the PPOB credit saga.
//!
//! This crate provides the core domain types including:
//! - `Transaction` entity with its forward-only status state machine
//! - `FeeSchedule` for computing fee and total from a requested amount
//! - `CreditLimit` / `LimitView` describing a partner's spending limit
//!
//! Nothing here performs I/O; persistence and orchestration live in the
//! `store` and `saga` crates.

pub mod credit;
pub mod error;
pub mod transaction;

pub use credit::{CreditLimit, LimitView};
pub use error::DomainError;
pub use transaction::{
    CreateTransaction, FeeSchedule, Fees, HintKind, ReconcileHint, Transaction, TransactionError,
    TransactionStatus,
};
