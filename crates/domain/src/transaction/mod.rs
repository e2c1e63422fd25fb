//! Transaction entity and related types.

mod commands;
mod entity;
mod fee;
mod state;

pub use commands::CreateTransaction;
pub use entity::{HintKind, ReconcileHint, Transaction};
pub use fee::{FeeSchedule, Fees};
pub use state::TransactionStatus;

use common::Money;
use thiserror::Error;

/// Errors that can occur during transaction operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    /// The transaction is not in a state that allows the requested action.
    #[error("Invalid state transition: cannot {action} from {current} state")]
    InvalidStateTransition {
        current: TransactionStatus,
        action: &'static str,
    },

    /// Amount must be strictly positive.
    #[error("Invalid amount: {amount} (must be greater than 0)")]
    InvalidAmount { amount: Money },

    /// A required request field is missing or blank.
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// Fee or total does not fit in the money representation.
    #[error("Amount {amount} overflows when the fee is added")]
    AmountOverflow { amount: Money },

    /// Fee divisor must be strictly positive.
    #[error("Invalid fee divisor: {0} (must be greater than 0)")]
    InvalidFeeDivisor(i64),

    /// A stored status string could not be parsed.
    #[error("Unknown transaction status: {0}")]
    UnknownStatus(String),
}
