//! Domain error types.

use thiserror::Error;

use crate::transaction::TransactionError;

/// Errors that can occur during domain operations.
#[derive(Debug, Error)]
pub enum DomainError {
    /// An error occurred in the transaction entity.
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// A credit limit violates its balance invariant.
    #[error("Credit limit for partner {partner_id} is unbalanced: used {used} + available {available} != total {total}")]
    UnbalancedLimit {
        partner_id: String,
        total: i64,
        used: i64,
        available: i64,
    },
}
