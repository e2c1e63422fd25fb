use common::{Money, PartnerId, TransactionId};
use domain::{DomainError, TransactionError, TransactionStatus};
use thiserror::Error;

/// Errors that can occur when interacting with the ledger or transaction store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A credit limit already exists for this partner.
    #[error("Credit limit already exists for partner {0}")]
    PartnerExists(PartnerId),

    /// Reserve was replayed for a transaction whose reservation was already restored.
    #[error("Reservation for transaction {0} was already restored")]
    ReservationClosed(TransactionId),

    /// Reserve or restore disagrees with the recorded reservation.
    #[error(
        "Reservation mismatch for transaction {tx_id}: recorded {recorded_amount} on partner {recorded_partner}, requested {requested_amount} on partner {requested_partner}"
    )]
    ReservationMismatch {
        tx_id: TransactionId,
        recorded_partner: PartnerId,
        recorded_amount: Money,
        requested_partner: PartnerId,
        requested_amount: Money,
    },

    /// Another actor moved the transaction before this update.
    #[error("Status conflict for transaction {tx_id}: expected {expected}, found {actual}")]
    StatusConflict {
        tx_id: TransactionId,
        expected: TransactionStatus,
        actual: TransactionStatus,
    },

    /// The transaction row does not exist.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// A new row collided with an existing transaction id.
    #[error("Duplicate transaction id: {0}")]
    DuplicateTransaction(TransactionId),

    /// The backing store could not be reached or refused the operation.
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// A ledger invariant was found violated.
    #[error("Ledger invariant violated: {0}")]
    Invariant(#[from] DomainError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    /// Returns true for faults that indicate corrupted ledger state and
    /// require an operator rather than a retry.
    pub fn is_integrity_fault(&self) -> bool {
        matches!(
            self,
            StoreError::ReservationMismatch { .. }
                | StoreError::Invariant(_)
                | StoreError::Corrupt(_)
        )
    }
}

impl From<TransactionError> for StoreError {
    fn from(e: TransactionError) -> Self {
        StoreError::Corrupt(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
