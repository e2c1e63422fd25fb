//! Saga error types.

use common::{Money, PartnerId, TransactionId};
use domain::{TransactionError, TransactionStatus};
use store::StoreError;
use thiserror::Error;

use crate::gateway::GatewayError;

/// Errors that can occur while driving or reconciling a transaction.
///
/// Business rejections (insufficient funds, provider decline) are not
/// errors; they are reported through [`crate::Disposition`].
#[derive(Debug, Error)]
pub enum SagaError {
    /// The request or a state transition was rejected by the domain rules.
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// The ledger or transaction store failed.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// The ledger is inconsistent; an operator has been alerted.
    #[error("Ledger integrity fault for transaction {tx_id}: {detail}")]
    IntegrityFault { tx_id: TransactionId, detail: String },

    /// The provider refused or could not serve a non-payment call.
    #[error("Provider error: {0}")]
    Provider(#[from] GatewayError),

    /// No transaction with this id is visible to the caller.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// No credit limit exists for the partner.
    #[error("Partner not found: {0}")]
    PartnerNotFound(PartnerId),

    /// A direct ledger reservation did not fit in the available limit.
    #[error("Insufficient credit for partner {partner_id}: {available} available")]
    InsufficientFunds {
        partner_id: PartnerId,
        available: Money,
    },

    /// The transaction is in a status that does not allow the operation.
    #[error("Cannot {action} transaction {tx_id} in {status} state")]
    StateConflict {
        tx_id: TransactionId,
        status: TransactionStatus,
        action: &'static str,
    },

    /// Another saga or reconciliation pass is acting on the transaction.
    #[error("Transaction {0} is already being processed")]
    AlreadyInFlight(TransactionId),

    /// The reservation could not be restored yet; the reconciler will retry.
    #[error("Compensation for transaction {0} is deferred to reconciliation")]
    CompensationDeferred(TransactionId),

    /// No escalation is pending for the transaction.
    #[error("No escalation pending for transaction {0}")]
    EscalationNotFound(TransactionId),

    /// The spawned saga task panicked or was aborted.
    #[error("Saga task failed: {0}")]
    TaskFailed(String),
}

impl SagaError {
    /// Returns true if the error signals corrupted ledger state.
    pub fn is_integrity_fault(&self) -> bool {
        match self {
            SagaError::IntegrityFault { .. } => true,
            SagaError::Store(e) => e.is_integrity_fault(),
            _ => false,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
