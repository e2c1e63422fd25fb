//! Transaction entity.

use chrono::{DateTime, Utc};
use common::{Money, PartnerId, TenantId, TransactionId};
use serde::{Deserialize, Serialize};

use super::{CreateTransaction, Fees, TransactionError, TransactionStatus};

/// Why a transaction is waiting for the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintKind {
    /// The provider call ended without a definite answer (timeout, transport error).
    AwaitingConfirmation,
    /// The reservation still has to be restored: a declined `Reserved`
    /// payment, or a `Success` one the provider has cancelled.
    AwaitingCompensation,
    /// A void was started on a `Success` transaction and the provider
    /// cancel may already have been sent.
    VoidRequested,
}

impl HintKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            HintKind::AwaitingConfirmation => "awaiting_confirmation",
            HintKind::AwaitingCompensation => "awaiting_compensation",
            HintKind::VoidRequested => "void_requested",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "awaiting_confirmation" => Some(HintKind::AwaitingConfirmation),
            "awaiting_compensation" => Some(HintKind::AwaitingCompensation),
            "void_requested" => Some(HintKind::VoidRequested),
            _ => None,
        }
    }
}

impl std::fmt::Display for HintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Marker left on a non-terminal or voiding transaction for the reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileHint {
    pub kind: HintKind,
    pub detail: String,
    pub since: DateTime<Utc>,
}

/// A PPOB transaction as persisted by the transaction store.
///
/// Status changes go through the `mark_*` methods, which enforce the
/// forward-only transitions of [`TransactionStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub tenant_id: TenantId,
    pub partner_id: PartnerId,
    pub product_code: String,
    pub customer_no: String,
    pub amount: Money,
    pub fee: Money,
    pub total: Money,
    pub status: TransactionStatus,
    /// Name of the provider gateway that handles the payment.
    pub provider: String,
    pub provider_tx_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub failure_reason: Option<String>,
    pub hint: Option<ReconcileHint>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    /// Builds the initial `Pending` row for a validated request.
    pub fn pending(
        request: &CreateTransaction,
        fees: Fees,
        provider: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            tenant_id: request.tenant_id.clone(),
            partner_id: request.partner_id.clone(),
            product_code: request.product_code.clone(),
            customer_no: request.customer_no.clone(),
            amount: fees.amount,
            fee: fees.fee,
            total: fees.total,
            status: TransactionStatus::Pending,
            provider: provider.into(),
            provider_tx_id: None,
            idempotency_key: request.idempotency_key().map(str::to_string),
            failure_reason: None,
            hint: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if the saga has finished with this transaction.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns the reconciliation hint kind, if any.
    pub fn hint_kind(&self) -> Option<HintKind> {
        self.hint.as_ref().map(|h| h.kind)
    }

    /// Records that the credit reservation succeeded.
    pub fn mark_reserved(&mut self, now: DateTime<Utc>) -> Result<(), TransactionError> {
        self.guard(self.status.can_reserve(), "mark reserved")?;
        self.status = TransactionStatus::Reserved;
        self.updated_at = now;
        Ok(())
    }

    /// Records provider confirmation of the payment.
    pub fn mark_settled(
        &mut self,
        provider_tx_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransactionError> {
        self.guard(self.status.can_settle(), "settle")?;
        self.status = TransactionStatus::Success;
        self.provider_tx_id = Some(provider_tx_id.into());
        self.failure_reason = None;
        self.hint = None;
        self.updated_at = now;
        Ok(())
    }

    /// Terminates the transaction as failed.
    ///
    /// From `Reserved` the caller must already have restored the reservation.
    pub fn mark_failed(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransactionError> {
        self.guard(self.status.can_fail(), "fail")?;
        self.status = TransactionStatus::Failed;
        self.failure_reason = Some(reason.into());
        self.hint = None;
        self.updated_at = now;
        Ok(())
    }

    /// Cancels a pending transaction, or voids a settled one whose
    /// reservation has been restored.
    pub fn mark_cancelled(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransactionError> {
        self.guard(self.status.can_cancel(), "cancel")?;
        self.status = TransactionStatus::Cancelled;
        self.failure_reason = Some(reason.into());
        self.hint = None;
        self.updated_at = now;
        Ok(())
    }

    /// Leaves the transaction `Reserved` with an unknown provider outcome.
    pub fn mark_awaiting_confirmation(
        &mut self,
        cause: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransactionError> {
        let allowed = self.status == TransactionStatus::Reserved;
        self.set_hint(
            allowed,
            HintKind::AwaitingConfirmation,
            cause.into(),
            now,
            "await confirmation",
        )
    }

    /// Records a reservation that still has to be restored. Applies to a
    /// declined `Reserved` payment and to a cancelled `Success` one.
    pub fn mark_awaiting_compensation(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), TransactionError> {
        let reason = reason.into();
        let allowed = matches!(
            self.status,
            TransactionStatus::Reserved | TransactionStatus::Success
        );
        self.set_hint(
            allowed,
            HintKind::AwaitingCompensation,
            reason.clone(),
            now,
            "await compensation",
        )?;
        self.failure_reason = Some(reason);
        Ok(())
    }

    /// Records that a void of this settled transaction has started.
    pub fn mark_void_requested(&mut self, now: DateTime<Utc>) -> Result<(), TransactionError> {
        let allowed = self.status == TransactionStatus::Success;
        self.set_hint(
            allowed,
            HintKind::VoidRequested,
            "provider cancel sent".to_string(),
            now,
            "void",
        )
    }

    /// Drops the reconciliation hint, e.g. after the provider refused a void.
    pub fn clear_hint(&mut self, now: DateTime<Utc>) {
        if self.hint.take().is_some() {
            self.updated_at = now;
        }
    }

    fn set_hint(
        &mut self,
        allowed: bool,
        kind: HintKind,
        detail: String,
        now: DateTime<Utc>,
        action: &'static str,
    ) -> Result<(), TransactionError> {
        self.guard(allowed, action)?;
        self.hint = Some(ReconcileHint {
            kind,
            detail,
            since: now,
        });
        self.updated_at = now;
        Ok(())
    }

    fn guard(&self, allowed: bool, action: &'static str) -> Result<(), TransactionError> {
        if allowed {
            Ok(())
        } else {
            Err(TransactionError::InvalidStateTransition {
                current: self.status,
                action,
            })
        }
    }
}
