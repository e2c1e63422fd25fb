//! The credit reservation saga.
//!
//! `Pending → Reserved → Success | Failed`, or `Pending → Failed` when no
//! reservation was obtained. The ledger reservation is compensated by a
//! restore on every non-success outcome except an ambiguous payment, which
//! is left `Reserved` for the reconciler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::{Money, PartnerId, TenantId, TransactionId};
use domain::{
    CreateTransaction, FeeSchedule, HintKind, LimitView, Transaction, TransactionError,
    TransactionStatus,
};
use store::{CreditLedger, ReserveOutcome, RestoreOutcome, TransactionStore};
use tokio::sync::watch;
use tracing::Instrument;

use crate::error::{Result, SagaError};
use crate::gateway::{
    GatewayError, InquiryResult, PayOutcome, PayRequest, ProviderGateway, pay_within,
};
use crate::idempotency::{Admission, IdempotencyStore};
use crate::inflight::InFlight;
use crate::operator::{Escalation, OperatorQueue};

pub(crate) const VOID_REASON: &str = "voided";

/// Deadline applied to every provider `pay` call unless configured.
pub const DEFAULT_PROVIDER_DEADLINE: Duration = Duration::from_secs(5);

/// Tunables of the saga.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub fee_schedule: FeeSchedule,
    pub provider_deadline: Duration,
    /// Extra attempts for an ambiguous payment. Only used when the provider
    /// advertises idempotent pay.
    pub pay_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fee_schedule: FeeSchedule::default(),
            provider_deadline: DEFAULT_PROVIDER_DEADLINE,
            pay_retries: 0,
        }
    }
}

/// Business reason a transaction was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    InsufficientFunds { available: Money },
    PartnerNotFound,
    ProviderDeclined { reason: String },
}

impl Rejection {
    /// Text stored as the transaction's failure reason.
    pub fn reason(&self) -> String {
        match self {
            Rejection::InsufficientFunds { available } => {
                format!("insufficient funds: {available} available")
            }
            Rejection::PartnerNotFound => "partner not found".to_string(),
            Rejection::ProviderDeclined { reason } => format!("provider declined: {reason}"),
        }
    }
}

/// How a `create_transaction` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The provider confirmed the payment.
    Settled,
    /// Refused; the transaction is `Failed` (or awaiting compensation).
    Rejected(Rejection),
    /// The payment outcome is unknown; the reconciler will resolve it.
    Pending { cause: String },
    /// The idempotency key was already used; nothing was executed.
    Replayed,
    /// The caller cancelled before the reservation.
    Cancelled,
}

impl Disposition {
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Settled => "settled",
            Disposition::Rejected(Rejection::InsufficientFunds { .. }) => "insufficient_funds",
            Disposition::Rejected(Rejection::PartnerNotFound) => "partner_not_found",
            Disposition::Rejected(Rejection::ProviderDeclined { .. }) => "declined",
            Disposition::Pending { .. } => "pending",
            Disposition::Replayed => "replayed",
            Disposition::Cancelled => "cancelled",
        }
    }
}

/// Result of `create_transaction`: the persisted row and how it got there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaOutcome {
    pub transaction: Transaction,
    pub disposition: Disposition,
}

/// Whether a compensation finished or was handed to the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Compensation {
    Completed,
    Deferred,
}

/// Drives transactions through the saga.
///
/// Cheap to clone; all clones share the same ledger, store, gateway,
/// in-flight registry and operator queue.
#[derive(Clone)]
pub struct TransactionOrchestrator {
    ledger: Arc<dyn CreditLedger>,
    transactions: Arc<dyn TransactionStore>,
    idempotency: IdempotencyStore,
    gateway: Arc<dyn ProviderGateway>,
    in_flight: InFlight,
    operator: OperatorQueue,
    config: OrchestratorConfig,
}

impl TransactionOrchestrator {
    pub fn new(
        ledger: Arc<dyn CreditLedger>,
        transactions: Arc<dyn TransactionStore>,
        gateway: Arc<dyn ProviderGateway>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            ledger,
            idempotency: IdempotencyStore::new(transactions.clone()),
            transactions,
            gateway,
            in_flight: InFlight::new(),
            operator: OperatorQueue::new(),
            config,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn CreditLedger> {
        &self.ledger
    }

    pub fn transactions(&self) -> &Arc<dyn TransactionStore> {
        &self.transactions
    }

    pub fn gateway(&self) -> &Arc<dyn ProviderGateway> {
        &self.gateway
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    pub fn operator_queue(&self) -> &OperatorQueue {
        &self.operator
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Runs the saga for a new request.
    pub async fn create_transaction(&self, request: CreateTransaction) -> Result<SagaOutcome> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.create_transaction_with_cancel(request, cancel_rx).await
    }

    /// Runs the saga for a new request, honoring `cancel` until the credit
    /// reservation is attempted.
    ///
    /// The saga body runs on its own task: dropping the returned future
    /// does not abort a saga that already holds a reservation.
    #[tracing::instrument(
        skip(self, request, cancel),
        fields(tenant_id = %request.tenant_id, partner_id = %request.partner_id)
    )]
    pub async fn create_transaction_with_cancel(
        &self,
        request: CreateTransaction,
        cancel: watch::Receiver<bool>,
    ) -> Result<SagaOutcome> {
        request.validate()?;
        let fees = self.config.fee_schedule.apply(request.amount)?;
        let provider = self.gateway.name().to_string();

        let admission = self
            .idempotency
            .admit(&request.tenant_id, request.idempotency_key(), || {
                Transaction::pending(&request, fees, provider, Utc::now())
            })
            .await?;

        let tx = match admission {
            Admission::Existing(tx) => {
                metrics::counter!("saga_transactions_total", "outcome" => "replayed").increment(1);
                tracing::info!(tx_id = %tx.id, status = %tx.status, "idempotent replay");
                return Ok(SagaOutcome {
                    transaction: tx,
                    disposition: Disposition::Replayed,
                });
            }
            Admission::Created(tx) => tx,
        };

        let guard = self
            .in_flight
            .try_claim(tx.id)
            .ok_or(SagaError::AlreadyInFlight(tx.id))?;
        let saga = self.clone();
        let handle = tokio::spawn(
            async move {
                let _guard = guard;
                saga.drive(tx, cancel).await
            }
            .in_current_span(),
        );

        handle
            .await
            .map_err(|e| SagaError::TaskFailed(e.to_string()))?
    }

    async fn drive(&self, tx: Transaction, cancel: watch::Receiver<bool>) -> Result<SagaOutcome> {
        let started = Instant::now();
        let tx_id = tx.id;
        let result = self.run_saga(tx, cancel).await;

        let label = match &result {
            Ok(outcome) => outcome.disposition.label(),
            Err(e) => {
                tracing::error!(%tx_id, error = %e, "saga failed");
                "error"
            }
        };
        metrics::counter!("saga_transactions_total", "outcome" => label).increment(1);
        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    async fn run_saga(
        &self,
        mut tx: Transaction,
        cancel: watch::Receiver<bool>,
    ) -> Result<SagaOutcome> {
        if *cancel.borrow() {
            tx.mark_cancelled("cancelled before reservation", Utc::now())?;
            self.transactions
                .update(&tx, TransactionStatus::Pending)
                .await?;
            tracing::info!(tx_id = %tx.id, "saga cancelled before reservation");
            return Ok(SagaOutcome {
                transaction: tx,
                disposition: Disposition::Cancelled,
            });
        }

        let reserved = match self.ledger.reserve(&tx.partner_id, tx.total, tx.id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(tx_id = %tx.id, error = %e, "credit reservation failed");
                self.abandon(&mut tx, "credit reservation failed").await;
                return Err(e.into());
            }
        };

        match reserved {
            ReserveOutcome::Reserved(view) => {
                tracing::info!(
                    tx_id = %tx.id,
                    total = %tx.total,
                    available = %view.limit_available,
                    "credit reserved"
                );
            }
            ReserveOutcome::InsufficientFunds { available } => {
                return self
                    .reject(tx, Rejection::InsufficientFunds { available })
                    .await;
            }
            ReserveOutcome::NotFound => {
                return self.reject(tx, Rejection::PartnerNotFound).await;
            }
        }

        // From here on the reservation exists. If this write fails the row
        // stays Pending and the reconciler restores it.
        tx.mark_reserved(Utc::now())?;
        self.transactions
            .update(&tx, TransactionStatus::Pending)
            .await?;

        match self.pay(&tx).await {
            PayOutcome::Success { provider_ref_no } => {
                self.settle(&mut tx, &provider_ref_no).await?;
                Ok(SagaOutcome {
                    transaction: tx,
                    disposition: Disposition::Settled,
                })
            }
            PayOutcome::Declined { reason } => {
                tracing::info!(tx_id = %tx.id, %reason, "provider declined, restoring credit");
                let rejection = Rejection::ProviderDeclined { reason };
                self.compensate(&mut tx, &rejection.reason()).await?;
                Ok(SagaOutcome {
                    transaction: tx,
                    disposition: Disposition::Rejected(rejection),
                })
            }
            PayOutcome::Ambiguous { cause } => {
                let cause = cause.to_string();
                tracing::warn!(tx_id = %tx.id, %cause, "payment outcome unknown, awaiting reconciliation");
                tx.mark_awaiting_confirmation(&cause, Utc::now())?;
                self.transactions
                    .update(&tx, TransactionStatus::Reserved)
                    .await?;
                Ok(SagaOutcome {
                    transaction: tx,
                    disposition: Disposition::Pending { cause },
                })
            }
        }
    }

    async fn pay(&self, tx: &Transaction) -> PayOutcome {
        let request = PayRequest {
            product_code: tx.product_code.clone(),
            customer_no: tx.customer_no.clone(),
            amount: tx.amount,
            ref_no: tx.id,
            deadline: self.config.provider_deadline,
        };

        let mut outcome = pay_within(self.gateway.as_ref(), &request).await;
        if self.gateway.capabilities().idempotent_pay {
            let mut attempt = 0;
            while outcome.is_ambiguous() && attempt < self.config.pay_retries {
                attempt += 1;
                tracing::warn!(tx_id = %tx.id, attempt, "retrying ambiguous payment with the same reference");
                outcome = pay_within(self.gateway.as_ref(), &request).await;
            }
        }
        outcome
    }

    async fn reject(&self, mut tx: Transaction, rejection: Rejection) -> Result<SagaOutcome> {
        tx.mark_failed(rejection.reason(), Utc::now())?;
        self.transactions
            .update(&tx, TransactionStatus::Pending)
            .await?;
        tracing::info!(tx_id = %tx.id, reason = %rejection.reason(), "transaction rejected");
        Ok(SagaOutcome {
            transaction: tx,
            disposition: Disposition::Rejected(rejection),
        })
    }

    /// Best-effort termination of a Pending row whose reservation outcome is unknown.
    async fn abandon(&self, tx: &mut Transaction, reason: &str) {
        match self.compensate(tx, reason).await {
            Ok(Compensation::Completed) => {}
            Ok(Compensation::Deferred) => {
                tracing::warn!(tx_id = %tx.id, "left pending for reconciliation");
            }
            Err(e) => {
                tracing::error!(tx_id = %tx.id, error = %e, "could not terminate pending transaction");
            }
        }
    }

    /// Records a confirmed payment.
    pub(crate) async fn settle(&self, tx: &mut Transaction, provider_ref_no: &str) -> Result<()> {
        let expected = tx.status;
        tx.mark_settled(provider_ref_no, Utc::now())?;
        self.transactions.update(tx, expected).await?;
        self.operator.remove(tx.id);
        tracing::info!(tx_id = %tx.id, provider_ref_no, "transaction settled");
        Ok(())
    }

    /// Restores the reservation, then fails the transaction.
    ///
    /// Only a `Pending` row may find nothing to restore; a `Reserved` row
    /// without a ledger entry is an integrity fault. A storage failure
    /// during restore leaves a `Reserved` row marked awaiting compensation
    /// and returns `Deferred`. Integrity faults are escalated and returned
    /// as errors.
    pub(crate) async fn compensate(
        &self,
        tx: &mut Transaction,
        reason: &str,
    ) -> Result<Compensation> {
        let expected = tx.status;
        let restored = self.ledger.restore(&tx.partner_id, tx.total, tx.id).await;

        match restored {
            Ok(outcome) => {
                let released = match &outcome {
                    RestoreOutcome::Restored(_) | RestoreOutcome::AlreadyRestored(_) => true,
                    // A pending row may never have reached the ledger.
                    RestoreOutcome::NoReservation(_) | RestoreOutcome::NotFound => {
                        expected == TransactionStatus::Pending
                    }
                    RestoreOutcome::Overrestore { .. } => false,
                };
                if !released {
                    return Err(self.integrity_fault(tx, restore_fault(tx, &outcome)));
                }

                tx.mark_failed(reason, Utc::now())?;
                self.transactions.update(tx, expected).await?;
                self.operator.remove(tx.id);
                tracing::info!(tx_id = %tx.id, %reason, "reservation released, transaction failed");
                Ok(Compensation::Completed)
            }
            Err(e) if e.is_integrity_fault() => {
                metrics::counter!("ledger_integrity_faults_total").increment(1);
                Err(self.integrity_fault(tx, e.to_string()))
            }
            Err(e) => {
                tracing::warn!(tx_id = %tx.id, error = %e, "restore failed, deferring compensation");
                if expected == TransactionStatus::Reserved
                    && tx.hint_kind() != Some(HintKind::AwaitingCompensation)
                {
                    tx.mark_awaiting_compensation(reason, Utc::now())?;
                    self.transactions.update(tx, expected).await?;
                }
                Ok(Compensation::Deferred)
            }
        }
    }

    /// Restores the reservation of a settled transaction and cancels it.
    ///
    /// A settled row always holds a reservation, so anything but a restore
    /// is an integrity fault. A storage failure leaves the row `Success`
    /// marked awaiting compensation and returns `Deferred`.
    pub(crate) async fn release_settled(
        &self,
        tx: &mut Transaction,
        reason: &str,
    ) -> Result<Compensation> {
        match self.ledger.restore(&tx.partner_id, tx.total, tx.id).await {
            Ok(outcome) if outcome.is_restored() => {}
            Ok(outcome) => {
                return Err(self.integrity_fault(tx, restore_fault(tx, &outcome)));
            }
            Err(e) if e.is_integrity_fault() => {
                metrics::counter!("ledger_integrity_faults_total").increment(1);
                return Err(self.integrity_fault(tx, e.to_string()));
            }
            Err(e) => {
                tracing::warn!(tx_id = %tx.id, error = %e, "restore failed, deferring void");
                if tx.hint_kind() != Some(HintKind::AwaitingCompensation) {
                    tx.mark_awaiting_compensation(reason, Utc::now())?;
                    self.transactions
                        .update(tx, TransactionStatus::Success)
                        .await?;
                }
                return Ok(Compensation::Deferred);
            }
        }

        tx.mark_cancelled(reason, Utc::now())?;
        self.transactions
            .update(tx, TransactionStatus::Success)
            .await?;
        self.operator.remove(tx.id);
        tracing::info!(tx_id = %tx.id, %reason, "reservation released, transaction cancelled");
        Ok(Compensation::Completed)
    }

    fn integrity_fault(&self, tx: &Transaction, detail: String) -> SagaError {
        tracing::error!(tx_id = %tx.id, partner_id = %tx.partner_id, %detail, "ledger integrity fault");
        self.escalate(tx, format!("integrity fault: {detail}"), Utc::now());
        SagaError::IntegrityFault {
            tx_id: tx.id,
            detail,
        }
    }

    pub(crate) fn escalate(&self, tx: &Transaction, reason: String, now: DateTime<Utc>) -> bool {
        self.operator
            .escalate(Escalation::for_transaction(tx, reason, now))
    }

    /// Loads a transaction visible to `tenant_id`.
    pub async fn get_transaction(
        &self,
        tenant_id: &TenantId,
        tx_id: TransactionId,
    ) -> Result<Transaction> {
        self.transactions
            .get(tenant_id, tx_id)
            .await?
            .ok_or(SagaError::TransactionNotFound(tx_id))
    }

    /// Bill lookup through the provider.
    pub async fn inquiry(&self, product_code: &str, customer_no: &str) -> Result<InquiryResult> {
        Ok(self.gateway.inquiry(product_code, customer_no).await?)
    }

    /// Reverses a settled transaction: provider cancel, restore, `Cancelled`.
    ///
    /// The row is marked `void_requested` before the provider is called and
    /// `awaiting_compensation` once the cancel is confirmed, so a restore
    /// that fails afterwards is finished by the reconciler. A row already
    /// awaiting compensation skips the cancel.
    #[tracing::instrument(skip(self))]
    pub async fn void_transaction(
        &self,
        tenant_id: &TenantId,
        tx_id: TransactionId,
    ) -> Result<Transaction> {
        let _guard = self
            .in_flight
            .try_claim(tx_id)
            .ok_or(SagaError::AlreadyInFlight(tx_id))?;
        let mut tx = self.get_transaction(tenant_id, tx_id).await?;

        if tx.status != TransactionStatus::Success {
            return Err(SagaError::StateConflict {
                tx_id,
                status: tx.status,
                action: "void",
            });
        }
        if tx.hint_kind() != Some(HintKind::AwaitingCompensation) {
            self.cancel_with_provider(&mut tx).await?;
        }
        if self.release_settled(&mut tx, VOID_REASON).await? == Compensation::Deferred {
            return Err(SagaError::CompensationDeferred(tx_id));
        }

        metrics::counter!("saga_voids_total").increment(1);
        tracing::info!(%tx_id, "transaction voided");
        Ok(tx)
    }

    async fn cancel_with_provider(&self, tx: &mut Transaction) -> Result<()> {
        let provider_ref_no = tx.provider_tx_id.clone().ok_or_else(|| {
            self.integrity_fault(tx, "settled transaction has no provider reference".to_string())
        })?;

        tx.mark_void_requested(Utc::now())?;
        self.transactions
            .update(tx, TransactionStatus::Success)
            .await?;

        if let Err(e) = self.gateway.cancel(tx.id, &provider_ref_no).await {
            if matches!(e, GatewayError::Transport(_)) {
                // The cancel may have landed; keep the marker for the operator.
                self.escalate(tx, format!("void unconfirmed by provider: {e}"), Utc::now());
            } else {
                tx.clear_hint(Utc::now());
                self.transactions
                    .update(tx, TransactionStatus::Success)
                    .await?;
            }
            return Err(e.into());
        }

        tx.mark_awaiting_compensation(VOID_REASON, Utc::now())?;
        self.transactions
            .update(tx, TransactionStatus::Success)
            .await?;
        Ok(())
    }

    /// Creates the credit limit of a newly onboarded partner.
    pub async fn open_limit(&self, partner_id: &PartnerId, limit_total: Money) -> Result<LimitView> {
        if !limit_total.is_positive() {
            return Err(TransactionError::InvalidAmount {
                amount: limit_total,
            }
            .into());
        }
        Ok(self.ledger.open_limit(partner_id, limit_total).await?)
    }

    pub async fn get_limit(&self, partner_id: &PartnerId) -> Result<LimitView> {
        self.ledger
            .get_limit(partner_id)
            .await?
            .ok_or_else(|| SagaError::PartnerNotFound(partner_id.clone()))
    }

    /// Direct reservation for trusted internal callers.
    pub async fn reserve(
        &self,
        partner_id: &PartnerId,
        amount: Money,
        tx_id: TransactionId,
    ) -> Result<LimitView> {
        if !amount.is_positive() {
            return Err(TransactionError::InvalidAmount { amount }.into());
        }
        match self.ledger.reserve(partner_id, amount, tx_id).await? {
            ReserveOutcome::Reserved(view) => Ok(view),
            ReserveOutcome::InsufficientFunds { available } => Err(SagaError::InsufficientFunds {
                partner_id: partner_id.clone(),
                available,
            }),
            ReserveOutcome::NotFound => Err(SagaError::PartnerNotFound(partner_id.clone())),
        }
    }

    /// Direct restore for trusted internal callers. Idempotent per `tx_id`.
    pub async fn restore(
        &self,
        partner_id: &PartnerId,
        amount: Money,
        tx_id: TransactionId,
    ) -> Result<LimitView> {
        if !amount.is_positive() {
            return Err(TransactionError::InvalidAmount { amount }.into());
        }
        match self.ledger.restore(partner_id, amount, tx_id).await? {
            RestoreOutcome::Restored(view)
            | RestoreOutcome::AlreadyRestored(view)
            | RestoreOutcome::NoReservation(view) => Ok(view),
            RestoreOutcome::Overrestore { used } => {
                let detail = format!("restore of {amount} exceeds used limit {used}");
                tracing::error!(%tx_id, partner_id = %partner_id, %detail, "ledger integrity fault");
                Err(SagaError::IntegrityFault { tx_id, detail })
            }
            RestoreOutcome::NotFound => Err(SagaError::PartnerNotFound(partner_id.clone())),
        }
    }
}

fn restore_fault(tx: &Transaction, outcome: &RestoreOutcome) -> String {
    match outcome {
        RestoreOutcome::Overrestore { used } => {
            format!("restore of {} exceeds used limit {used}", tx.total)
        }
        RestoreOutcome::NoReservation(_) => {
            format!("no reservation recorded for {} transaction", tx.status)
        }
        RestoreOutcome::NotFound => {
            format!("credit limit of partner {} is missing", tx.partner_id)
        }
        other => format!("unexpected restore outcome {other:?}"),
    }
}
