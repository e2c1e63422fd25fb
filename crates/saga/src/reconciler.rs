//! Background resolution of transactions the saga could not finish.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use common::TransactionId;
use domain::{HintKind, Transaction, TransactionStatus};
use futures_util::StreamExt;
use serde::Serialize;
use store::TransactionStoreExt;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::{Result, SagaError};
use crate::gateway::PaymentStatus;
use crate::operator::{ManualResolution, OperatorQueue};
use crate::orchestrator::{Compensation, TransactionOrchestrator, VOID_REASON};

const PENDING_EXPIRED_REASON: &str = "reservation not confirmed";

/// What to do when the provider cannot say whether a payment settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownStatusPolicy {
    /// Keep the reservation and ask again next pass; escalate after `max_age`.
    #[default]
    Wait,
    /// Escalate at once when the provider has no status inquiry.
    Escalate,
}

/// When and how much the reconciler works.
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    pub interval: Duration,
    /// Rows younger than this (by last update) are left to their saga.
    pub grace_period: Duration,
    /// Unresolved rows older than this (by creation) go to the operator queue.
    pub max_age: Duration,
    /// Maximum rows fetched per status per pass.
    pub batch_size: usize,
    pub concurrency: usize,
    pub unknown_status: UnknownStatusPolicy,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            grace_period: Duration::from_secs(60),
            max_age: Duration::from_secs(3600),
            batch_size: 100,
            concurrency: 8,
            unknown_status: UnknownStatusPolicy::Wait,
        }
    }
}

/// Tally of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    /// Reserved rows confirmed settled by the provider.
    pub settled: usize,
    /// Expired Pending rows terminated.
    pub failed: usize,
    /// Reserved rows whose reservation was restored.
    pub compensated: usize,
    /// Settled rows whose void was finished.
    pub cancelled: usize,
    /// Rows newly handed to the operator queue.
    pub escalated: usize,
    /// Rows left for a later pass.
    pub unresolved: usize,
    pub skipped_in_flight: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Settled,
    Failed,
    Compensated,
    Cancelled,
    Escalated,
    Unresolved,
    SkippedInFlight,
    Unchanged,
}

impl Resolution {
    fn label(self) -> &'static str {
        match self {
            Resolution::Settled => "settled",
            Resolution::Failed => "failed",
            Resolution::Compensated => "compensated",
            Resolution::Cancelled => "cancelled",
            Resolution::Escalated => "escalated",
            Resolution::Unresolved => "unresolved",
            Resolution::SkippedInFlight => "skipped_in_flight",
            Resolution::Unchanged => "unchanged",
        }
    }
}

impl ReconcileReport {
    fn record(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Settled => self.settled += 1,
            Resolution::Failed => self.failed += 1,
            Resolution::Compensated => self.compensated += 1,
            Resolution::Cancelled => self.cancelled += 1,
            Resolution::Escalated => self.escalated += 1,
            Resolution::Unresolved => self.unresolved += 1,
            Resolution::SkippedInFlight => self.skipped_in_flight += 1,
            Resolution::Unchanged => {}
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Finishes transactions stuck in `Pending` or `Reserved`, and voids left
/// half done on `Success` rows.
///
/// Never restores a reservation unless the provider says the payment did
/// not settle, a Pending row never had its reservation confirmed, or the
/// provider confirmed a void. Anything it cannot decide goes to the
/// operator queue.
#[derive(Clone)]
pub struct Reconciler {
    orchestrator: TransactionOrchestrator,
    policy: ReconcilePolicy,
}

impl Reconciler {
    pub fn new(orchestrator: TransactionOrchestrator, policy: ReconcilePolicy) -> Self {
        Self {
            orchestrator,
            policy,
        }
    }

    pub fn policy(&self) -> &ReconcilePolicy {
        &self.policy
    }

    pub fn operator_queue(&self) -> &OperatorQueue {
        self.orchestrator.operator_queue()
    }

    /// Runs passes every `interval` until `shutdown` turns true or its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }

        let mut ticker = tokio::time::interval(self.policy.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.policy.interval.as_secs(),
            grace_secs = self.policy.grace_period.as_secs(),
            "reconciler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.examined > 0 => {
                            tracing::info!(?report, "reconciliation pass finished");
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "reconciliation pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("reconciler stopped");
    }

    pub async fn run_once(&self) -> Result<ReconcileReport> {
        self.run_once_at(Utc::now()).await
    }

    /// Runs one pass as if the clock read `now`.
    #[tracing::instrument(skip(self))]
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let started = Instant::now();
        let cutoff = now
            .checked_sub_signed(to_chrono(self.policy.grace_period))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let store = self.orchestrator.transactions();

        let mut candidates = store
            .stale(TransactionStatus::Pending, cutoff, self.policy.batch_size)
            .await?;
        candidates.extend(
            store
                .stale(TransactionStatus::Reserved, cutoff, self.policy.batch_size)
                .await?,
        );
        for kind in [HintKind::AwaitingCompensation, HintKind::VoidRequested] {
            candidates.extend(
                store
                    .stale_voids(kind, cutoff, self.policy.batch_size)
                    .await?,
            );
        }

        let report = Mutex::new(ReconcileReport::default());
        futures_util::stream::iter(candidates)
            .for_each_concurrent(self.policy.concurrency.max(1), |tx| {
                let report = &report;
                async move {
                    let tx_id = tx.id;
                    let result = self.reconcile_one(tx, now, cutoff).await;

                    let mut report = report.lock().unwrap_or_else(PoisonError::into_inner);
                    report.examined += 1;
                    match result {
                        Ok(resolution) => {
                            metrics::counter!("reconciler_transactions_total", "outcome" => resolution.label())
                                .increment(1);
                            report.record(resolution);
                        }
                        Err(e) => {
                            metrics::counter!("reconciler_transactions_total", "outcome" => "error")
                                .increment(1);
                            tracing::error!(%tx_id, error = %e, "reconciliation failed");
                            report.errors += 1;
                        }
                    }
                }
            })
            .await;

        let report = report.into_inner().unwrap_or_else(PoisonError::into_inner);
        metrics::counter!("reconciler_runs_total").increment(1);
        metrics::histogram!("reconciler_run_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(report)
    }

    async fn reconcile_one(
        &self,
        candidate: Transaction,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Result<Resolution> {
        let Some(_guard) = self.orchestrator.in_flight().try_claim(candidate.id) else {
            return Ok(Resolution::SkippedInFlight);
        };

        // The row may have moved between the query and the claim.
        let Some(mut tx) = self
            .orchestrator
            .transactions()
            .get_by_id(candidate.id)
            .await?
        else {
            return Ok(Resolution::Unchanged);
        };
        if tx.updated_at >= cutoff {
            return Ok(Resolution::Unchanged);
        }

        match tx.status {
            TransactionStatus::Pending => {
                tracing::info!(tx_id = %tx.id, "expiring pending transaction");
                Ok(match self.orchestrator.compensate(&mut tx, PENDING_EXPIRED_REASON).await? {
                    Compensation::Completed => Resolution::Failed,
                    Compensation::Deferred => Resolution::Unresolved,
                })
            }
            TransactionStatus::Reserved
                if tx.hint_kind() == Some(HintKind::AwaitingCompensation) =>
            {
                let reason = tx
                    .failure_reason
                    .clone()
                    .unwrap_or_else(|| "provider declined".to_string());
                self.restore_reserved(&mut tx, &reason).await
            }
            TransactionStatus::Reserved => self.confirm(&mut tx, now).await,
            TransactionStatus::Success => match tx.hint_kind() {
                Some(HintKind::AwaitingCompensation) => {
                    let reason = tx
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| VOID_REASON.to_string());
                    tracing::info!(tx_id = %tx.id, "finishing void");
                    Ok(
                        match self.orchestrator.release_settled(&mut tx, &reason).await? {
                            Compensation::Completed => Resolution::Cancelled,
                            Compensation::Deferred => Resolution::Unresolved,
                        },
                    )
                }
                // Only the provider knows whether the cancel landed.
                Some(HintKind::VoidRequested) => Ok(self.hold(
                    &tx,
                    "void requested, provider cancel unconfirmed",
                    now,
                    true,
                )),
                _ => Ok(Resolution::Unchanged),
            },
            _ => Ok(Resolution::Unchanged),
        }
    }

    async fn confirm(&self, tx: &mut Transaction, now: DateTime<Utc>) -> Result<Resolution> {
        let status = self.orchestrator.gateway().payment_status(tx.id).await;
        tracing::debug!(tx_id = %tx.id, ?status, "provider status");

        match status {
            PaymentStatus::Settled { provider_ref_no } => {
                self.orchestrator.settle(tx, &provider_ref_no).await?;
                Ok(Resolution::Settled)
            }
            PaymentStatus::NotSettled { reason } => {
                self.restore_reserved(tx, &format!("provider reports not settled: {reason}"))
                    .await
            }
            PaymentStatus::Unknown { cause } => Ok(self.hold(tx, &cause, now, false)),
            PaymentStatus::Unsupported => Ok(self.hold(
                tx,
                "provider has no status inquiry",
                now,
                self.policy.unknown_status == UnknownStatusPolicy::Escalate,
            )),
        }
    }

    async fn restore_reserved(&self, tx: &mut Transaction, reason: &str) -> Result<Resolution> {
        Ok(match self.orchestrator.compensate(tx, reason).await? {
            Compensation::Completed => Resolution::Compensated,
            Compensation::Deferred => Resolution::Unresolved,
        })
    }

    fn hold(
        &self,
        tx: &Transaction,
        cause: &str,
        now: DateTime<Utc>,
        escalate_now: bool,
    ) -> Resolution {
        let age = now - tx.created_at;
        if escalate_now || age > to_chrono(self.policy.max_age) {
            let reason = format!("unresolved after {}s: {cause}", age.num_seconds());
            if self.orchestrator.escalate(tx, reason, now) {
                return Resolution::Escalated;
            }
        }
        Resolution::Unresolved
    }

    /// Applies an operator's decision to an escalated transaction.
    #[tracing::instrument(skip(self))]
    pub async fn resolve(
        &self,
        tx_id: TransactionId,
        resolution: ManualResolution,
    ) -> Result<Transaction> {
        let queue = self.orchestrator.operator_queue();
        if !queue.contains(tx_id) {
            return Err(SagaError::EscalationNotFound(tx_id));
        }
        let _guard = self
            .orchestrator
            .in_flight()
            .try_claim(tx_id)
            .ok_or(SagaError::AlreadyInFlight(tx_id))?;
        let mut tx = self
            .orchestrator
            .transactions()
            .get_by_id(tx_id)
            .await?
            .ok_or(SagaError::TransactionNotFound(tx_id))?;

        match (&resolution, tx.status) {
            (ManualResolution::Settled { provider_ref_no }, TransactionStatus::Reserved) => {
                self.orchestrator.settle(&mut tx, provider_ref_no).await?;
            }
            (ManualResolution::Settled { .. }, TransactionStatus::Success) => {
                // The payment stands, so an unconfirmed void is dropped.
                if tx.hint_kind() == Some(HintKind::VoidRequested) {
                    tx.clear_hint(Utc::now());
                    self.orchestrator
                        .transactions()
                        .update(&tx, TransactionStatus::Success)
                        .await?;
                }
            }
            (
                ManualResolution::NotSettled,
                TransactionStatus::Failed | TransactionStatus::Cancelled,
            ) => {}
            (
                ManualResolution::NotSettled,
                TransactionStatus::Pending | TransactionStatus::Reserved,
            ) => {
                if self
                    .orchestrator
                    .compensate(&mut tx, "operator confirmed not settled")
                    .await?
                    == Compensation::Deferred
                {
                    return Err(SagaError::CompensationDeferred(tx_id));
                }
            }
            (ManualResolution::NotSettled, TransactionStatus::Success) => {
                if self
                    .orchestrator
                    .release_settled(&mut tx, "reversed by operator")
                    .await?
                    == Compensation::Deferred
                {
                    return Err(SagaError::CompensationDeferred(tx_id));
                }
            }
            (_, status) => {
                return Err(SagaError::StateConflict {
                    tx_id,
                    status,
                    action: "resolve",
                });
            }
        }

        queue.remove(tx_id);
        tracing::info!(%tx_id, status = %tx.status, "escalation resolved");
        Ok(tx)
    }
}
