//! Credit ledger seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Money, PartnerId, TransactionId};
use domain::LimitView;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Outcome of a reserve call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The amount is now held against the limit. Also returned, without
    /// mutation, when the same transaction already holds its reservation.
    Reserved(LimitView),
    /// Not enough available limit; nothing was changed.
    InsufficientFunds { available: Money },
    /// No credit limit exists for the partner.
    NotFound,
}

/// Outcome of a restore call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The reservation was returned to the available limit.
    Restored(LimitView),
    /// The reservation had already been restored; nothing was changed.
    AlreadyRestored(LimitView),
    /// No reservation was ever recorded for the transaction; nothing was changed.
    NoReservation(LimitView),
    /// `limit_used` is smaller than the amount to restore. This is a data
    /// integrity fault, not a business error.
    Overrestore { used: Money },
    /// No credit limit exists for the partner.
    NotFound,
}

impl RestoreOutcome {
    /// Returns true if a recorded reservation has been given back, by this
    /// call or an earlier one.
    pub fn is_restored(&self) -> bool {
        matches!(
            self,
            RestoreOutcome::Restored(_) | RestoreOutcome::AlreadyRestored(_)
        )
    }

    /// Returns the limit view if the outcome carries one.
    pub fn view(&self) -> Option<&LimitView> {
        match self {
            RestoreOutcome::Restored(v)
            | RestoreOutcome::AlreadyRestored(v)
            | RestoreOutcome::NoReservation(v) => Some(v),
            _ => None,
        }
    }
}

/// Lifecycle of a single reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservationState {
    Reserved,
    Restored,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Reserved => "reserved",
            ReservationState::Restored => "restored",
        }
    }
}

/// Ledger entry pairing a reserve with its restore, keyed by transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationEntry {
    pub tx_id: TransactionId,
    pub partner_id: PartnerId,
    pub amount: Money,
    pub state: ReservationState,
    pub reserved_at: DateTime<Utc>,
    pub restored_at: Option<DateTime<Utc>>,
}

/// System of record for partner spending limits.
///
/// `reserve` and `restore` for the same partner are totally ordered; calls
/// for different partners never wait on each other. Both are idempotent per
/// transaction id.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Creates a limit for a newly onboarded partner.
    async fn open_limit(&self, partner_id: &PartnerId, limit_total: Money) -> Result<LimitView>;

    /// Holds `amount` against the partner's limit for `tx_id`.
    ///
    /// Precondition: `amount > 0`.
    async fn reserve(
        &self,
        partner_id: &PartnerId,
        amount: Money,
        tx_id: TransactionId,
    ) -> Result<ReserveOutcome>;

    /// Returns the reservation held for `tx_id` to the available limit.
    async fn restore(
        &self,
        partner_id: &PartnerId,
        amount: Money,
        tx_id: TransactionId,
    ) -> Result<RestoreOutcome>;

    /// Reads the current limit without locking.
    async fn get_limit(&self, partner_id: &PartnerId) -> Result<Option<LimitView>>;

    /// Looks up the reservation entry for a transaction.
    async fn reservation(&self, tx_id: TransactionId) -> Result<Option<ReservationEntry>>;
}

/// Records ledger outcome counters.
pub(crate) fn record_reserve(outcome: &ReserveOutcome) {
    let label = match outcome {
        ReserveOutcome::Reserved(_) => "reserved",
        ReserveOutcome::InsufficientFunds { .. } => "insufficient_funds",
        ReserveOutcome::NotFound => "not_found",
    };
    metrics::counter!("ledger_reserve_total", "outcome" => label).increment(1);
}

pub(crate) fn record_restore(outcome: &RestoreOutcome) {
    let label = match outcome {
        RestoreOutcome::Restored(_) => "restored",
        RestoreOutcome::AlreadyRestored(_) => "already_restored",
        RestoreOutcome::NoReservation(_) => "no_reservation",
        RestoreOutcome::Overrestore { .. } => "overrestore",
        RestoreOutcome::NotFound => "not_found",
    };
    metrics::counter!("ledger_restore_total", "outcome" => label).increment(1);
    if matches!(outcome, RestoreOutcome::Overrestore { .. }) {
        metrics::counter!("ledger_integrity_faults_total").increment(1);
    }
}
