//! Operator escalation queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use common::{Money, PartnerId, TenantId, TransactionId};
use domain::Transaction;
use serde::{Deserialize, Serialize};

/// A transaction that needs a human decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub tx_id: TransactionId,
    pub tenant_id: TenantId,
    pub partner_id: PartnerId,
    pub total: Money,
    pub reason: String,
    pub escalated_at: DateTime<Utc>,
}

impl Escalation {
    pub fn for_transaction(tx: &Transaction, reason: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            tx_id: tx.id,
            tenant_id: tx.tenant_id.clone(),
            partner_id: tx.partner_id.clone(),
            total: tx.total,
            reason: reason.into(),
            escalated_at: now,
        }
    }
}

/// Operator's answer for an escalated transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ManualResolution {
    /// The provider confirmed the payment out of band.
    Settled { provider_ref_no: String },
    /// The payment did not happen; release the reservation.
    NotSettled,
}

/// Deduplicated set of open escalations, one per transaction.
#[derive(Debug, Clone, Default)]
pub struct OperatorQueue {
    entries: Arc<Mutex<HashMap<TransactionId, Escalation>>>,
}

impl OperatorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an escalation. Returns false if the transaction is already queued.
    pub fn escalate(&self, escalation: Escalation) -> bool {
        let tx_id = escalation.tx_id;
        let reason = escalation.reason.clone();
        let added = self.with_entries(|entries| {
            if entries.contains_key(&tx_id) {
                return false;
            }
            entries.insert(tx_id, escalation);
            true
        });
        if added {
            metrics::counter!("reconciler_escalations_total").increment(1);
            tracing::warn!(%tx_id, %reason, "transaction escalated to operator");
        }
        added
    }

    /// Open escalations, oldest first.
    pub fn list(&self) -> Vec<Escalation> {
        let mut all: Vec<Escalation> = self.with_entries(|entries| entries.values().cloned().collect());
        all.sort_by(|a, b| {
            a.escalated_at
                .cmp(&b.escalated_at)
                .then_with(|| a.tx_id.cmp(&b.tx_id))
        });
        all
    }

    pub fn get(&self, tx_id: TransactionId) -> Option<Escalation> {
        self.with_entries(|entries| entries.get(&tx_id).cloned())
    }

    pub fn contains(&self, tx_id: TransactionId) -> bool {
        self.with_entries(|entries| entries.contains_key(&tx_id))
    }

    pub fn remove(&self, tx_id: TransactionId) -> Option<Escalation> {
        self.with_entries(|entries| entries.remove(&tx_id))
    }

    pub fn len(&self) -> usize {
        self.with_entries(|entries| entries.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_entries<R>(&self, f: impl FnOnce(&mut HashMap<TransactionId, Escalation>) -> R) -> R {
        let mut guard = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use domain::{CreateTransaction, FeeSchedule};

    use super::*;

    fn transaction() -> Transaction {
        let req = CreateTransaction::new(
            TenantId::new("tenant-a"),
            PartnerId::new("partner-1"),
            "PLN50",
            "5300001",
            Money::from_minor(50_000),
        );
        let fees = FeeSchedule::default().apply(req.amount).unwrap();
        Transaction::pending(&req, fees, "scripted", Utc::now())
    }

    #[test]
    fn escalations_are_deduplicated() {
        let queue = OperatorQueue::new();
        let tx = transaction();

        assert!(queue.escalate(Escalation::for_transaction(&tx, "timeout", Utc::now())));
        assert!(!queue.escalate(Escalation::for_transaction(&tx, "again", Utc::now())));

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get(tx.id).unwrap().reason, "timeout");
        assert_eq!(queue.get(tx.id).unwrap().total, Money::from_minor(51_250));
    }

    #[test]
    fn list_is_oldest_first() {
        let queue = OperatorQueue::new();
        let now = Utc::now();
        let newer = transaction();
        let older = transaction();

        queue.escalate(Escalation::for_transaction(&newer, "b", now));
        queue.escalate(Escalation::for_transaction(&older, "a", now - Duration::minutes(5)));

        let listed: Vec<_> = queue.list().into_iter().map(|e| e.tx_id).collect();
        assert_eq!(listed, vec![older.id, newer.id]);
    }

    #[test]
    fn remove_closes_the_escalation() {
        let queue = OperatorQueue::new();
        let tx = transaction();
        queue.escalate(Escalation::for_transaction(&tx, "timeout", Utc::now()));

        assert!(queue.remove(tx.id).is_some());
        assert!(queue.is_empty());
        assert!(queue.remove(tx.id).is_none());
    }

    #[test]
    fn resolution_wire_format() {
        let settled: ManualResolution =
            serde_json::from_str(r#"{"outcome":"settled","provider_ref_no":"P-1"}"#).unwrap();
        assert_eq!(
            settled,
            ManualResolution::Settled {
                provider_ref_no: "P-1".to_string()
            }
        );
        let not_settled: ManualResolution =
            serde_json::from_str(r#"{"outcome":"not_settled"}"#).unwrap();
        assert_eq!(not_settled, ManualResolution::NotSettled);
    }
}
