//! Idempotent admission of new transactions.

use std::sync::Arc;

use common::TenantId;
use domain::Transaction;
use store::{InsertOutcome, TransactionStore};

use crate::error::Result;

/// Result of admitting a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A fresh `Pending` row was persisted; the caller owns its saga.
    Created(Transaction),
    /// The key was already used. Carries that transaction's current state,
    /// which may still be in flight. The caller must not re-run its saga.
    Existing(Transaction),
}

/// Maps `(tenant, idempotency key)` to a single transaction.
///
/// The mapping lives on the transaction row and is written by the same
/// insert, so two concurrent requests with one key cannot both win.
#[derive(Clone)]
pub struct IdempotencyStore {
    transactions: Arc<dyn TransactionStore>,
}

impl IdempotencyStore {
    pub fn new(transactions: Arc<dyn TransactionStore>) -> Self {
        Self { transactions }
    }

    /// Admits a request, building its transaction with `new_tx` only if the
    /// key has not been seen.
    ///
    /// Without a key every call is `Created`.
    #[tracing::instrument(skip(self, new_tx), fields(%tenant_id))]
    pub async fn admit(
        &self,
        tenant_id: &TenantId,
        idempotency_key: Option<&str>,
        new_tx: impl FnOnce() -> Transaction + Send,
    ) -> Result<Admission> {
        let key = idempotency_key.map(str::trim).filter(|k| !k.is_empty());

        if let Some(key) = key
            && let Some(existing) = self
                .transactions
                .find_by_idempotency_key(tenant_id, key)
                .await?
        {
            tracing::debug!(tx_id = %existing.id, "idempotency key replayed");
            return Ok(Admission::Existing(existing));
        }

        let mut tx = new_tx();
        tx.idempotency_key = key.map(str::to_string);

        match self.transactions.insert(&tx).await? {
            InsertOutcome::Inserted => Ok(Admission::Created(tx)),
            InsertOutcome::Conflict(existing) => {
                tracing::debug!(tx_id = %existing.id, "lost idempotency race");
                Ok(Admission::Existing(existing))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use common::{Money, PartnerId};
    use domain::{CreateTransaction, FeeSchedule};
    use store::InMemoryTransactionStore;

    use super::*;

    fn factory(tenant: &'static str, amount: i64) -> impl FnOnce() -> Transaction + Send {
        let req = CreateTransaction::new(
            TenantId::new(tenant),
            PartnerId::new("partner-1"),
            "PLN50",
            "5300001",
            Money::from_minor(amount),
        );
        move || {
            let fees = FeeSchedule::default().apply(req.amount).unwrap();
            Transaction::pending(&req, fees, "scripted", Utc::now())
        }
    }

    #[tokio::test]
    async fn same_key_returns_original_transaction() {
        let backing = InMemoryTransactionStore::new();
        let store = IdempotencyStore::new(Arc::new(backing.clone()));
        let tenant = TenantId::new("tenant-a");

        let first = store
            .admit(&tenant, Some("key-1"), factory("tenant-a", 50_000))
            .await
            .unwrap();
        let Admission::Created(created) = first else {
            panic!("first admission must create");
        };

        let second = store
            .admit(&tenant, Some("key-1"), factory("tenant-a", 99_000))
            .await
            .unwrap();
        match second {
            Admission::Existing(existing) => {
                assert_eq!(existing.id, created.id);
                assert_eq!(existing.amount, Money::from_minor(50_000));
            }
            other => panic!("expected existing, got {other:?}"),
        }
        assert_eq!(backing.transaction_count().await, 1);
    }

    #[tokio::test]
    async fn missing_key_never_deduplicates() {
        let backing = InMemoryTransactionStore::new();
        let store = IdempotencyStore::new(Arc::new(backing.clone()));
        let tenant = TenantId::new("tenant-a");

        for key in [None, Some(""), Some("   ")] {
            let admission = store
                .admit(&tenant, key, factory("tenant-a", 10_000))
                .await
                .unwrap();
            assert!(matches!(admission, Admission::Created(_)));
        }
        assert_eq!(backing.transaction_count().await, 3);
    }

    #[tokio::test]
    async fn keys_are_scoped_per_tenant() {
        let store = IdempotencyStore::new(Arc::new(InMemoryTransactionStore::new()));

        let a = store
            .admit(&TenantId::new("tenant-a"), Some("k"), factory("tenant-a", 10_000))
            .await
            .unwrap();
        let b = store
            .admit(&TenantId::new("tenant-b"), Some("k"), factory("tenant-b", 10_000))
            .await
            .unwrap();

        assert!(matches!(a, Admission::Created(_)));
        assert!(matches!(b, Admission::Created(_)));
    }

    #[tokio::test]
    async fn concurrent_admissions_create_exactly_one() {
        let backing = InMemoryTransactionStore::new();
        let store = IdempotencyStore::new(Arc::new(backing.clone()));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .admit(&TenantId::new("tenant-a"), Some("race"), factory("tenant-a", 10_000))
                    .await
                    .unwrap()
            }));
        }

        let mut created = Vec::new();
        let mut existing = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Admission::Created(tx) => created.push(tx.id),
                Admission::Existing(tx) => existing.push(tx.id),
            }
        }

        assert_eq!(created.len(), 1);
        assert!(existing.iter().all(|id| *id == created[0]));
        assert_eq!(backing.transaction_count().await, 1);
    }
}
