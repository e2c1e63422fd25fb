//! Transaction store seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{PartnerId, TenantId, TransactionId};
use domain::{HintKind, Transaction, TransactionStatus};

use crate::{Result, TransactionQuery};

/// Outcome of inserting a new transaction row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The row (and its idempotency mapping, if any) was created.
    Inserted,
    /// Another transaction already owns `(tenant_id, idempotency_key)`.
    /// Carries that transaction's current state.
    Conflict(Transaction),
}

/// Persistence for transaction rows.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Inserts a `Pending` row.
    ///
    /// When the row carries an idempotency key, uniqueness of
    /// `(tenant_id, idempotency_key)` is enforced atomically with the insert.
    async fn insert(&self, tx: &Transaction) -> Result<InsertOutcome>;

    /// Overwrites the row with `tx` if its stored status is still `expected`.
    ///
    /// Fails with `StatusConflict` if another actor moved it first.
    async fn update(&self, tx: &Transaction, expected: TransactionStatus) -> Result<()>;

    /// Loads a transaction scoped to its tenant.
    async fn get(&self, tenant_id: &TenantId, tx_id: TransactionId) -> Result<Option<Transaction>>;

    /// Loads a transaction by id regardless of tenant (reconciliation only).
    async fn get_by_id(&self, tx_id: TransactionId) -> Result<Option<Transaction>>;

    /// Looks up the transaction owning an idempotency key.
    async fn find_by_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<Transaction>>;

    /// Returns rows matching the query, oldest `updated_at` first.
    async fn query(&self, query: TransactionQuery) -> Result<Vec<Transaction>>;
}

/// Extension trait providing convenience queries.
#[async_trait]
pub trait TransactionStoreExt: TransactionStore {
    /// Rows in `status` not touched since `cutoff`.
    async fn stale(
        &self,
        status: TransactionStatus,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        self.query(
            TransactionQuery::for_status(status)
                .updated_before(cutoff)
                .limit(limit),
        )
        .await
    }

    /// Settled rows carrying a void hint not touched since `cutoff`.
    async fn stale_voids(
        &self,
        kind: HintKind,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Transaction>> {
        self.query(
            TransactionQuery::for_status(TransactionStatus::Success)
                .hint(kind)
                .updated_before(cutoff)
                .limit(limit),
        )
        .await
    }

    /// Settled transactions of a partner created in `[from, to)`.
    ///
    /// This is the read-only feed for invoice aggregation.
    async fn list_settled(
        &self,
        partner_id: &PartnerId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Transaction>> {
        self.query(
            TransactionQuery::for_status(TransactionStatus::Success)
                .partner_id(partner_id.clone())
                .created_from(from)
                .created_before(to),
        )
        .await
    }
}

impl<T: TransactionStore + ?Sized> TransactionStoreExt for T {}
