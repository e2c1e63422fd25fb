use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use common::{Money, PartnerId, TenantId, TransactionId};
use domain::{CreditLimit, LimitView, Transaction, TransactionStatus};
use tokio::sync::{Mutex, RwLock};

use crate::{
    InsertOutcome, Result, StoreError, TransactionQuery,
    ledger::{
        CreditLedger, ReservationEntry, ReservationState, ReserveOutcome, RestoreOutcome,
        record_reserve, record_restore,
    },
    transactions::TransactionStore,
};

/// In-memory credit ledger for testing and local development.
///
/// Each partner row sits behind its own async mutex, so reserve/restore for
/// one partner are strictly serialized while different partners proceed in
/// parallel. Reservation entries are updated while the row lock is held.
#[derive(Clone, Default)]
pub struct InMemoryCreditLedger {
    rows: Arc<RwLock<HashMap<PartnerId, Arc<Mutex<CreditLimit>>>>>,
    reservations: Arc<std::sync::Mutex<HashMap<TransactionId, ReservationEntry>>>,
    fail_on_reserve: Arc<AtomicBool>,
    fail_on_restore: Arc<AtomicBool>,
}

impl InMemoryCreditLedger {
    /// Creates a new empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent reserve calls fail as if storage were unreachable.
    pub fn set_fail_on_reserve(&self, fail: bool) {
        self.fail_on_reserve.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent restore calls fail as if storage were unreachable.
    pub fn set_fail_on_restore(&self, fail: bool) {
        self.fail_on_restore.store(fail, Ordering::SeqCst);
    }

    /// Returns the number of reservations currently held (not restored).
    pub fn open_reservation_count(&self) -> usize {
        self.with_reservations(|entries| {
            entries
                .values()
                .filter(|e| e.state == ReservationState::Reserved)
                .count()
        })
    }

    /// Overwrites `limit_used` without touching the reservation log.
    ///
    /// Only for exercising integrity-fault paths in tests.
    pub async fn corrupt_used(&self, partner_id: &PartnerId, used: Money) {
        if let Some(row) = self.row(partner_id).await {
            row.lock().await.limit_used = used;
        }
    }

    async fn row(&self, partner_id: &PartnerId) -> Option<Arc<Mutex<CreditLimit>>> {
        self.rows.read().await.get(partner_id).cloned()
    }

    fn with_reservations<R>(
        &self,
        f: impl FnOnce(&mut HashMap<TransactionId, ReservationEntry>) -> R,
    ) -> R {
        let mut guard = self
            .reservations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    fn check_unavailable(flag: &AtomicBool, op: &str) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{op}: simulated storage failure")));
        }
        Ok(())
    }
}

fn mismatch(entry: &ReservationEntry, partner_id: &PartnerId, amount: Money) -> StoreError {
    StoreError::ReservationMismatch {
        tx_id: entry.tx_id,
        recorded_partner: entry.partner_id.clone(),
        recorded_amount: entry.amount,
        requested_partner: partner_id.clone(),
        requested_amount: amount,
    }
}

#[async_trait]
impl CreditLedger for InMemoryCreditLedger {
    async fn open_limit(&self, partner_id: &PartnerId, limit_total: Money) -> Result<LimitView> {
        let mut rows = self.rows.write().await;
        if rows.contains_key(partner_id) {
            return Err(StoreError::PartnerExists(partner_id.clone()));
        }
        let limit = CreditLimit::open(partner_id.clone(), limit_total, Utc::now());
        let view = limit.view();
        rows.insert(partner_id.clone(), Arc::new(Mutex::new(limit)));
        Ok(view)
    }

    async fn reserve(
        &self,
        partner_id: &PartnerId,
        amount: Money,
        tx_id: TransactionId,
    ) -> Result<ReserveOutcome> {
        Self::check_unavailable(&self.fail_on_reserve, "reserve")?;

        let Some(row) = self.row(partner_id).await else {
            let outcome = ReserveOutcome::NotFound;
            record_reserve(&outcome);
            return Ok(outcome);
        };

        // Partner-scoped exclusive lock for the read-check-write sequence.
        let mut limit = row.lock().await;
        let outcome = self.with_reservations(|entries| -> Result<ReserveOutcome> {
            if let Some(entry) = entries.get(&tx_id) {
                if &entry.partner_id != partner_id || entry.amount != amount {
                    return Err(mismatch(entry, partner_id, amount));
                }
                return match entry.state {
                    ReservationState::Reserved => Ok(ReserveOutcome::Reserved(limit.view())),
                    ReservationState::Restored => Err(StoreError::ReservationClosed(tx_id)),
                };
            }

            if !limit.can_reserve(amount) {
                return Ok(ReserveOutcome::InsufficientFunds {
                    available: limit.limit_available,
                });
            }

            let now = Utc::now();
            limit.apply_reserve(amount, now);
            limit.check_balanced()?;
            entries.insert(
                tx_id,
                ReservationEntry {
                    tx_id,
                    partner_id: partner_id.clone(),
                    amount,
                    state: ReservationState::Reserved,
                    reserved_at: now,
                    restored_at: None,
                },
            );
            Ok(ReserveOutcome::Reserved(limit.view()))
        })?;

        record_reserve(&outcome);
        Ok(outcome)
    }

    async fn restore(
        &self,
        partner_id: &PartnerId,
        amount: Money,
        tx_id: TransactionId,
    ) -> Result<RestoreOutcome> {
        Self::check_unavailable(&self.fail_on_restore, "restore")?;

        let Some(row) = self.row(partner_id).await else {
            let outcome = RestoreOutcome::NotFound;
            record_restore(&outcome);
            return Ok(outcome);
        };

        let mut limit = row.lock().await;
        let outcome = self.with_reservations(|entries| -> Result<RestoreOutcome> {
            let Some(entry) = entries.get_mut(&tx_id) else {
                return Ok(RestoreOutcome::NoReservation(limit.view()));
            };
            if &entry.partner_id != partner_id || entry.amount != amount {
                return Err(mismatch(entry, partner_id, amount));
            }
            if entry.state == ReservationState::Restored {
                return Ok(RestoreOutcome::AlreadyRestored(limit.view()));
            }
            if limit.limit_used < amount {
                return Ok(RestoreOutcome::Overrestore {
                    used: limit.limit_used,
                });
            }

            let now = Utc::now();
            limit.apply_restore(amount, now);
            limit.check_balanced()?;
            entry.state = ReservationState::Restored;
            entry.restored_at = Some(now);
            Ok(RestoreOutcome::Restored(limit.view()))
        })?;

        record_restore(&outcome);
        Ok(outcome)
    }

    async fn get_limit(&self, partner_id: &PartnerId) -> Result<Option<LimitView>> {
        match self.row(partner_id).await {
            Some(row) => Ok(Some(row.lock().await.view())),
            None => Ok(None),
        }
    }

    async fn reservation(&self, tx_id: TransactionId) -> Result<Option<ReservationEntry>> {
        Ok(self.with_reservations(|entries| entries.get(&tx_id).cloned()))
    }
}

#[derive(Default)]
struct TransactionTable {
    rows: HashMap<TransactionId, Transaction>,
    idempotency_keys: HashMap<(TenantId, String), TransactionId>,
}

/// In-memory transaction store for testing and local development.
///
/// Row and idempotency mapping are written under one lock, which gives the
/// same all-or-nothing insert as the unique index in PostgreSQL.
#[derive(Clone, Default)]
pub struct InMemoryTransactionStore {
    table: Arc<RwLock<TransactionTable>>,
    fail_on_update: Arc<AtomicBool>,
}

impl InMemoryTransactionStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of transactions stored.
    pub async fn transaction_count(&self) -> usize {
        self.table.read().await.rows.len()
    }

    /// Makes subsequent updates fail as if storage were unreachable.
    pub fn set_fail_on_update(&self, fail: bool) {
        self.fail_on_update.store(fail, Ordering::SeqCst);
    }

    /// Overwrites a row without status checks.
    ///
    /// Lets tests age rows past reconciliation deadlines.
    pub async fn force_put(&self, tx: Transaction) {
        self.table.write().await.rows.insert(tx.id, tx);
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, tx: &Transaction) -> Result<InsertOutcome> {
        let mut table = self.table.write().await;

        if table.rows.contains_key(&tx.id) {
            return Err(StoreError::DuplicateTransaction(tx.id));
        }

        if let Some(ref key) = tx.idempotency_key {
            let mapping = (tx.tenant_id.clone(), key.clone());
            if let Some(existing_id) = table.idempotency_keys.get(&mapping) {
                let existing = table
                    .rows
                    .get(existing_id)
                    .cloned()
                    .ok_or(StoreError::TransactionNotFound(*existing_id))?;
                return Ok(InsertOutcome::Conflict(existing));
            }
            table.idempotency_keys.insert(mapping, tx.id);
        }

        table.rows.insert(tx.id, tx.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn update(&self, tx: &Transaction, expected: TransactionStatus) -> Result<()> {
        if self.fail_on_update.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "update: simulated storage failure".to_string(),
            ));
        }

        let mut table = self.table.write().await;
        let current = table
            .rows
            .get_mut(&tx.id)
            .ok_or(StoreError::TransactionNotFound(tx.id))?;

        if current.status != expected {
            return Err(StoreError::StatusConflict {
                tx_id: tx.id,
                expected,
                actual: current.status,
            });
        }

        *current = tx.clone();
        Ok(())
    }

    async fn get(&self, tenant_id: &TenantId, tx_id: TransactionId) -> Result<Option<Transaction>> {
        let table = self.table.read().await;
        Ok(table
            .rows
            .get(&tx_id)
            .filter(|tx| &tx.tenant_id == tenant_id)
            .cloned())
    }

    async fn get_by_id(&self, tx_id: TransactionId) -> Result<Option<Transaction>> {
        Ok(self.table.read().await.rows.get(&tx_id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<Transaction>> {
        let table = self.table.read().await;
        let mapping = (tenant_id.clone(), key.to_string());
        Ok(table
            .idempotency_keys
            .get(&mapping)
            .and_then(|id| table.rows.get(id))
            .cloned())
    }

    async fn query(&self, query: TransactionQuery) -> Result<Vec<Transaction>> {
        let table = self.table.read().await;
        let mut rows: Vec<_> = table
            .rows
            .values()
            .filter(|tx| query.matches(tx))
            .cloned()
            .collect();
        rows.sort_by_key(|tx| (tx.updated_at, tx.id));
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use domain::{CreateTransaction, FeeSchedule};

    fn partner() -> PartnerId {
        PartnerId::new("partner-1")
    }

    async fn ledger_with(total: i64) -> InMemoryCreditLedger {
        let ledger = InMemoryCreditLedger::new();
        ledger
            .open_limit(&partner(), Money::from_minor(total))
            .await
            .unwrap();
        ledger
    }

    fn make_tx(key: Option<&str>) -> Transaction {
        let mut req = CreateTransaction::new(
            "tenant-a",
            "partner-1",
            "PLN50",
            "5512345678",
            Money::from_minor(50_000),
        );
        if let Some(key) = key {
            req = req.with_idempotency_key(key);
        }
        let fees = FeeSchedule::default().apply(req.amount).unwrap();
        Transaction::pending(&req, fees, "mock_provider", Utc::now())
    }

    #[tokio::test]
    async fn open_limit_twice_is_rejected() {
        let ledger = ledger_with(100_000).await;
        let result = ledger.open_limit(&partner(), Money::from_minor(5)).await;
        assert!(matches!(result, Err(StoreError::PartnerExists(_))));
    }

    #[tokio::test]
    async fn reserve_reduces_available() {
        let ledger = ledger_with(100_000).await;
        let outcome = ledger
            .reserve(&partner(), Money::from_minor(51_250), TransactionId::new())
            .await
            .unwrap();

        let ReserveOutcome::Reserved(view) = outcome else {
            panic!("expected reservation, got {outcome:?}");
        };
        assert_eq!(view.limit_available, Money::from_minor(48_750));
        assert_eq!(view.limit_used, Money::from_minor(51_250));
    }

    #[tokio::test]
    async fn reserve_insufficient_funds_leaves_limit_untouched() {
        let ledger = ledger_with(48_750).await;
        let outcome = ledger
            .reserve(&partner(), Money::from_minor(61_500), TransactionId::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ReserveOutcome::InsufficientFunds {
                available: Money::from_minor(48_750)
            }
        );
        let view = ledger.get_limit(&partner()).await.unwrap().unwrap();
        assert_eq!(view.limit_available, Money::from_minor(48_750));
        assert_eq!(ledger.open_reservation_count(), 0);
    }

    #[tokio::test]
    async fn reserve_unknown_partner() {
        let ledger = InMemoryCreditLedger::new();
        let outcome = ledger
            .reserve(&partner(), Money::from_minor(1), TransactionId::new())
            .await
            .unwrap();
        assert_eq!(outcome, ReserveOutcome::NotFound);
    }

    #[tokio::test]
    async fn reserve_replay_does_not_double_reserve() {
        let ledger = ledger_with(100_000).await;
        let tx_id = TransactionId::new();
        let amount = Money::from_minor(10_000);

        ledger.reserve(&partner(), amount, tx_id).await.unwrap();
        ledger.reserve(&partner(), amount, tx_id).await.unwrap();

        let view = ledger.get_limit(&partner()).await.unwrap().unwrap();
        assert_eq!(view.limit_available, Money::from_minor(90_000));
    }

    #[tokio::test]
    async fn restore_is_idempotent() {
        let ledger = ledger_with(100_000).await;
        let tx_id = TransactionId::new();
        let amount = Money::from_minor(51_250);
        ledger.reserve(&partner(), amount, tx_id).await.unwrap();

        let first = ledger.restore(&partner(), amount, tx_id).await.unwrap();
        let second = ledger.restore(&partner(), amount, tx_id).await.unwrap();

        assert!(matches!(first, RestoreOutcome::Restored(_)));
        assert!(matches!(second, RestoreOutcome::AlreadyRestored(_)));
        let view = ledger.get_limit(&partner()).await.unwrap().unwrap();
        assert_eq!(view.limit_available, Money::from_minor(100_000));
        assert_eq!(view.limit_used, Money::zero());
    }

    #[tokio::test]
    async fn restore_without_reservation_is_a_no_op() {
        let ledger = ledger_with(100_000).await;
        let outcome = ledger
            .restore(&partner(), Money::from_minor(500), TransactionId::new())
            .await
            .unwrap();
        assert!(matches!(outcome, RestoreOutcome::NoReservation(_)));
        let view = outcome.view().unwrap();
        assert_eq!(view.limit_available, Money::from_minor(100_000));
    }

    #[tokio::test]
    async fn reserve_after_restore_is_closed() {
        let ledger = ledger_with(100_000).await;
        let tx_id = TransactionId::new();
        let amount = Money::from_minor(1_000);
        ledger.reserve(&partner(), amount, tx_id).await.unwrap();
        ledger.restore(&partner(), amount, tx_id).await.unwrap();

        let result = ledger.reserve(&partner(), amount, tx_id).await;
        assert!(matches!(result, Err(StoreError::ReservationClosed(_))));
    }

    #[tokio::test]
    async fn restore_amount_mismatch_is_integrity_fault() {
        let ledger = ledger_with(100_000).await;
        let tx_id = TransactionId::new();
        ledger
            .reserve(&partner(), Money::from_minor(1_000), tx_id)
            .await
            .unwrap();

        let err = ledger
            .restore(&partner(), Money::from_minor(2_000), tx_id)
            .await
            .unwrap_err();
        assert!(err.is_integrity_fault());
    }

    #[tokio::test]
    async fn overrestore_is_reported_without_mutation() {
        let ledger = ledger_with(100_000).await;
        let tx_id = TransactionId::new();
        let amount = Money::from_minor(1_000);
        ledger.reserve(&partner(), amount, tx_id).await.unwrap();
        ledger.corrupt_used(&partner(), Money::from_minor(10)).await;

        let outcome = ledger.restore(&partner(), amount, tx_id).await.unwrap();
        assert_eq!(
            outcome,
            RestoreOutcome::Overrestore {
                used: Money::from_minor(10)
            }
        );
        let entry = ledger.reservation(tx_id).await.unwrap().unwrap();
        assert_eq!(entry.state, ReservationState::Reserved);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reserves_are_serialized() {
        let ledger = ledger_with(100_000).await;
        let amount = Money::from_minor(7_000);

        let handles: Vec<_> = (0..40)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger
                        .reserve(&partner(), amount, TransactionId::new())
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut reserved = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ReserveOutcome::Reserved(_) => reserved += 1,
                ReserveOutcome::InsufficientFunds { .. } => rejected += 1,
                ReserveOutcome::NotFound => panic!("partner vanished"),
            }
        }

        assert_eq!(reserved, 100_000 / 7_000);
        assert_eq!(rejected, 40 - 100_000 / 7_000);
        let view = ledger.get_limit(&partner()).await.unwrap().unwrap();
        assert_eq!(
            view.limit_available,
            Money::from_minor(100_000 - 7_000 * (100_000 / 7_000))
        );
        assert_eq!(
            view.limit_used.as_minor() + view.limit_available.as_minor(),
            view.limit_total.as_minor()
        );
    }

    #[tokio::test]
    async fn simulated_restore_failure() {
        let ledger = ledger_with(100_000).await;
        ledger.set_fail_on_restore(true);
        let result = ledger
            .restore(&partner(), Money::from_minor(1), TransactionId::new())
            .await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }

    #[tokio::test]
    async fn insert_and_get_scoped_by_tenant() {
        let store = InMemoryTransactionStore::new();
        let tx = make_tx(None);
        assert_eq!(store.insert(&tx).await.unwrap(), InsertOutcome::Inserted);

        let found = store.get(&tx.tenant_id, tx.id).await.unwrap();
        assert_eq!(found, Some(tx.clone()));

        let other_tenant = store.get(&TenantId::new("tenant-b"), tx.id).await.unwrap();
        assert!(other_tenant.is_none());
    }

    #[tokio::test]
    async fn duplicate_idempotency_key_returns_existing() {
        let store = InMemoryTransactionStore::new();
        let first = make_tx(Some("key-1"));
        let second = make_tx(Some("key-1"));

        store.insert(&first).await.unwrap();
        let outcome = store.insert(&second).await.unwrap();

        assert_eq!(outcome, InsertOutcome::Conflict(first.clone()));
        assert_eq!(store.transaction_count().await, 1);
        let by_key = store
            .find_by_idempotency_key(&first.tenant_id, "key-1")
            .await
            .unwrap();
        assert_eq!(by_key.map(|t| t.id), Some(first.id));
    }

    #[tokio::test]
    async fn same_key_different_tenants_do_not_collide() {
        let store = InMemoryTransactionStore::new();
        let first = make_tx(Some("key-1"));
        let mut second = make_tx(Some("key-1"));
        second.tenant_id = TenantId::new("tenant-b");

        store.insert(&first).await.unwrap();
        assert_eq!(store.insert(&second).await.unwrap(), InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn update_is_compare_and_set() {
        let store = InMemoryTransactionStore::new();
        let mut tx = make_tx(None);
        store.insert(&tx).await.unwrap();

        tx.mark_reserved(Utc::now()).unwrap();
        store.update(&tx, TransactionStatus::Pending).await.unwrap();

        let err = store
            .update(&tx, TransactionStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::StatusConflict {
                actual: TransactionStatus::Reserved,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn query_orders_by_updated_at_and_limits() {
        let store = InMemoryTransactionStore::new();
        let mut older = make_tx(None);
        older.updated_at = Utc::now() - Duration::minutes(10);
        let newer = make_tx(None);
        store.insert(&newer).await.unwrap();
        store.insert(&older).await.unwrap();

        let rows = store
            .query(TransactionQuery::for_status(TransactionStatus::Pending).limit(1))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, older.id);
    }
}
