//! PostgreSQL integration tests
//!
//! These tests share one PostgreSQL container and need a Docker daemon.
//! Run with:
//!
//! ```bash
//! cargo test -p store --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{Money, PartnerId, TenantId, TransactionId};
use domain::{CreateTransaction, FeeSchedule, HintKind, Transaction, TransactionStatus};
use serial_test::serial;
use sqlx::PgPool;
use store::{
    CreditLedger, InsertOutcome, PostgresCreditLedger, PostgresTransactionStore, ReserveOutcome,
    RestoreOutcome, StoreError, TransactionStore, TransactionStoreExt,
};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/001_create_ppob_tables.sql"))
                .execute(&temp_pool)
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Fresh pool with cleared tables
async fn get_test_pool() -> PgPool {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE credit_reservations, credit_limits, transactions")
        .execute(&pool)
        .await
        .unwrap();

    pool
}

fn pending(tenant: &str, key: Option<&str>) -> Transaction {
    let mut req = CreateTransaction::new(
        TenantId::new(tenant),
        PartnerId::new("partner-1"),
        "PLN50",
        "5300001",
        Money::from_minor(50_000),
    );
    if let Some(key) = key {
        req = req.with_idempotency_key(key);
    }
    let fees = FeeSchedule::default().apply(req.amount).unwrap();
    Transaction::pending(&req, fees, "mock", Utc::now())
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn reserve_and_restore_round_trip() {
    let ledger = PostgresCreditLedger::new(get_test_pool().await);
    let partner = PartnerId::new("partner-1");
    ledger
        .open_limit(&partner, Money::from_minor(100_000))
        .await
        .unwrap();

    let tx_id = TransactionId::new();
    let reserved = ledger
        .reserve(&partner, Money::from_minor(51_250), tx_id)
        .await
        .unwrap();
    let ReserveOutcome::Reserved(view) = reserved else {
        panic!("expected reservation, got {reserved:?}");
    };
    assert_eq!(view.limit_available, Money::from_minor(48_750));

    let restored = ledger
        .restore(&partner, Money::from_minor(51_250), tx_id)
        .await
        .unwrap();
    assert!(matches!(restored, RestoreOutcome::Restored(_)));

    let again = ledger
        .restore(&partner, Money::from_minor(51_250), tx_id)
        .await
        .unwrap();
    assert!(matches!(again, RestoreOutcome::AlreadyRestored(_)));

    let view = ledger.get_limit(&partner).await.unwrap().unwrap();
    assert_eq!(view.limit_used, Money::zero());
    assert_eq!(view.limit_available, Money::from_minor(100_000));
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn insufficient_funds_leaves_limit_untouched() {
    let ledger = PostgresCreditLedger::new(get_test_pool().await);
    let partner = PartnerId::new("partner-1");
    ledger
        .open_limit(&partner, Money::from_minor(50_000))
        .await
        .unwrap();

    let outcome = ledger
        .reserve(&partner, Money::from_minor(61_500), TransactionId::new())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        ReserveOutcome::InsufficientFunds {
            available: Money::from_minor(50_000)
        }
    );
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn duplicate_partner_is_rejected() {
    let ledger = PostgresCreditLedger::new(get_test_pool().await);
    let partner = PartnerId::new("partner-1");
    ledger
        .open_limit(&partner, Money::from_minor(1_000))
        .await
        .unwrap();

    let result = ledger.open_limit(&partner, Money::from_minor(1_000)).await;
    assert!(matches!(result, Err(StoreError::PartnerExists(_))));
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn concurrent_reserves_never_overdraw() {
    let ledger = PostgresCreditLedger::new(get_test_pool().await);
    let partner = PartnerId::new("partner-1");
    ledger
        .open_limit(&partner, Money::from_minor(100_000))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..20 {
        let ledger = ledger.clone();
        let partner = partner.clone();
        handles.push(tokio::spawn(async move {
            ledger
                .reserve(&partner, Money::from_minor(7_000), TransactionId::new())
                .await
                .unwrap()
        }));
    }

    let mut reserved = 0;
    for handle in handles {
        if matches!(handle.await.unwrap(), ReserveOutcome::Reserved(_)) {
            reserved += 1;
        }
    }
    assert_eq!(reserved, 14);

    let view = ledger.get_limit(&partner).await.unwrap().unwrap();
    assert_eq!(view.limit_used, Money::from_minor(98_000));
    assert_eq!(view.limit_available, Money::from_minor(2_000));
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn idempotency_key_conflict_returns_owner() {
    let store = PostgresTransactionStore::new(get_test_pool().await);

    let first = pending("tenant-a", Some("key-1"));
    assert_eq!(store.insert(&first).await.unwrap(), InsertOutcome::Inserted);

    let second = pending("tenant-a", Some("key-1"));
    match store.insert(&second).await.unwrap() {
        InsertOutcome::Conflict(existing) => assert_eq!(existing.id, first.id),
        other => panic!("expected conflict, got {other:?}"),
    }

    // Keys are scoped per tenant.
    let other_tenant = pending("tenant-b", Some("key-1"));
    assert_eq!(
        store.insert(&other_tenant).await.unwrap(),
        InsertOutcome::Inserted
    );
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn update_is_compare_and_set_on_status() {
    let store = PostgresTransactionStore::new(get_test_pool().await);

    let mut tx = pending("tenant-a", None);
    store.insert(&tx).await.unwrap();

    tx.mark_reserved(Utc::now()).unwrap();
    tx.mark_awaiting_confirmation("provider timeout", Utc::now())
        .unwrap();
    store.update(&tx, TransactionStatus::Pending).await.unwrap();

    let loaded = store.get(&tx.tenant_id, tx.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TransactionStatus::Reserved);
    assert_eq!(loaded.hint_kind(), Some(HintKind::AwaitingConfirmation));

    let result = store.update(&tx, TransactionStatus::Pending).await;
    assert!(matches!(
        result,
        Err(StoreError::StatusConflict {
            actual: TransactionStatus::Reserved,
            ..
        })
    ));

    let hidden = store
        .get(&TenantId::new("tenant-b"), tx.id)
        .await
        .unwrap();
    assert!(hidden.is_none());
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn void_marker_is_persisted_and_queryable() {
    let store = PostgresTransactionStore::new(get_test_pool().await);

    let mut tx = pending("tenant-a", None);
    store.insert(&tx).await.unwrap();
    tx.mark_reserved(Utc::now()).unwrap();
    tx.mark_settled("MOCK-7", Utc::now()).unwrap();
    store.update(&tx, TransactionStatus::Pending).await.unwrap();
    tx.mark_void_requested(Utc::now()).unwrap();
    store.update(&tx, TransactionStatus::Success).await.unwrap();

    let loaded = store.get_by_id(tx.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, TransactionStatus::Success);
    assert_eq!(loaded.hint_kind(), Some(HintKind::VoidRequested));

    let cutoff = Utc::now() + Duration::seconds(1);
    let voids = store
        .stale_voids(HintKind::VoidRequested, cutoff, 100)
        .await
        .unwrap();
    assert!(voids.iter().any(|t| t.id == tx.id));
    let compensations = store
        .stale_voids(HintKind::AwaitingCompensation, cutoff, 100)
        .await
        .unwrap();
    assert!(compensations.iter().all(|t| t.id != tx.id));
}

#[tokio::test]
#[serial]
#[ignore = "requires a Docker daemon for testcontainers"]
async fn stale_query_filters_by_status_and_age() {
    let store = PostgresTransactionStore::new(get_test_pool().await);

    let mut old = pending("tenant-a", None);
    old.created_at = Utc::now() - Duration::minutes(10);
    old.updated_at = old.created_at;
    store.insert(&old).await.unwrap();

    let fresh = pending("tenant-a", None);
    store.insert(&fresh).await.unwrap();

    let stale = store
        .stale(
            TransactionStatus::Pending,
            Utc::now() - Duration::minutes(1),
            10,
        )
        .await
        .unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].id, old.id);
}
