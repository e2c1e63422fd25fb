use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Money, PartnerId, TenantId, TransactionId};
use domain::{
    CreditLimit, HintKind, LimitView, ReconcileHint, Transaction, TransactionStatus,
};
use sqlx::{PgPool, Postgres, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{
    InsertOutcome, Result, StoreError, TransactionQuery,
    ledger::{
        CreditLedger, ReservationEntry, ReservationState, ReserveOutcome, RestoreOutcome,
        record_reserve, record_restore,
    },
    transactions::TransactionStore,
};

const IDEMPOTENCY_CONSTRAINT: &str = "transactions_tenant_idempotency_key";
const TRANSACTION_PKEY: &str = "transactions_pkey";

const TRANSACTION_COLUMNS: &str = "id, tenant_id, partner_id, product_code, customer_no, amount, fee, total, status, provider, provider_tx_id, idempotency_key, failure_reason, hint_kind, hint_detail, hint_since, created_at, updated_at";

/// Runs the database migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

/// PostgreSQL-backed credit ledger.
///
/// Reserve and restore lock the partner's `credit_limits` row with
/// `SELECT ... FOR UPDATE` and write the limit and its reservation entry in
/// one database transaction.
#[derive(Clone)]
pub struct PostgresCreditLedger {
    pool: PgPool,
}

impl PostgresCreditLedger {
    /// Creates a new PostgreSQL credit ledger.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_limit(row: &PgRow) -> Result<CreditLimit> {
        Ok(CreditLimit {
            partner_id: PartnerId::new(row.try_get::<String, _>("partner_id")?),
            limit_total: Money::from_minor(row.try_get("limit_total")?),
            limit_used: Money::from_minor(row.try_get("limit_used")?),
            limit_available: Money::from_minor(row.try_get("limit_available")?),
            version: row.try_get("version")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_reservation(row: &PgRow) -> Result<ReservationEntry> {
        let state: String = row.try_get("state")?;
        let state = match state.as_str() {
            "reserved" => ReservationState::Reserved,
            "restored" => ReservationState::Restored,
            other => {
                return Err(StoreError::Corrupt(format!(
                    "unknown reservation state: {other}"
                )));
            }
        };
        Ok(ReservationEntry {
            tx_id: TransactionId::from_uuid(row.try_get::<Uuid, _>("tx_id")?),
            partner_id: PartnerId::new(row.try_get::<String, _>("partner_id")?),
            amount: Money::from_minor(row.try_get("amount")?),
            state,
            reserved_at: row.try_get("reserved_at")?,
            restored_at: row.try_get("restored_at")?,
        })
    }

    async fn lock_limit(
        conn: &mut sqlx::PgConnection,
        partner_id: &PartnerId,
    ) -> Result<Option<CreditLimit>> {
        let row = sqlx::query(
            r#"
            SELECT partner_id, limit_total, limit_used, limit_available, version, updated_at
            FROM credit_limits
            WHERE partner_id = $1
            FOR UPDATE
            "#,
        )
        .bind(partner_id.as_str())
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(Self::row_to_limit).transpose()
    }

    async fn load_reservation(
        conn: &mut sqlx::PgConnection,
        tx_id: TransactionId,
    ) -> Result<Option<ReservationEntry>> {
        let row = sqlx::query(
            r#"
            SELECT tx_id, partner_id, amount, state, reserved_at, restored_at
            FROM credit_reservations
            WHERE tx_id = $1
            "#,
        )
        .bind(tx_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;

        row.as_ref().map(Self::row_to_reservation).transpose()
    }

    async fn write_limit(conn: &mut sqlx::PgConnection, limit: &CreditLimit) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE credit_limits
            SET limit_used = $1, limit_available = $2, version = $3, updated_at = $4
            WHERE partner_id = $5
            "#,
        )
        .bind(limit.limit_used.as_minor())
        .bind(limit.limit_available.as_minor())
        .bind(limit.version)
        .bind(limit.updated_at)
        .bind(limit.partner_id.as_str())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }
}

fn check_entry(entry: &ReservationEntry, partner_id: &PartnerId, amount: Money) -> Result<()> {
    if &entry.partner_id != partner_id || entry.amount != amount {
        return Err(StoreError::ReservationMismatch {
            tx_id: entry.tx_id,
            recorded_partner: entry.partner_id.clone(),
            recorded_amount: entry.amount,
            requested_partner: partner_id.clone(),
            requested_amount: amount,
        });
    }
    Ok(())
}

#[async_trait]
impl CreditLedger for PostgresCreditLedger {
    async fn open_limit(&self, partner_id: &PartnerId, limit_total: Money) -> Result<LimitView> {
        let limit = CreditLimit::open(partner_id.clone(), limit_total, Utc::now());
        let result = sqlx::query(
            r#"
            INSERT INTO credit_limits (partner_id, limit_total, limit_used, limit_available, version, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (partner_id) DO NOTHING
            "#,
        )
        .bind(partner_id.as_str())
        .bind(limit.limit_total.as_minor())
        .bind(limit.limit_used.as_minor())
        .bind(limit.limit_available.as_minor())
        .bind(limit.version)
        .bind(limit.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::PartnerExists(partner_id.clone()));
        }
        Ok(limit.view())
    }

    #[tracing::instrument(skip(self), fields(partner_id = %partner_id, %tx_id))]
    async fn reserve(
        &self,
        partner_id: &PartnerId,
        amount: Money,
        tx_id: TransactionId,
    ) -> Result<ReserveOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(mut limit) = Self::lock_limit(&mut tx, partner_id).await? else {
            let outcome = ReserveOutcome::NotFound;
            record_reserve(&outcome);
            return Ok(outcome);
        };

        if let Some(entry) = Self::load_reservation(&mut tx, tx_id).await? {
            check_entry(&entry, partner_id, amount)?;
            return match entry.state {
                ReservationState::Reserved => {
                    let outcome = ReserveOutcome::Reserved(limit.view());
                    record_reserve(&outcome);
                    Ok(outcome)
                }
                ReservationState::Restored => Err(StoreError::ReservationClosed(tx_id)),
            };
        }

        if !limit.can_reserve(amount) {
            let outcome = ReserveOutcome::InsufficientFunds {
                available: limit.limit_available,
            };
            record_reserve(&outcome);
            return Ok(outcome);
        }

        let now = Utc::now();
        limit.apply_reserve(amount, now);
        limit.check_balanced()?;
        Self::write_limit(&mut tx, &limit).await?;

        sqlx::query(
            r#"
            INSERT INTO credit_reservations (tx_id, partner_id, amount, state, reserved_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(tx_id.as_uuid())
        .bind(partner_id.as_str())
        .bind(amount.as_minor())
        .bind(ReservationState::Reserved.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        let outcome = ReserveOutcome::Reserved(limit.view());
        record_reserve(&outcome);
        Ok(outcome)
    }

    #[tracing::instrument(skip(self), fields(partner_id = %partner_id, %tx_id))]
    async fn restore(
        &self,
        partner_id: &PartnerId,
        amount: Money,
        tx_id: TransactionId,
    ) -> Result<RestoreOutcome> {
        let mut tx = self.pool.begin().await?;

        let Some(mut limit) = Self::lock_limit(&mut tx, partner_id).await? else {
            let outcome = RestoreOutcome::NotFound;
            record_restore(&outcome);
            return Ok(outcome);
        };

        let outcome = match Self::load_reservation(&mut tx, tx_id).await? {
            None => RestoreOutcome::NoReservation(limit.view()),
            Some(entry) => {
                check_entry(&entry, partner_id, amount)?;
                if entry.state == ReservationState::Restored {
                    RestoreOutcome::AlreadyRestored(limit.view())
                } else if limit.limit_used < amount {
                    RestoreOutcome::Overrestore {
                        used: limit.limit_used,
                    }
                } else {
                    let now = Utc::now();
                    limit.apply_restore(amount, now);
                    limit.check_balanced()?;
                    Self::write_limit(&mut tx, &limit).await?;

                    sqlx::query(
                        "UPDATE credit_reservations SET state = $1, restored_at = $2 WHERE tx_id = $3",
                    )
                    .bind(ReservationState::Restored.as_str())
                    .bind(now)
                    .bind(tx_id.as_uuid())
                    .execute(&mut *tx)
                    .await?;

                    tx.commit().await?;
                    RestoreOutcome::Restored(limit.view())
                }
            }
        };

        record_restore(&outcome);
        Ok(outcome)
    }

    async fn get_limit(&self, partner_id: &PartnerId) -> Result<Option<LimitView>> {
        let row = sqlx::query(
            r#"
            SELECT partner_id, limit_total, limit_used, limit_available, version, updated_at
            FROM credit_limits
            WHERE partner_id = $1
            "#,
        )
        .bind(partner_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row
            .as_ref()
            .map(Self::row_to_limit)
            .transpose()?
            .map(|limit| limit.view()))
    }

    async fn reservation(&self, tx_id: TransactionId) -> Result<Option<ReservationEntry>> {
        let mut conn = self.pool.acquire().await?;
        Self::load_reservation(&mut conn, tx_id).await
    }
}

/// PostgreSQL-backed transaction store.
#[derive(Clone)]
pub struct PostgresTransactionStore {
    pool: PgPool,
}

impl PostgresTransactionStore {
    /// Creates a new PostgreSQL transaction store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_transaction(row: PgRow) -> Result<Transaction> {
        let status: String = row.try_get("status")?;
        let hint_kind: Option<String> = row.try_get("hint_kind")?;
        let hint = match hint_kind {
            Some(kind) => {
                let kind = HintKind::parse(&kind)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown hint kind: {kind}")))?;
                let since: Option<DateTime<Utc>> = row.try_get("hint_since")?;
                Some(ReconcileHint {
                    kind,
                    detail: row
                        .try_get::<Option<String>, _>("hint_detail")?
                        .unwrap_or_default(),
                    since: since.ok_or_else(|| {
                        StoreError::Corrupt("hint without timestamp".to_string())
                    })?,
                })
            }
            None => None,
        };

        Ok(Transaction {
            id: TransactionId::from_uuid(row.try_get::<Uuid, _>("id")?),
            tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
            partner_id: PartnerId::new(row.try_get::<String, _>("partner_id")?),
            product_code: row.try_get("product_code")?,
            customer_no: row.try_get("customer_no")?,
            amount: Money::from_minor(row.try_get("amount")?),
            fee: Money::from_minor(row.try_get("fee")?),
            total: Money::from_minor(row.try_get("total")?),
            status: status.parse::<TransactionStatus>()?,
            provider: row.try_get("provider")?,
            provider_tx_id: row.try_get("provider_tx_id")?,
            idempotency_key: row.try_get("idempotency_key")?,
            failure_reason: row.try_get("failure_reason")?,
            hint,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn current_status(&self, tx_id: TransactionId) -> Result<Option<TransactionStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM transactions WHERE id = $1")
                .bind(tx_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        status
            .map(|s| s.parse::<TransactionStatus>().map_err(StoreError::from))
            .transpose()
    }
}

#[async_trait]
impl TransactionStore for PostgresTransactionStore {
    async fn insert(&self, tx: &Transaction) -> Result<InsertOutcome> {
        let hint = tx.hint.as_ref();
        let result = sqlx::query(&format!(
            "INSERT INTO transactions ({TRANSACTION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
        ))
        .bind(tx.id.as_uuid())
        .bind(tx.tenant_id.as_str())
        .bind(tx.partner_id.as_str())
        .bind(&tx.product_code)
        .bind(&tx.customer_no)
        .bind(tx.amount.as_minor())
        .bind(tx.fee.as_minor())
        .bind(tx.total.as_minor())
        .bind(tx.status.as_str())
        .bind(&tx.provider)
        .bind(&tx.provider_tx_id)
        .bind(&tx.idempotency_key)
        .bind(&tx.failure_reason)
        .bind(hint.map(|h| h.kind.as_str()))
        .bind(hint.map(|h| h.detail.as_str()))
        .bind(hint.map(|h| h.since))
        .bind(tx.created_at)
        .bind(tx.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(sqlx::Error::Database(ref db_err))
                if db_err.constraint() == Some(IDEMPOTENCY_CONSTRAINT) =>
            {
                let key = tx.idempotency_key.as_deref().unwrap_or_default();
                let existing = self
                    .find_by_idempotency_key(&tx.tenant_id, key)
                    .await?
                    .ok_or_else(|| {
                        StoreError::Corrupt(format!(
                            "idempotency key {key} conflicted but no owner row was found"
                        ))
                    })?;
                Ok(InsertOutcome::Conflict(existing))
            }
            Err(sqlx::Error::Database(ref db_err))
                if db_err.constraint() == Some(TRANSACTION_PKEY) =>
            {
                Err(StoreError::DuplicateTransaction(tx.id))
            }
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    async fn update(&self, tx: &Transaction, expected: TransactionStatus) -> Result<()> {
        let hint = tx.hint.as_ref();
        let result = sqlx::query(
            r#"
            UPDATE transactions
            SET status = $1, provider_tx_id = $2, failure_reason = $3,
                hint_kind = $4, hint_detail = $5, hint_since = $6, updated_at = $7
            WHERE id = $8 AND status = $9
            "#,
        )
        .bind(tx.status.as_str())
        .bind(&tx.provider_tx_id)
        .bind(&tx.failure_reason)
        .bind(hint.map(|h| h.kind.as_str()))
        .bind(hint.map(|h| h.detail.as_str()))
        .bind(hint.map(|h| h.since))
        .bind(tx.updated_at)
        .bind(tx.id.as_uuid())
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.current_status(tx.id).await? {
            Some(actual) => Err(StoreError::StatusConflict {
                tx_id: tx.id,
                expected,
                actual,
            }),
            None => Err(StoreError::TransactionNotFound(tx.id)),
        }
    }

    async fn get(&self, tenant_id: &TenantId, tx_id: TransactionId) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1 AND tenant_id = $2"
        ))
        .bind(tx_id.as_uuid())
        .bind(tenant_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_transaction).transpose()
    }

    async fn get_by_id(&self, tx_id: TransactionId) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(tx_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_transaction).transpose()
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: &TenantId,
        key: &str,
    ) -> Result<Option<Transaction>> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE tenant_id = $1 AND idempotency_key = $2"
        ))
        .bind(tenant_id.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_transaction).transpose()
    }

    async fn query(&self, query: TransactionQuery) -> Result<Vec<Transaction>> {
        let mut sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE 1=1");
        let mut param_count = 0;

        // Build dynamic query
        if query.status.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ${param_count}"));
        }
        if query.tenant_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND tenant_id = ${param_count}"));
        }
        if query.partner_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND partner_id = ${param_count}"));
        }
        if query.hint.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND hint_kind = ${param_count}"));
        }
        if query.updated_before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND updated_at < ${param_count}"));
        }
        if query.created_from.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND created_at >= ${param_count}"));
        }
        if query.created_before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND created_at < ${param_count}"));
        }

        sql.push_str(" ORDER BY updated_at ASC, id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }

        let mut sqlx_query = sqlx::query::<Postgres>(&sql);

        if let Some(status) = query.status {
            sqlx_query = sqlx_query.bind(status.as_str());
        }
        if let Some(tenant_id) = query.tenant_id {
            sqlx_query = sqlx_query.bind(tenant_id.as_str().to_string());
        }
        if let Some(partner_id) = query.partner_id {
            sqlx_query = sqlx_query.bind(partner_id.as_str().to_string());
        }
        if let Some(kind) = query.hint {
            sqlx_query = sqlx_query.bind(kind.as_str());
        }
        if let Some(cutoff) = query.updated_before {
            sqlx_query = sqlx_query.bind(cutoff);
        }
        if let Some(from) = query.created_from {
            sqlx_query = sqlx_query.bind(from);
        }
        if let Some(to) = query.created_before {
            sqlx_query = sqlx_query.bind(to);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }

        let rows = sqlx_query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_transaction).collect()
    }
}
