use chrono::{DateTime, Utc};
use common::{PartnerId, TenantId};
use domain::{HintKind, Transaction, TransactionStatus};

/// Builder for transaction queries.
///
/// Used by the reconciler to find stale rows and by billing to read settled
/// transactions for a period.
#[derive(Debug, Clone, Default)]
pub struct TransactionQuery {
    /// Filter by status.
    pub status: Option<TransactionStatus>,

    /// Filter by tenant.
    pub tenant_id: Option<TenantId>,

    /// Filter by partner.
    pub partner_id: Option<PartnerId>,

    /// Filter by reconciliation hint.
    pub hint: Option<HintKind>,

    /// Only rows last updated strictly before this instant.
    pub updated_before: Option<DateTime<Utc>>,

    /// Only rows created at or after this instant.
    pub created_from: Option<DateTime<Utc>>,

    /// Only rows created strictly before this instant.
    pub created_before: Option<DateTime<Utc>>,

    /// Maximum number of rows to return.
    pub limit: Option<usize>,
}

impl TransactionQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for rows in a specific status.
    pub fn for_status(status: TransactionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn tenant_id(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn partner_id(mut self, partner_id: PartnerId) -> Self {
        self.partner_id = Some(partner_id);
        self
    }

    pub fn hint(mut self, kind: HintKind) -> Self {
        self.hint = Some(kind);
        self
    }

    pub fn updated_before(mut self, cutoff: DateTime<Utc>) -> Self {
        self.updated_before = Some(cutoff);
        self
    }

    pub fn created_from(mut self, from: DateTime<Utc>) -> Self {
        self.created_from = Some(from);
        self
    }

    pub fn created_before(mut self, to: DateTime<Utc>) -> Self {
        self.created_before = Some(to);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if `tx` satisfies every filter except `limit`.
    pub fn matches(&self, tx: &Transaction) -> bool {
        if let Some(status) = self.status
            && tx.status != status
        {
            return false;
        }
        if let Some(ref tenant_id) = self.tenant_id
            && &tx.tenant_id != tenant_id
        {
            return false;
        }
        if let Some(ref partner_id) = self.partner_id
            && &tx.partner_id != partner_id
        {
            return false;
        }
        if let Some(kind) = self.hint
            && tx.hint_kind() != Some(kind)
        {
            return false;
        }
        if let Some(cutoff) = self.updated_before
            && tx.updated_at >= cutoff
        {
            return false;
        }
        if let Some(from) = self.created_from
            && tx.created_at < from
        {
            return false;
        }
        if let Some(to) = self.created_before
            && tx.created_at >= to
        {
            return false;
        }
        true
    }
}
