//! Partner credit limit.

use chrono::{DateTime, Utc};
use common::{Money, PartnerId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A partner's spending limit.
///
/// At every committed state `used + available == total` and both are
/// non-negative. Only the credit ledger mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditLimit {
    pub partner_id: PartnerId,
    pub limit_total: Money,
    pub limit_used: Money,
    pub limit_available: Money,
    /// Incremented on every reserve or restore.
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl CreditLimit {
    /// Opens a fresh limit with nothing used.
    pub fn open(partner_id: PartnerId, limit_total: Money, now: DateTime<Utc>) -> Self {
        Self {
            partner_id,
            limit_total,
            limit_used: Money::zero(),
            limit_available: limit_total,
            version: 0,
            updated_at: now,
        }
    }

    /// Returns true if `amount` can be reserved right now.
    pub fn can_reserve(&self, amount: Money) -> bool {
        self.limit_available >= amount
    }

    /// Moves `amount` from available to used. Caller checks `can_reserve`.
    pub fn apply_reserve(&mut self, amount: Money, now: DateTime<Utc>) {
        self.limit_used = Money::from_minor(self.limit_used.as_minor() + amount.as_minor());
        self.limit_available =
            Money::from_minor(self.limit_available.as_minor() - amount.as_minor());
        self.version += 1;
        self.updated_at = now;
    }

    /// Moves `amount` from used back to available. Caller checks `limit_used >= amount`.
    pub fn apply_restore(&mut self, amount: Money, now: DateTime<Utc>) {
        self.limit_used = Money::from_minor(self.limit_used.as_minor() - amount.as_minor());
        self.limit_available =
            Money::from_minor(self.limit_available.as_minor() + amount.as_minor());
        self.version += 1;
        self.updated_at = now;
    }

    /// Verifies `used + available == total` with both non-negative.
    pub fn check_balanced(&self) -> Result<(), DomainError> {
        let balanced = self.limit_used.as_minor() >= 0
            && self.limit_available.as_minor() >= 0
            && self.limit_used.checked_add(self.limit_available) == Some(self.limit_total);
        if balanced {
            Ok(())
        } else {
            Err(DomainError::UnbalancedLimit {
                partner_id: self.partner_id.to_string(),
                total: self.limit_total.as_minor(),
                used: self.limit_used.as_minor(),
                available: self.limit_available.as_minor(),
            })
        }
    }

    /// Returns the read-only view handed to callers.
    pub fn view(&self) -> LimitView {
        LimitView {
            partner_id: self.partner_id.clone(),
            limit_total: self.limit_total,
            limit_used: self.limit_used,
            limit_available: self.limit_available,
            updated_at: self.updated_at,
        }
    }
}

/// Snapshot of a partner's limit. Not valid past the moment it was read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitView {
    pub partner_id: PartnerId,
    pub limit_total: Money,
    pub limit_used: Money,
    pub limit_available: Money,
    pub updated_at: DateTime<Utc>,
}
