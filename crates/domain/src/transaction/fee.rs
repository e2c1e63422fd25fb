//! Fee schedule.

use common::Money;
use serde::{Deserialize, Serialize};

use super::TransactionError;

/// Fee charged on top of a requested amount, as a fixed fraction `1 / divisor`.
///
/// The default divisor of 40 charges 2.5%, rounded down to whole units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeSchedule {
    divisor: i64,
}

/// Amount, fee, and total for a single transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fees {
    pub amount: Money,
    pub fee: Money,
    pub total: Money,
}

impl FeeSchedule {
    /// Default divisor (2.5%).
    pub const DEFAULT_DIVISOR: i64 = 40;

    /// Creates a schedule charging `amount / divisor`.
    pub fn new(divisor: i64) -> Result<Self, TransactionError> {
        if divisor <= 0 {
            return Err(TransactionError::InvalidFeeDivisor(divisor));
        }
        Ok(Self { divisor })
    }

    /// Returns the divisor.
    pub fn divisor(&self) -> i64 {
        self.divisor
    }

    /// Computes fee and total for a positive amount.
    pub fn apply(&self, amount: Money) -> Result<Fees, TransactionError> {
        if !amount.is_positive() {
            return Err(TransactionError::InvalidAmount { amount });
        }
        let fee = Money::from_minor(amount.as_minor() / self.divisor);
        let total = amount
            .checked_add(fee)
            .ok_or(TransactionError::AmountOverflow { amount })?;
        Ok(Fees { amount, fee, total })
    }
}

impl Default for FeeSchedule {
    fn default() -> Self {
        Self {
            divisor: Self::DEFAULT_DIVISOR,
        }
    }
}
