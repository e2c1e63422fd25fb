//! Transaction status state machine.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::TransactionError;

/// The status of a transaction in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──┬──► Reserved ──┬──► Success ──► Cancelled (void)
///           │               └──► Failed
///           ├──► Failed
///           └──► Cancelled
/// ```
///
/// The transaction total is held against the partner's credit limit exactly
/// while the status is `Reserved` or `Success`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    /// Row persisted, credit not yet reserved.
    #[default]
    Pending,

    /// Credit reserved; provider payment in flight or awaiting confirmation.
    Reserved,

    /// Provider confirmed the payment (terminal for the saga).
    Success,

    /// Reservation never obtained, or payment declined and compensated (terminal).
    Failed,

    /// Cancelled before reservation, or voided after success (terminal).
    Cancelled,
}

impl TransactionStatus {
    /// Returns true if the credit reservation may be recorded in this state.
    pub fn can_reserve(&self) -> bool {
        matches!(self, TransactionStatus::Pending)
    }

    /// Returns true if the transaction can be settled in this state.
    pub fn can_settle(&self) -> bool {
        matches!(self, TransactionStatus::Reserved)
    }

    /// Returns true if the transaction can be failed in this state.
    pub fn can_fail(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Pending | TransactionStatus::Reserved
        )
    }

    /// Returns true if the transaction can be cancelled in this state.
    pub fn can_cancel(&self) -> bool {
        matches!(self, TransactionStatus::Pending | TransactionStatus::Success)
    }

    /// Returns true if the partner's credit is held against this transaction.
    pub fn holds_reservation(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Reserved | TransactionStatus::Success
        )
    }

    /// Returns true if the saga has finished with this transaction.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Success | TransactionStatus::Failed | TransactionStatus::Cancelled
        )
    }

    /// Returns the status name as stored and rendered.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Reserved => "reserved",
            TransactionStatus::Success => "success",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = TransactionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "reserved" => Ok(TransactionStatus::Reserved),
            "success" => Ok(TransactionStatus::Success),
            "failed" => Ok(TransactionStatus::Failed),
            "cancelled" => Ok(TransactionStatus::Cancelled),
            other => Err(TransactionError::UnknownStatus(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(TransactionStatus::default(), TransactionStatus::Pending);
    }

    #[test]
    fn test_can_reserve() {
        assert!(TransactionStatus::Pending.can_reserve());
        assert!(!TransactionStatus::Reserved.can_reserve());
        assert!(!TransactionStatus::Success.can_reserve());
        assert!(!TransactionStatus::Failed.can_reserve());
        assert!(!TransactionStatus::Cancelled.can_reserve());
    }

    #[test]
    fn test_can_fail() {
        assert!(TransactionStatus::Pending.can_fail());
        assert!(TransactionStatus::Reserved.can_fail());
        assert!(!TransactionStatus::Success.can_fail());
        assert!(!TransactionStatus::Failed.can_fail());
        assert!(!TransactionStatus::Cancelled.can_fail());
    }

    #[test]
    fn test_holds_reservation() {
        assert!(!TransactionStatus::Pending.holds_reservation());
        assert!(TransactionStatus::Reserved.holds_reservation());
        assert!(TransactionStatus::Success.holds_reservation());
        assert!(!TransactionStatus::Failed.holds_reservation());
        assert!(!TransactionStatus::Cancelled.holds_reservation());
    }

    #[test]
    fn test_terminal_states() {
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(!TransactionStatus::Reserved.is_terminal());
        assert!(TransactionStatus::Success.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
        assert!(TransactionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_parse_and_display_agree() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Reserved,
            TransactionStatus::Success,
            TransactionStatus::Failed,
            TransactionStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<TransactionStatus>(), Ok(status));
        }
        assert!("settled".parse::<TransactionStatus>().is_err());
    }

    #[test]
    fn test_serialization_is_lowercase() {
        let json = serde_json::to_string(&TransactionStatus::Reserved).unwrap();
        assert_eq!(json, "\"reserved\"");
    }
}
