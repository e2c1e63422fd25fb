//! Integration tests for the transaction entity and credit limit.
//!
//! These tests walk whole lifecycles through the public API: fee
//! computation, forward-only status changes, and the balance invariant of
//! a partner's limit across many reserve/restore cycles.

use chrono::{Duration, Utc};
use common::{Money, PartnerId};
use domain::{
    CreateTransaction, CreditLimit, FeeSchedule, HintKind, Transaction, TransactionError,
    TransactionStatus,
};

fn request(amount: i64) -> CreateTransaction {
    CreateTransaction::new(
        "tenant-a",
        "partner-1",
        "PLN-PREPAID",
        "5512345678",
        Money::from_minor(amount),
    )
}

fn pending(amount: i64) -> Transaction {
    let req = request(amount);
    let fees = FeeSchedule::default().apply(req.amount).unwrap();
    Transaction::pending(&req, fees, "mock", Utc::now())
}

mod lifecycle {
    use super::*;

    #[test]
    fn settled_then_voided() {
        let mut tx = pending(50_000);
        assert_eq!(tx.fee, Money::from_minor(1_250));
        assert_eq!(tx.total, Money::from_minor(51_250));
        assert!(!tx.status.holds_reservation());

        let t1 = tx.created_at + Duration::seconds(1);
        tx.mark_reserved(t1).unwrap();
        assert!(tx.status.holds_reservation());
        assert_eq!(tx.updated_at, t1);

        tx.mark_settled("REF-1", t1 + Duration::seconds(1)).unwrap();
        assert_eq!(tx.status, TransactionStatus::Success);
        assert!(tx.is_terminal());
        assert!(tx.status.holds_reservation());

        tx.mark_cancelled("voided", t1 + Duration::seconds(2)).unwrap();
        assert_eq!(tx.status, TransactionStatus::Cancelled);
        assert!(!tx.status.holds_reservation());
        assert_eq!(tx.provider_tx_id.as_deref(), Some("REF-1"));
    }

    #[test]
    fn ambiguous_payment_then_confirmed() {
        let mut tx = pending(10_000);
        let now = Utc::now();
        tx.mark_reserved(now).unwrap();

        tx.mark_awaiting_confirmation("provider timeout", now).unwrap();
        assert_eq!(tx.status, TransactionStatus::Reserved);
        assert_eq!(tx.hint_kind(), Some(HintKind::AwaitingConfirmation));

        tx.mark_settled("LATE-1", now).unwrap();
        assert!(tx.hint.is_none());
    }

    #[test]
    fn declined_with_deferred_compensation() {
        let mut tx = pending(10_000);
        let now = Utc::now();
        tx.mark_reserved(now).unwrap();

        tx.mark_awaiting_compensation("provider declined: blocked", now)
            .unwrap();
        assert_eq!(tx.hint_kind(), Some(HintKind::AwaitingCompensation));
        assert_eq!(
            tx.failure_reason.as_deref(),
            Some("provider declined: blocked")
        );

        tx.mark_failed("provider declined: blocked", now).unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert!(tx.hint.is_none());
    }

    #[test]
    fn terminal_states_do_not_move_backwards() {
        let now = Utc::now();

        let mut failed = pending(1_000);
        failed.mark_failed("partner not found", now).unwrap();
        assert!(matches!(
            failed.mark_reserved(now),
            Err(TransactionError::InvalidStateTransition { .. })
        ));
        assert!(failed.mark_settled("X", now).is_err());
        assert!(failed.mark_cancelled("late", now).is_err());

        let mut cancelled = pending(1_000);
        cancelled.mark_cancelled("client went away", now).unwrap();
        assert!(cancelled.mark_reserved(now).is_err());
        assert!(cancelled.mark_failed("late", now).is_err());
    }

    #[test]
    fn hints_require_a_reservation() {
        let mut tx = pending(1_000);
        assert!(tx.mark_awaiting_confirmation("timeout", Utc::now()).is_err());
        assert!(tx.hint.is_none());
    }
}

mod validation {
    use super::*;

    #[test]
    fn rejects_before_any_side_effect() {
        assert!(request(0).validate().is_err());
        assert!(request(-10).validate().is_err());

        let mut blank_partner = request(1_000);
        blank_partner.partner_id = PartnerId::new(" ");
        assert!(matches!(
            blank_partner.validate(),
            Err(TransactionError::MissingField("partner_id"))
        ));

        assert!(request(1_000).validate().is_ok());
    }

    #[test]
    fn blank_idempotency_key_is_ignored() {
        let req = request(1_000).with_idempotency_key("   ");
        assert_eq!(req.idempotency_key(), None);

        let req = request(1_000).with_idempotency_key("order-7");
        assert_eq!(req.idempotency_key(), Some("order-7"));
    }

    #[test]
    fn fee_overflow_is_reported() {
        let schedule = FeeSchedule::new(1).unwrap();
        assert!(matches!(
            schedule.apply(Money::from_minor(i64::MAX)),
            Err(TransactionError::AmountOverflow { .. })
        ));
    }
}

mod credit_limit {
    use super::*;

    #[test]
    fn stays_balanced_through_reserve_restore_cycles() {
        let now = Utc::now();
        let mut limit = CreditLimit::open(PartnerId::new("partner-1"), Money::from_minor(100_000), now);

        for amount in [7_000, 13_500, 1, 40_000, 25_000] {
            let amount = Money::from_minor(amount);
            assert!(limit.can_reserve(amount));
            limit.apply_reserve(amount, now);
            limit.check_balanced().unwrap();
        }
        assert_eq!(limit.limit_used, Money::from_minor(85_501));
        assert!(!limit.can_reserve(Money::from_minor(14_500)));
        assert!(limit.can_reserve(Money::from_minor(14_499)));

        limit.apply_restore(Money::from_minor(40_000), now);
        limit.check_balanced().unwrap();
        assert_eq!(limit.limit_available, Money::from_minor(54_499));
        assert_eq!(limit.version, 6);
    }

    #[test]
    fn detects_corruption() {
        let mut limit = CreditLimit::open(PartnerId::new("partner-1"), Money::from_minor(100), Utc::now());
        limit.limit_used = Money::from_minor(10);
        assert!(limit.check_balanced().is_err());
    }

    #[test]
    fn view_reflects_limit() {
        let now = Utc::now();
        let mut limit = CreditLimit::open(PartnerId::new("partner-1"), Money::from_minor(500), now);
        limit.apply_reserve(Money::from_minor(200), now);

        let view = limit.view();
        assert_eq!(view.limit_total, Money::from_minor(500));
        assert_eq!(view.limit_used, Money::from_minor(200));
        assert_eq!(view.limit_available, Money::from_minor(300));
    }
}
