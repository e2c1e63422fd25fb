//! Credit reservation saga for PPOB transactions.
//!
//! A transaction reserves its total against the partner's credit limit,
//! pays through a provider gateway, and restores the reservation when the
//! payment is declined. Payments with an unknown outcome keep their
//! reservation until the [`Reconciler`] learns what happened:
//!
//! 1. Admit the request (idempotency key → at most one transaction)
//! 2. Reserve `amount + fee` on the credit ledger
//! 3. Pay through the provider under a deadline
//! 4. Settle, or restore and fail, or leave for reconciliation

pub mod error;
pub mod gateway;
pub mod idempotency;
pub mod inflight;
pub mod operator;
pub mod orchestrator;
pub mod reconciler;

pub use error::{Result, SagaError};
pub use gateway::{
    AmbiguousCause, Capabilities, GatewayError, InquiryResult, MockProvider, PayOutcome,
    PayRequest, PaymentStatus, ProviderGateway, ScriptedGateway, pay_within,
};
pub use idempotency::{Admission, IdempotencyStore};
pub use inflight::{InFlight, InFlightGuard};
pub use operator::{Escalation, ManualResolution, OperatorQueue};
pub use orchestrator::{
    DEFAULT_PROVIDER_DEADLINE, Disposition, OrchestratorConfig, Rejection, SagaOutcome,
    TransactionOrchestrator,
};
pub use reconciler::{ReconcilePolicy, ReconcileReport, Reconciler, UnknownStatusPolicy};
