//! Provider gateway seam.
//!
//! A gateway is the uniform face of one external payment rail. `pay` never
//! returns an error: every call is classified as success, decline or an
//! ambiguous outcome whose effect on the provider side is unknown.

mod mock;
mod scripted;

use std::time::Duration;

use async_trait::async_trait;
use common::{Money, TransactionId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use mock::MockProvider;
pub use scripted::ScriptedGateway;

/// What a provider supports beyond `pay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Bill lookup before payment.
    pub inquiry: bool,
    /// Answering "did payment `ref_no` settle?" after the fact.
    pub status_inquiry: bool,
    /// Reversing a settled payment.
    pub cancel: bool,
    /// Re-sending `pay` with the same `ref_no` is deduplicated by the provider.
    pub idempotent_pay: bool,
}

/// A payment instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayRequest {
    pub product_code: String,
    pub customer_no: String,
    pub amount: Money,
    /// Always the transaction id, so the provider can deduplicate retries.
    pub ref_no: TransactionId,
    pub deadline: Duration,
}

/// Why a payment outcome is unknown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AmbiguousCause {
    /// No answer before the deadline.
    Timeout,
    /// The connection failed after the request may have been sent.
    Transport(String),
}

impl std::fmt::Display for AmbiguousCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AmbiguousCause::Timeout => f.write_str("provider timeout"),
            AmbiguousCause::Transport(detail) => write!(f, "transport error: {detail}"),
        }
    }
}

/// Classified result of a `pay` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayOutcome {
    Success { provider_ref_no: String },
    Declined { reason: String },
    Ambiguous { cause: AmbiguousCause },
}

impl PayOutcome {
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, PayOutcome::Ambiguous { .. })
    }
}

/// Answer to a payment status inquiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentStatus {
    /// The provider confirms the payment went through.
    Settled { provider_ref_no: String },
    /// The provider confirms the payment did not and will not happen.
    NotSettled { reason: String },
    /// The provider could not answer.
    Unknown { cause: String },
    /// The provider has no status inquiry.
    Unsupported,
}

/// Bill details returned by an inquiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InquiryResult {
    pub customer_no: String,
    pub customer_name: String,
    pub amount: Money,
    pub admin_fee: Money,
}

/// Failures of the non-payment provider calls.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{0} is not supported by this provider")]
    Unsupported(&'static str),

    #[error("Invalid provider request: {0}")]
    InvalidRequest(String),

    #[error("Provider rejected the request: {0}")]
    Rejected(String),

    #[error("Provider unreachable: {0}")]
    Transport(String),
}

/// Uniform interface to an external payment rail.
#[async_trait]
pub trait ProviderGateway: Send + Sync {
    /// Name recorded on every transaction this gateway handles.
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    /// Looks up the bill for a customer.
    async fn inquiry(
        &self,
        _product_code: &str,
        _customer_no: &str,
    ) -> Result<InquiryResult, GatewayError> {
        Err(GatewayError::Unsupported("inquiry"))
    }

    /// Sends the payment. Implementations classify every failure; callers
    /// enforce the deadline through [`pay_within`].
    async fn pay(&self, request: &PayRequest) -> PayOutcome;

    /// Asks whether payment `ref_no` settled.
    async fn payment_status(&self, _ref_no: TransactionId) -> PaymentStatus {
        PaymentStatus::Unsupported
    }

    /// Reverses a settled payment.
    async fn cancel(
        &self,
        _ref_no: TransactionId,
        _provider_ref_no: &str,
    ) -> Result<(), GatewayError> {
        Err(GatewayError::Unsupported("cancel"))
    }
}

/// Calls `pay` under the request's deadline.
///
/// An elapsed deadline is `Ambiguous`, never `Declined`: the provider may
/// still complete the payment after we stop waiting.
pub async fn pay_within(gateway: &dyn ProviderGateway, request: &PayRequest) -> PayOutcome {
    match tokio::time::timeout(request.deadline, gateway.pay(request)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::warn!(
                provider = gateway.name(),
                ref_no = %request.ref_no,
                deadline_ms = request.deadline.as_millis() as u64,
                "provider pay timed out"
            );
            PayOutcome::Ambiguous {
                cause: AmbiguousCause::Timeout,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(deadline: Duration) -> PayRequest {
        PayRequest {
            product_code: "PLN50".to_string(),
            customer_no: "5300001".to_string(),
            amount: Money::from_minor(50_000),
            ref_no: TransactionId::new(),
            deadline,
        }
    }

    #[tokio::test]
    async fn slow_provider_is_ambiguous_not_declined() {
        let gateway = ScriptedGateway::new().with_latency(Duration::from_millis(200));

        let outcome = pay_within(&gateway, &request(Duration::from_millis(20))).await;

        assert_eq!(
            outcome,
            PayOutcome::Ambiguous {
                cause: AmbiguousCause::Timeout
            }
        );
    }

    #[tokio::test]
    async fn fast_provider_answer_passes_through() {
        let gateway = ScriptedGateway::new();
        gateway.push_pay(PayOutcome::Declined {
            reason: "invalid customer".to_string(),
        });

        let outcome = pay_within(&gateway, &request(Duration::from_secs(1))).await;

        assert_eq!(
            outcome,
            PayOutcome::Declined {
                reason: "invalid customer".to_string()
            }
        );
    }

    #[test]
    fn ambiguous_cause_display() {
        assert_eq!(AmbiguousCause::Timeout.to_string(), "provider timeout");
        assert_eq!(
            AmbiguousCause::Transport("connection reset".to_string()).to_string(),
            "transport error: connection reset"
        );
    }
}
