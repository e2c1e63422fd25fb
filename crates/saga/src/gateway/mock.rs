use async_trait::async_trait;
use common::{Money, TransactionId};
use rand::Rng;

use super::{
    Capabilities, GatewayError, InquiryResult, PayOutcome, PayRequest, ProviderGateway,
};

/// Local-development provider.
///
/// Declines a configurable percentage of payments at random and settles the
/// rest with a random `MOCK-<n>` reference.
#[derive(Debug, Clone)]
pub struct MockProvider {
    name: String,
    failure_rate: u8,
}

impl MockProvider {
    /// Creates a provider declining `failure_rate` percent of payments (clamped to 100).
    pub fn new(failure_rate: u8) -> Self {
        Self {
            name: "mock".to_string(),
            failure_rate: failure_rate.min(100),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn failure_rate(&self) -> u8 {
        self.failure_rate
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new(0)
    }
}

#[async_trait]
impl ProviderGateway for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            inquiry: true,
            status_inquiry: false,
            cancel: true,
            idempotent_pay: false,
        }
    }

    async fn inquiry(
        &self,
        _product_code: &str,
        customer_no: &str,
    ) -> Result<InquiryResult, GatewayError> {
        if customer_no.trim().is_empty() {
            return Err(GatewayError::InvalidRequest(
                "invalid customer number".to_string(),
            ));
        }
        Ok(InquiryResult {
            customer_no: customer_no.to_string(),
            customer_name: format!("Customer {customer_no}"),
            amount: Money::from_minor(50_000),
            admin_fee: Money::from_minor(2_500),
        })
    }

    async fn pay(&self, request: &PayRequest) -> PayOutcome {
        if request.customer_no.trim().is_empty() {
            return PayOutcome::Declined {
                reason: "invalid customer number".to_string(),
            };
        }

        let (roll, reference) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(0..100u8), rng.gen_range(0..i64::MAX))
        };

        if roll < self.failure_rate {
            return PayOutcome::Declined {
                reason: "Provider temporarily unavailable".to_string(),
            };
        }

        PayOutcome::Success {
            provider_ref_no: format!("MOCK-{reference}"),
        }
    }

    async fn cancel(&self, _ref_no: TransactionId, provider_ref_no: &str) -> Result<(), GatewayError> {
        if provider_ref_no.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "invalid reference number".to_string(),
            ));
        }
        Ok(())
    }
}
