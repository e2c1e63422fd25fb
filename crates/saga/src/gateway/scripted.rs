use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use common::{Money, TransactionId};

use super::{
    Capabilities, GatewayError, InquiryResult, PayOutcome, PayRequest, PaymentStatus,
    ProviderGateway,
};

#[derive(Debug, Default)]
struct Script {
    pay_outcomes: VecDeque<PayOutcome>,
    statuses: HashMap<TransactionId, VecDeque<PaymentStatus>>,
    default_status: Option<PaymentStatus>,
    pay_calls: Vec<PayRequest>,
    status_calls: Vec<TransactionId>,
    cancels: Vec<(TransactionId, String)>,
    settled: HashMap<TransactionId, String>,
    fail_on_cancel: bool,
    lose_cancel_reply: bool,
    next_ref: u64,
}

/// Deterministic provider for tests.
///
/// `pay` answers from a queue of scripted outcomes and settles with
/// `SCRIPT-<n>` once the queue is empty. Status inquiries answer from
/// per-transaction scripts, then from whatever `pay` last did for that
/// reference. Every call is recorded.
#[derive(Debug, Clone)]
pub struct ScriptedGateway {
    script: Arc<Mutex<Script>>,
    capabilities: Capabilities,
    latency: Option<Duration>,
}

impl ScriptedGateway {
    /// Creates a gateway advertising every capability except idempotent pay.
    pub fn new() -> Self {
        Self {
            script: Arc::default(),
            capabilities: Capabilities {
                inquiry: true,
                status_inquiry: true,
                cancel: true,
                idempotent_pay: false,
            },
            latency: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Delays every `pay` by `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queues the outcome of the next unscripted `pay` call.
    pub fn push_pay(&self, outcome: PayOutcome) {
        self.with_script(|s| s.pay_outcomes.push_back(outcome));
    }

    /// Queues an answer to the next status inquiry for `ref_no`.
    pub fn push_status(&self, ref_no: TransactionId, status: PaymentStatus) {
        self.with_script(|s| s.statuses.entry(ref_no).or_default().push_back(status));
    }

    /// Answer for status inquiries with nothing scripted.
    pub fn set_default_status(&self, status: PaymentStatus) {
        self.with_script(|s| s.default_status = Some(status));
    }

    pub fn set_fail_on_cancel(&self, fail: bool) {
        self.with_script(|s| s.fail_on_cancel = fail);
    }

    /// Applies every cancel but answers with a transport error.
    pub fn set_lose_cancel_reply(&self, lose: bool) {
        self.with_script(|s| s.lose_cancel_reply = lose);
    }

    /// Number of `pay` calls received, including ones that later timed out.
    pub fn pay_count(&self) -> usize {
        self.with_script(|s| s.pay_calls.len())
    }

    pub fn pay_calls(&self) -> Vec<PayRequest> {
        self.with_script(|s| s.pay_calls.clone())
    }

    pub fn status_queries(&self) -> Vec<TransactionId> {
        self.with_script(|s| s.status_calls.clone())
    }

    pub fn cancel_count(&self) -> usize {
        self.with_script(|s| s.cancels.len())
    }

    fn with_script<R>(&self, f: impl FnOnce(&mut Script) -> R) -> R {
        let mut guard = self.script.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

impl Default for ScriptedGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderGateway for ScriptedGateway {
    fn name(&self) -> &str {
        "scripted"
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn inquiry(
        &self,
        _product_code: &str,
        customer_no: &str,
    ) -> Result<InquiryResult, GatewayError> {
        if !self.capabilities.inquiry {
            return Err(GatewayError::Unsupported("inquiry"));
        }
        Ok(InquiryResult {
            customer_no: customer_no.to_string(),
            customer_name: format!("Customer {customer_no}"),
            amount: Money::from_minor(50_000),
            admin_fee: Money::from_minor(2_500),
        })
    }

    async fn pay(&self, request: &PayRequest) -> PayOutcome {
        self.with_script(|s| s.pay_calls.push(request.clone()));

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        self.with_script(|s| {
            let outcome = s.pay_outcomes.pop_front().unwrap_or_else(|| {
                s.next_ref += 1;
                PayOutcome::Success {
                    provider_ref_no: format!("SCRIPT-{}", s.next_ref),
                }
            });
            if let PayOutcome::Success { provider_ref_no } = &outcome {
                s.settled.insert(request.ref_no, provider_ref_no.clone());
            }
            outcome
        })
    }

    async fn payment_status(&self, ref_no: TransactionId) -> PaymentStatus {
        if !self.capabilities.status_inquiry {
            return PaymentStatus::Unsupported;
        }
        self.with_script(|s| {
            s.status_calls.push(ref_no);
            if let Some(status) = s.statuses.get_mut(&ref_no).and_then(VecDeque::pop_front) {
                return status;
            }
            if let Some(status) = &s.default_status {
                return status.clone();
            }
            match s.settled.get(&ref_no) {
                Some(provider_ref_no) => PaymentStatus::Settled {
                    provider_ref_no: provider_ref_no.clone(),
                },
                None => PaymentStatus::NotSettled {
                    reason: "no payment recorded".to_string(),
                },
            }
        })
    }

    async fn cancel(&self, ref_no: TransactionId, provider_ref_no: &str) -> Result<(), GatewayError> {
        if !self.capabilities.cancel {
            return Err(GatewayError::Unsupported("cancel"));
        }
        self.with_script(|s| {
            if s.fail_on_cancel {
                return Err(GatewayError::Rejected("cancellation window closed".to_string()));
            }
            s.cancels.push((ref_no, provider_ref_no.to_string()));
            s.settled.remove(&ref_no);
            if s.lose_cancel_reply {
                return Err(GatewayError::Transport("connection reset".to_string()));
            }
            Ok(())
        })
    }
}
