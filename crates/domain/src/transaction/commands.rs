//! Transaction commands.

use common::{Money, PartnerId, TenantId};
use serde::{Deserialize, Serialize};

use super::TransactionError;

/// Request to sell a PPOB product on behalf of a partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransaction {
    pub tenant_id: TenantId,
    pub partner_id: PartnerId,
    pub product_code: String,
    pub customer_no: String,
    pub amount: Money,
    /// Client-supplied deduplication token, unique per tenant.
    pub idempotency_key: Option<String>,
}

impl CreateTransaction {
    /// Creates a request without an idempotency key.
    pub fn new(
        tenant_id: impl Into<TenantId>,
        partner_id: impl Into<PartnerId>,
        product_code: impl Into<String>,
        customer_no: impl Into<String>,
        amount: Money,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            partner_id: partner_id.into(),
            product_code: product_code.into(),
            customer_no: customer_no.into(),
            amount,
            idempotency_key: None,
        }
    }

    /// Attaches an idempotency key. A blank key disables deduplication.
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.idempotency_key = if key.trim().is_empty() {
            None
        } else {
            Some(key)
        };
        self
    }

    /// Returns the idempotency key if one was supplied and is not blank.
    pub fn idempotency_key(&self) -> Option<&str> {
        self.idempotency_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
    }

    /// Checks field presence and amount sign. Runs before any side effect.
    pub fn validate(&self) -> Result<(), TransactionError> {
        if self.tenant_id.is_blank() {
            return Err(TransactionError::MissingField("tenant_id"));
        }
        if self.partner_id.is_blank() {
            return Err(TransactionError::MissingField("partner_id"));
        }
        if self.product_code.trim().is_empty() {
            return Err(TransactionError::MissingField("product_code"));
        }
        if self.customer_no.trim().is_empty() {
            return Err(TransactionError::MissingField("customer_no"));
        }
        if !self.amount.is_positive() {
            return Err(TransactionError::InvalidAmount {
                amount: self.amount,
            });
        }
        Ok(())
    }
}
