//! Transaction endpoints: sell, look up, void, and bill inquiry.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use common::{Money, TenantId, TransactionId};
use domain::{CreateTransaction, Transaction};
use saga::{Disposition, InquiryResult, Rejection};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

/// Header accepted as an alternative to the `idempotency_key` body field.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

// -- Request types --

#[derive(Deserialize)]
pub struct CreateTransactionRequest {
    pub partner_id: String,
    pub product_code: String,
    pub customer_no: String,
    pub amount: i64,
    pub idempotency_key: Option<String>,
}

#[derive(Deserialize)]
pub struct InquiryRequest {
    pub product_code: String,
    pub customer_no: String,
}

// -- Response types --

#[derive(Debug, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub id: String,
    pub tenant_id: String,
    pub partner_id: String,
    pub product_code: String,
    pub customer_no: String,
    pub amount: i64,
    pub fee: i64,
    pub total: i64,
    pub status: String,
    pub provider: String,
    pub provider_tx_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub failure_reason: Option<String>,
    pub reconcile_hint: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&Transaction> for TransactionResponse {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id.to_string(),
            tenant_id: tx.tenant_id.to_string(),
            partner_id: tx.partner_id.to_string(),
            product_code: tx.product_code.clone(),
            customer_no: tx.customer_no.clone(),
            amount: tx.amount.as_minor(),
            fee: tx.fee.as_minor(),
            total: tx.total.as_minor(),
            status: tx.status.to_string(),
            provider: tx.provider.clone(),
            provider_tx_id: tx.provider_tx_id.clone(),
            idempotency_key: tx.idempotency_key.clone(),
            failure_reason: tx.failure_reason.clone(),
            reconcile_hint: tx.hint_kind().map(|k| k.to_string()),
            created_at: tx.created_at.to_rfc3339(),
            updated_at: tx.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateTransactionResponse {
    /// `settled`, `pending`, `replayed`, `insufficient_funds`, `partner_not_found`, `declined`.
    pub outcome: String,
    pub message: Option<String>,
    pub transaction: TransactionResponse,
}

// -- Handlers --

/// POST /v1/{tenant}/transactions: run the reserve / pay / compensate saga.
#[tracing::instrument(skip(state, headers, req))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    headers: HeaderMap,
    Json(req): Json<CreateTransactionRequest>,
) -> Result<(StatusCode, Json<CreateTransactionResponse>), ApiError> {
    let header_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .map(|v| {
            v.to_str()
                .map(str::to_string)
                .map_err(|_| ApiError::BadRequest("Invalid Idempotency-Key header".to_string()))
        })
        .transpose()?;

    let mut request = CreateTransaction::new(
        tenant,
        req.partner_id,
        req.product_code,
        req.customer_no,
        Money::from_minor(req.amount),
    );
    if let Some(key) = req.idempotency_key.or(header_key) {
        request = request.with_idempotency_key(key);
    }

    let outcome = state.orchestrator.create_transaction(request).await?;

    let (status, message) = match &outcome.disposition {
        Disposition::Settled => (StatusCode::CREATED, None),
        Disposition::Pending { cause } => (StatusCode::ACCEPTED, Some(cause.clone())),
        Disposition::Replayed | Disposition::Cancelled => (StatusCode::OK, None),
        Disposition::Rejected(rejection) => {
            let status = match rejection {
                Rejection::InsufficientFunds { .. } => StatusCode::CONFLICT,
                Rejection::PartnerNotFound => StatusCode::NOT_FOUND,
                Rejection::ProviderDeclined { .. } => StatusCode::PAYMENT_REQUIRED,
            };
            (status, Some(rejection.reason()))
        }
    };

    let response = CreateTransactionResponse {
        outcome: outcome.disposition.label().to_string(),
        message,
        transaction: TransactionResponse::from(&outcome.transaction),
    };
    Ok((status, Json(response)))
}

/// GET /v1/{tenant}/transactions/{tx_id}
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path((tenant, tx_id)): Path<(String, String)>,
) -> Result<Json<TransactionResponse>, ApiError> {
    let tx_id = parse_tx_id(&tx_id)?;
    let tx = state
        .orchestrator
        .get_transaction(&TenantId::new(tenant), tx_id)
        .await?;
    Ok(Json(TransactionResponse::from(&tx)))
}

/// POST /v1/{tenant}/transactions/{tx_id}/void: reverse a settled sale.
#[tracing::instrument(skip(state))]
pub async fn void(
    State(state): State<Arc<AppState>>,
    Path((tenant, tx_id)): Path<(String, String)>,
) -> Result<Json<TransactionResponse>, ApiError> {
    let tx_id = parse_tx_id(&tx_id)?;
    let tx = state
        .orchestrator
        .void_transaction(&TenantId::new(tenant), tx_id)
        .await?;
    Ok(Json(TransactionResponse::from(&tx)))
}

/// POST /v1/{tenant}/inquiry: bill lookup through the provider.
#[tracing::instrument(skip(state, req))]
pub async fn inquiry(
    State(state): State<Arc<AppState>>,
    Path(tenant): Path<String>,
    Json(req): Json<InquiryRequest>,
) -> Result<Json<InquiryResult>, ApiError> {
    if req.customer_no.trim().is_empty() {
        return Err(ApiError::BadRequest("customer_no is required".to_string()));
    }
    tracing::debug!(%tenant, product_code = %req.product_code, "bill inquiry");
    let result = state
        .orchestrator
        .inquiry(&req.product_code, &req.customer_no)
        .await?;
    Ok(Json(result))
}

pub(crate) fn parse_tx_id(id: &str) -> Result<TransactionId, ApiError> {
    TransactionId::parse(id).map_err(|e| ApiError::BadRequest(format!("Invalid transaction id: {e}")))
}
