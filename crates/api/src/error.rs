//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use domain::TransactionError;
use saga::{GatewayError, SagaError};
use store::StoreError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Saga or ledger error.
    Saga(SagaError),
    /// Internal server error.
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    let status = match &err {
        SagaError::Transaction(TransactionError::InvalidStateTransition { .. }) => {
            StatusCode::CONFLICT
        }
        SagaError::Transaction(_) => StatusCode::BAD_REQUEST,
        SagaError::TransactionNotFound(_)
        | SagaError::PartnerNotFound(_)
        | SagaError::EscalationNotFound(_) => StatusCode::NOT_FOUND,
        SagaError::InsufficientFunds { .. }
        | SagaError::StateConflict { .. }
        | SagaError::AlreadyInFlight(_) => StatusCode::CONFLICT,
        SagaError::CompensationDeferred(_) => StatusCode::ACCEPTED,
        SagaError::Provider(GatewayError::Unsupported(_)) => StatusCode::NOT_IMPLEMENTED,
        SagaError::Provider(GatewayError::InvalidRequest(_)) => StatusCode::BAD_REQUEST,
        SagaError::Provider(GatewayError::Rejected(_)) => StatusCode::UNPROCESSABLE_ENTITY,
        SagaError::Provider(GatewayError::Transport(_)) => StatusCode::BAD_GATEWAY,
        SagaError::Store(store_err) => store_error_status(store_err),
        SagaError::IntegrityFault { tx_id, detail } => {
            tracing::error!(%tx_id, %detail, "ledger integrity fault surfaced to client");
            StatusCode::INTERNAL_SERVER_ERROR
        }
        SagaError::TaskFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

fn store_error_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::PartnerExists(_)
        | StoreError::ReservationClosed(_)
        | StoreError::ReservationMismatch { .. }
        | StoreError::StatusConflict { .. }
        | StoreError::DuplicateTransaction(_) => StatusCode::CONFLICT,
        StoreError::TransactionNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::Unavailable(_) | StoreError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => {
            tracing::error!(error = %err, "storage fault");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}
