//! Partner credit limit endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{Money, PartnerId};
use domain::LimitView;
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;
use crate::routes::transactions::parse_tx_id;

#[derive(Deserialize)]
pub struct OpenLimitRequest {
    pub limit_total: i64,
}

/// Direct reserve or restore against a partner's limit.
#[derive(Deserialize)]
pub struct AdjustLimitRequest {
    pub amount: i64,
    pub tx_id: String,
}

/// GET /v1/partners/{partner_id}/limit
#[tracing::instrument(skip(state))]
pub async fn get_limit(
    State(state): State<Arc<AppState>>,
    Path(partner_id): Path<String>,
) -> Result<Json<LimitView>, ApiError> {
    let view = state
        .orchestrator
        .get_limit(&PartnerId::new(partner_id))
        .await?;
    Ok(Json(view))
}

/// POST /v1/partners/{partner_id}/limit: open a limit for a new partner.
#[tracing::instrument(skip(state, req))]
pub async fn open_limit(
    State(state): State<Arc<AppState>>,
    Path(partner_id): Path<String>,
    Json(req): Json<OpenLimitRequest>,
) -> Result<(StatusCode, Json<LimitView>), ApiError> {
    let view = state
        .orchestrator
        .open_limit(&PartnerId::new(partner_id), Money::from_minor(req.limit_total))
        .await?;
    Ok((StatusCode::CREATED, Json(view)))
}

/// POST /v1/partners/{partner_id}/reserve
#[tracing::instrument(skip(state, req))]
pub async fn reserve(
    State(state): State<Arc<AppState>>,
    Path(partner_id): Path<String>,
    Json(req): Json<AdjustLimitRequest>,
) -> Result<Json<LimitView>, ApiError> {
    let tx_id = parse_tx_id(&req.tx_id)?;
    let view = state
        .orchestrator
        .reserve(&PartnerId::new(partner_id), Money::from_minor(req.amount), tx_id)
        .await?;
    Ok(Json(view))
}

/// POST /v1/partners/{partner_id}/restore: idempotent per `tx_id`.
#[tracing::instrument(skip(state, req))]
pub async fn restore(
    State(state): State<Arc<AppState>>,
    Path(partner_id): Path<String>,
    Json(req): Json<AdjustLimitRequest>,
) -> Result<Json<LimitView>, ApiError> {
    let tx_id = parse_tx_id(&req.tx_id)?;
    let view = state
        .orchestrator
        .restore(&PartnerId::new(partner_id), Money::from_minor(req.amount), tx_id)
        .await?;
    Ok(Json(view))
}
