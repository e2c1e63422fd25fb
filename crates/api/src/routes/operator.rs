//! Operator queue endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use saga::{Escalation, ManualResolution, ReconcileReport};

use crate::AppState;
use crate::error::ApiError;
use crate::routes::transactions::{TransactionResponse, parse_tx_id};

/// GET /v1/operator/escalations: open escalations, oldest first.
pub async fn list_escalations(State(state): State<Arc<AppState>>) -> Json<Vec<Escalation>> {
    Json(state.orchestrator.operator_queue().list())
}

/// POST /v1/operator/escalations/{tx_id}/resolve
#[tracing::instrument(skip(state))]
pub async fn resolve(
    State(state): State<Arc<AppState>>,
    Path(tx_id): Path<String>,
    Json(resolution): Json<ManualResolution>,
) -> Result<Json<TransactionResponse>, ApiError> {
    let tx_id = parse_tx_id(&tx_id)?;
    let tx = state.reconciler.resolve(tx_id, resolution).await?;
    Ok(Json(TransactionResponse::from(&tx)))
}

/// POST /v1/operator/reconcile: run one reconciliation pass now.
#[tracing::instrument(skip(state))]
pub async fn reconcile(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReconcileReport>, ApiError> {
    let report = state.reconciler.run_once().await?;
    Ok(Json(report))
}
