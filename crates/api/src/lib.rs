//! HTTP API server for the PPOB credit reservation saga.
//!
//! Exposes transaction, partner limit and operator endpoints over the
//! saga crate, with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{MockProvider, ProviderGateway, Reconciler, TransactionOrchestrator};
use store::{CreditLedger, InMemoryCreditLedger, InMemoryTransactionStore, TransactionStore};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use routes::metrics::MetricsState;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub orchestrator: TransactionOrchestrator,
    pub reconciler: Reconciler,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(MetricsState {
            handle: metrics_handle,
            app: state.clone(),
        });

    Router::new()
        .route("/health", get(routes::health::check))
        .route(
            "/v1/{tenant}/transactions",
            post(routes::transactions::create),
        )
        .route(
            "/v1/{tenant}/transactions/{tx_id}",
            get(routes::transactions::get),
        )
        .route(
            "/v1/{tenant}/transactions/{tx_id}/void",
            post(routes::transactions::void),
        )
        .route("/v1/{tenant}/inquiry", post(routes::transactions::inquiry))
        .route(
            "/v1/partners/{partner_id}/limit",
            get(routes::partners::get_limit).post(routes::partners::open_limit),
        )
        .route(
            "/v1/partners/{partner_id}/reserve",
            post(routes::partners::reserve),
        )
        .route(
            "/v1/partners/{partner_id}/restore",
            post(routes::partners::restore),
        )
        .route(
            "/v1/operator/escalations",
            get(routes::operator::list_escalations),
        )
        .route(
            "/v1/operator/escalations/{tx_id}/resolve",
            post(routes::operator::resolve),
        )
        .route("/v1/operator/reconcile", post(routes::operator::reconcile))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Builds the provider gateway named by the configuration.
pub fn create_gateway(config: &Config) -> Arc<dyn ProviderGateway> {
    Arc::new(MockProvider::new(config.provider_failure_rate).with_name(config.provider_name.clone()))
}

/// Wires the orchestrator and reconciler over the given backends.
pub fn create_state(
    ledger: Arc<dyn CreditLedger>,
    transactions: Arc<dyn TransactionStore>,
    gateway: Arc<dyn ProviderGateway>,
    config: &Config,
) -> Arc<AppState> {
    let orchestrator = TransactionOrchestrator::new(
        ledger,
        transactions,
        gateway,
        config.orchestrator_config(),
    );
    let reconciler = Reconciler::new(orchestrator.clone(), config.reconcile_policy());
    Arc::new(AppState {
        orchestrator,
        reconciler,
    })
}

/// Creates the default application state with in-memory stores and the mock provider.
pub fn create_default_state(config: &Config) -> Arc<AppState> {
    create_state(
        Arc::new(InMemoryCreditLedger::new()),
        Arc::new(InMemoryTransactionStore::new()),
        create_gateway(config),
        config,
    )
}
