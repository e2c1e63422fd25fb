//! API server entry point.

use std::sync::Arc;

use api::config::Config;
use sqlx::postgres::PgPoolOptions;
use store::{
    CreditLedger, InMemoryCreditLedger, InMemoryTransactionStore, PostgresCreditLedger,
    PostgresTransactionStore, TransactionStore,
};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Connects to PostgreSQL when `DATABASE_URL` is set, otherwise keeps everything in memory.
async fn open_stores(config: &Config) -> (Arc<dyn CreditLedger>, Arc<dyn TransactionStore>) {
    let Some(url) = config.database_url.as_deref() else {
        tracing::warn!("DATABASE_URL not set, using in-memory stores");
        return (
            Arc::new(InMemoryCreditLedger::new()),
            Arc::new(InMemoryTransactionStore::new()),
        );
    };

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(url)
        .await
        .expect("failed to connect to PostgreSQL");
    store::run_migrations(&pool)
        .await
        .expect("failed to run migrations");
    tracing::info!(
        max_connections = config.database_max_connections,
        "connected to PostgreSQL"
    );

    (
        Arc::new(PostgresCreditLedger::new(pool.clone())),
        Arc::new(PostgresTransactionStore::new(pool)),
    )
}

#[tokio::main]
async fn main() {
    let config = Config::from_env().expect("invalid configuration");

    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let prometheus_builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    let metrics_handle = prometheus_builder
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Open stores and wire the saga
    let (ledger, transactions) = open_stores(&config).await;
    let gateway = api::create_gateway(&config);
    tracing::info!(
        provider = gateway.name(),
        fee_divisor = config.fee_schedule.divisor(),
        "provider gateway ready"
    );
    let state = api::create_state(ledger, transactions, gateway, &config);

    // 4. Start the reconciler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = state.reconciler.clone();
    let reconciler_task = tokio::spawn(async move { reconciler.run(shutdown_rx).await });

    // 5. Build the application
    let app = api::create_app(state, metrics_handle);

    // 6. Start server
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 7. Stop the reconciler after in-flight requests have drained
    let _ = shutdown_tx.send(true);
    if let Err(e) = reconciler_task.await {
        tracing::error!(error = %e, "reconciler task failed");
    }

    tracing::info!("server shut down gracefully");
}
