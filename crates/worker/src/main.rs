//! Worker entry point.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use saga_store::{InMemorySagaStore, PostgresSagaStore, SagaStore};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use worker::config::{Config, LogFormat};
use worker::AppState;

const DATABASE_MAX_CONNECTIONS: u32 = 10;

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

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Runs the sweep and the HTTP server over `store` until a shutdown signal.
async fn serve<S: SagaStore + 'static>(config: Config, store: S, metrics_handle: PrometheusHandle) {
    let scheduler = worker::create_scheduler(store, config.scheduler(), config.retry_policy());
    scheduler.prepare().expect("failed to start scheduler");

    let state = Arc::new(AppState {
        scheduler: scheduler.clone(),
    });
    let app = worker::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting worker");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Let running sagas reach a consistent state before exiting
    scheduler.shutdown().await;
    tracing::info!("worker shut down gracefully");
}

#[tokio::main]
async fn main() {
    // 1. Configuration and tracing
    let config = Config::from_env();
    init_tracing(&config);
    if let Err(reason) = config.validate() {
        tracing::error!(%reason, "refusing to start");
        std::process::exit(1);
    }
    tracing::warn!(
        "running with in-memory provider, ledger and chat stand-ins; \
         status checks report pending and due purchases are refunded"
    );

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Pick the saga store and run
    match config.database_url.clone() {
        Some(url) => {
            let store = PostgresSagaStore::connect(&url, DATABASE_MAX_CONNECTIONS)
                .await
                .expect("failed to connect to database");
            store
                .run_migrations()
                .await
                .expect("failed to run migrations");
            tracing::info!("using PostgreSQL saga store");
            serve(config, store, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, sagas will not survive a restart");
            serve(config, InMemorySagaStore::new(), metrics_handle).await;
        }
    }
}
