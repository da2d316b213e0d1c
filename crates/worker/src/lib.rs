//! Saga worker: runs the recovery sweep and exposes an HTTP surface for
//! scheduling, cancelling and inspecting sagas, with structured logging
//! (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{
    InMemoryLedger, InMemoryNotifier, InMemoryStatusSource, RetryPolicy, SagaExecutor, Scheduler,
    SchedulerConfig,
};
use saga_store::SagaStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use routes::sagas::{AppState, WorkerScheduler};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: SagaStore + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S>))
        .route("/sagas", post(routes::sagas::create::<S>))
        .route("/sagas/{activation_id}", get(routes::sagas::get::<S>))
        .route(
            "/sagas/{activation_id}/cancel",
            post(routes::sagas::cancel::<S>),
        )
        .route("/sagas/flagged/{flag}", get(routes::sagas::flagged::<S>))
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

/// Builds a scheduler over `store` with the worker's collaborators.
///
/// The provider, ledger and chat integrations live outside this
/// repository; the in-memory collaborators stand in for them and log
/// every call.
pub fn create_scheduler<S: SagaStore + 'static>(
    store: S,
    config: SchedulerConfig,
    policy: RetryPolicy,
) -> WorkerScheduler<S> {
    let executor = SagaExecutor::new(
        store,
        InMemoryStatusSource::new(),
        InMemoryLedger::new(),
        InMemoryNotifier::new(),
        policy,
    );
    Scheduler::new(executor, config)
}
