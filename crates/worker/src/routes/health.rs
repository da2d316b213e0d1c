//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use saga_store::SagaStore;
use serde::Serialize;

use super::sagas::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Sagas this process is running right now.
    pub in_flight: usize,
}

/// GET /health — liveness plus the scheduler's current load.
pub async fn check<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        in_flight: state.scheduler.in_flight(),
    })
}
