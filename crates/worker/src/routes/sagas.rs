//! Saga scheduling, lookup and cancel endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::ActivationId;
use domain::{Saga, SagaFlag};
use saga::{
    InMemoryLedger, InMemoryNotifier, InMemoryStatusSource, SagaHandle, ScheduleCheck, Scheduler,
};
use saga_store::SagaStore;
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// Scheduler wired to the collaborators the worker runs with.
pub type WorkerScheduler<S> =
    Scheduler<S, InMemoryStatusSource, InMemoryLedger, InMemoryNotifier>;

/// Shared application state accessible from all handlers.
pub struct AppState<S> {
    pub scheduler: WorkerScheduler<S>,
}

const DEFAULT_FLAGGED_LIMIT: usize = 100;

// -- Request types --

#[derive(Deserialize)]
pub struct FlaggedQuery {
    pub limit: Option<usize>,
}

// -- Response types --

#[derive(Serialize)]
pub struct SagaResponse {
    pub saga_id: String,
    pub activation_id: i64,
    pub profile_id: i64,
    pub chat_id: i64,
    pub amount: f64,
    pub status: String,
    pub version: i64,
    pub run_at: Option<DateTime<Utc>>,
    pub credited_at: Option<DateTime<Utc>>,
    pub flag: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Saga> for SagaResponse {
    fn from(saga: Saga) -> Self {
        Self {
            saga_id: saga.id.to_string(),
            activation_id: saga.activation_id.as_i64(),
            profile_id: saga.profile_id.as_i64(),
            chat_id: saga.chat_id.as_i64(),
            amount: saga.amount.as_f64(),
            status: saga.status.to_string(),
            version: saga.version.as_i64(),
            run_at: saga.run_at,
            credited_at: saga.credited_at,
            flag: saga.flag.map(|f| f.to_string()),
            last_error: saga.last_error,
            created_at: saga.created_at,
            updated_at: saga.updated_at,
        }
    }
}

#[derive(Serialize)]
pub struct CancelResponse {
    pub activation_id: i64,
    pub outcome: &'static str,
}

// -- Handlers --

/// POST /sagas — schedule a delayed delivery check for a purchase.
#[tracing::instrument(skip(state, req))]
pub async fn create<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<ScheduleCheck>,
) -> Result<(StatusCode, Json<SagaHandle>), ApiError> {
    let handle = state.scheduler.schedule_check(req).await?;
    Ok((StatusCode::CREATED, Json(handle)))
}

/// GET /sagas/{activation_id} — fetch a saga record.
pub async fn get<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(activation_id): Path<i64>,
) -> Result<Json<SagaResponse>, ApiError> {
    let activation_id = ActivationId::new(activation_id);
    let saga = state
        .scheduler
        .store()
        .get(activation_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga not found for activation {activation_id}")))?;
    Ok(Json(saga.into()))
}

/// POST /sagas/{activation_id}/cancel — cancel a purchase right away.
#[tracing::instrument(skip(state))]
pub async fn cancel<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(activation_id): Path<i64>,
) -> Result<Json<CancelResponse>, ApiError> {
    let activation_id = ActivationId::new(activation_id);
    let saga = state
        .scheduler
        .store()
        .get(activation_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga not found for activation {activation_id}")))?;

    let outcome = state.scheduler.cancel_saga(&SagaHandle::from(&saga)).await?;
    Ok(Json(CancelResponse {
        activation_id: activation_id.as_i64(),
        outcome: outcome.as_str(),
    }))
}

/// GET /sagas/flagged/{flag} — list sagas waiting for an operator.
pub async fn flagged<S: SagaStore + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(flag): Path<String>,
    Query(query): Query<FlaggedQuery>,
) -> Result<Json<Vec<SagaResponse>>, ApiError> {
    let flag: SagaFlag = flag.parse()?;
    let sagas = state
        .scheduler
        .store()
        .list_flagged(flag, query.limit.unwrap_or(DEFAULT_FLAGGED_LIMIT))
        .await?;
    Ok(Json(sagas.into_iter().map(SagaResponse::from).collect()))
}
