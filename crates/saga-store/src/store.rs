use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::ActivationId;
use domain::{DomainError, Saga, SagaFlag, SagaStatus, Version};

use crate::{Result, SagaStoreError};

/// Guard for a conditional status transition.
///
/// The write only commits if the stored version equals `expected_version`
/// and the stored status is one of `allowed_from`.
#[derive(Debug, Clone)]
pub struct TransitionOptions {
    pub expected_version: Version,
    pub allowed_from: Vec<SagaStatus>,
}

impl TransitionOptions {
    /// Expects the saga to be at `version` and in one of `allowed_from`.
    pub fn new(version: Version, allowed_from: &[SagaStatus]) -> Self {
        Self {
            expected_version: version,
            allowed_from: allowed_from.to_vec(),
        }
    }

    /// Expects the saga to be exactly where `saga` says it is.
    pub fn from_current(saga: &Saga) -> Self {
        Self::new(saga.version, &[saga.status])
    }
}

/// Core trait for saga persistence.
///
/// `transition` is the only concurrency-control primitive the executor
/// relies on: every racing writer goes through it and exactly one commits.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Persists a new saga.
    ///
    /// Fails with `AlreadyExists` if a saga is stored for the same activation.
    async fn insert(&self, saga: Saga) -> Result<Saga>;

    /// Loads the saga for an activation.
    async fn get(&self, activation_id: ActivationId) -> Result<Option<Saga>>;

    /// Moves the saga to `to`, bumping its version.
    ///
    /// Fails with `StatusConflict` if the stored status is not in
    /// `options.allowed_from`, and with `ConcurrencyConflict` if the stored
    /// version differs from `options.expected_version`. Leaving `Scheduled`
    /// clears `run_at`.
    async fn transition(
        &self,
        activation_id: ActivationId,
        to: SagaStatus,
        options: TransitionOptions,
    ) -> Result<Saga>;

    /// Records that the ledger confirmed the refund credit.
    ///
    /// Only valid for `Refunded` sagas; repeated calls return the saga
    /// unchanged.
    async fn mark_credited(&self, activation_id: ActivationId, at: DateTime<Utc>) -> Result<Saga>;

    /// Flags the saga for operator attention, recording the reason.
    ///
    /// Leaves `version` untouched so a flag never fails a concurrent
    /// conditional transition.
    async fn flag(&self, activation_id: ActivationId, flag: SagaFlag, reason: &str)
    -> Result<Saga>;

    /// Returns unflagged `Scheduled` sagas whose `run_at` is at or before `now`,
    /// earliest first.
    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Saga>>;

    /// Returns unflagged sagas held in an executor-only status (or refunded
    /// without a confirmed credit) that were last updated at or before
    /// `cutoff`, oldest first.
    async fn list_stalled(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Saga>>;

    /// Returns sagas carrying `flag`, oldest update first.
    async fn list_flagged(&self, flag: SagaFlag, limit: usize) -> Result<Vec<Saga>>;
}

/// Extension trait providing convenience methods for saga stores.
#[async_trait]
pub trait SagaStoreExt: SagaStore {
    /// Loads a saga that must exist.
    async fn get_required(&self, activation_id: ActivationId) -> Result<Saga> {
        self.get(activation_id)
            .await?
            .ok_or(SagaStoreError::NotFound(activation_id))
    }

    /// Checks if a saga exists for the activation.
    async fn exists(&self, activation_id: ActivationId) -> Result<bool> {
        Ok(self.get(activation_id).await?.is_some())
    }
}

// Blanket implementation for all SagaStore implementations
impl<T: SagaStore + ?Sized> SagaStoreExt for T {}

/// Validates a transition request before it reaches storage.
///
/// Every allowed source status must have a direct edge to `to`.
pub fn validate_transition(to: SagaStatus, options: &TransitionOptions) -> Result<()> {
    if options.allowed_from.is_empty() {
        return Err(SagaStoreError::InvalidRequest(format!(
            "transition to {to} has no allowed source status"
        )));
    }

    for from in &options.allowed_from {
        from.ensure_transition(to)?;
    }

    Ok(())
}

/// Classifies a rejected transition against the currently stored record.
pub(crate) fn rejection(
    current: &Saga,
    to: SagaStatus,
    options: &TransitionOptions,
) -> SagaStoreError {
    if !options.allowed_from.contains(&current.status) {
        SagaStoreError::StatusConflict {
            activation_id: current.activation_id,
            actual: current.status,
            to,
        }
    } else {
        SagaStoreError::ConcurrencyConflict {
            activation_id: current.activation_id,
            expected: options.expected_version,
            actual: current.version,
        }
    }
}

/// Rejects writes that would attach a credit to a non-refunded saga.
pub(crate) fn ensure_refunded(current: &Saga) -> Result<()> {
    if current.status == SagaStatus::Refunded {
        Ok(())
    } else {
        Err(SagaStoreError::StatusConflict {
            activation_id: current.activation_id,
            actual: current.status,
            to: SagaStatus::Refunded,
        })
    }
}
