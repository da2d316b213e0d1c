use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::ActivationId;
use domain::{Saga, SagaFlag, SagaStatus};
use tokio::sync::RwLock;

use crate::{
    Result, SagaStoreError,
    store::{SagaStore, TransitionOptions, ensure_refunded, rejection, validate_transition},
};

/// In-memory saga store.
///
/// Clones share the same records, so a fresh scheduler built over a clone
/// behaves like a process restart against a durable database.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    sagas: Arc<RwLock<HashMap<ActivationId, Saga>>>,
}

impl InMemorySagaStore {
    /// Creates a new empty in-memory saga store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of sagas stored.
    pub async fn saga_count(&self) -> usize {
        self.sagas.read().await.len()
    }

    /// Inserts or replaces a record verbatim, bypassing every guard.
    ///
    /// Used to seed state left behind by a crashed process.
    pub async fn restore(&self, saga: Saga) {
        self.sagas.write().await.insert(saga.activation_id, saga);
    }

    /// Clears all sagas.
    pub async fn clear(&self) {
        self.sagas.write().await.clear();
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn insert(&self, saga: Saga) -> Result<Saga> {
        let mut sagas = self.sagas.write().await;

        if sagas.contains_key(&saga.activation_id) {
            return Err(SagaStoreError::AlreadyExists(saga.activation_id));
        }

        sagas.insert(saga.activation_id, saga.clone());
        Ok(saga)
    }

    async fn get(&self, activation_id: ActivationId) -> Result<Option<Saga>> {
        Ok(self.sagas.read().await.get(&activation_id).cloned())
    }

    async fn transition(
        &self,
        activation_id: ActivationId,
        to: SagaStatus,
        options: TransitionOptions,
    ) -> Result<Saga> {
        validate_transition(to, &options)?;

        let mut sagas = self.sagas.write().await;
        let saga = sagas
            .get_mut(&activation_id)
            .ok_or(SagaStoreError::NotFound(activation_id))?;

        if !options.allowed_from.contains(&saga.status)
            || saga.version != options.expected_version
        {
            metrics::counter!("saga_store_conflicts_total").increment(1);
            return Err(rejection(saga, to, &options));
        }

        saga.apply_transition(to, Utc::now())?;
        Ok(saga.clone())
    }

    async fn mark_credited(&self, activation_id: ActivationId, at: DateTime<Utc>) -> Result<Saga> {
        let mut sagas = self.sagas.write().await;
        let saga = sagas
            .get_mut(&activation_id)
            .ok_or(SagaStoreError::NotFound(activation_id))?;

        ensure_refunded(saga)?;
        if saga.credited_at.is_none() {
            saga.credited_at = Some(at);
            saga.touch(Utc::now());
        }
        Ok(saga.clone())
    }

    async fn flag(
        &self,
        activation_id: ActivationId,
        flag: SagaFlag,
        reason: &str,
    ) -> Result<Saga> {
        let mut sagas = self.sagas.write().await;
        let saga = sagas
            .get_mut(&activation_id)
            .ok_or(SagaStoreError::NotFound(activation_id))?;

        saga.flag = Some(flag);
        saga.last_error = Some(reason.to_string());
        saga.updated_at = Utc::now();
        Ok(saga.clone())
    }

    async fn list_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Saga>> {
        let sagas = self.sagas.read().await;
        let mut due: Vec<_> = sagas.values().filter(|s| s.is_due(now)).cloned().collect();
        due.sort_by_key(|s| s.run_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn list_stalled(&self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<Saga>> {
        let sagas = self.sagas.read().await;
        let mut stalled: Vec<_> = sagas
            .values()
            .filter(|s| s.is_stalled(cutoff))
            .cloned()
            .collect();
        stalled.sort_by_key(|s| s.updated_at);
        stalled.truncate(limit);
        Ok(stalled)
    }

    async fn list_flagged(&self, flag: SagaFlag, limit: usize) -> Result<Vec<Saga>> {
        let sagas = self.sagas.read().await;
        let mut flagged: Vec<_> = sagas
            .values()
            .filter(|s| s.flag == Some(flag))
            .cloned()
            .collect();
        flagged.sort_by_key(|s| s.updated_at);
        flagged.truncate(limit);
        Ok(flagged)
    }
}
