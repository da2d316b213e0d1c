//! Provider status source trait and in-memory implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::ActivationId;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use super::ServiceError;

/// Delivery status of an activation as reported by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryStatus {
    /// The SMS code reached the user.
    Delivered,
    /// No code yet.
    Pending,
    /// The provider could not tell; treated like a transient failure.
    Unknown,
}

/// Trait for the SMS activation provider.
#[async_trait]
pub trait StatusSource: Send + Sync {
    /// Returns the current delivery status of an activation.
    async fn get_status(&self, activation_id: ActivationId)
    -> Result<DeliveryStatus, ServiceError>;

    /// Asks the provider to cancel the activation and release the number.
    async fn cancel(&self, activation_id: ActivationId) -> Result<(), ServiceError>;
}

#[derive(Debug, Default)]
struct InMemoryStatusState {
    statuses: HashMap<ActivationId, DeliveryStatus>,
    query_failures: VecDeque<ServiceError>,
    queries: HashMap<ActivationId, u32>,
    cancels: HashMap<ActivationId, u32>,
    fail_on_cancel: bool,
}

/// In-memory status source for testing.
///
/// Activations report `Pending` unless told otherwise. Queries can be held
/// at a gate so tests can interleave other work with an in-progress check.
#[derive(Debug, Clone)]
pub struct InMemoryStatusSource {
    state: Arc<RwLock<InMemoryStatusState>>,
    gate: Arc<watch::Sender<bool>>,
}

impl Default for InMemoryStatusSource {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            gate: Arc::new(watch::Sender::new(true)),
        }
    }
}

impl InMemoryStatusSource {
    /// Creates a new in-memory status source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the status reported for an activation.
    pub fn set_status(&self, activation_id: ActivationId, status: DeliveryStatus) {
        self.state
            .write()
            .unwrap()
            .statuses
            .insert(activation_id, status);
    }

    /// Makes the next `count` status queries fail with `error`.
    pub fn fail_next_queries(&self, count: usize, error: ServiceError) {
        let mut state = self.state.write().unwrap();
        state
            .query_failures
            .extend(std::iter::repeat_n(error, count));
    }

    /// Configures cancel requests to fail.
    pub fn set_fail_on_cancel(&self, fail: bool) {
        self.state.write().unwrap().fail_on_cancel = fail;
    }

    /// Holds every status query until [`Self::open_gate`] is called.
    pub fn close_gate(&self) {
        self.gate.send_replace(false);
    }

    /// Releases held status queries.
    pub fn open_gate(&self) {
        self.gate.send_replace(true);
    }

    /// Returns how many status queries were started for an activation.
    pub fn query_count(&self, activation_id: ActivationId) -> u32 {
        self.state
            .read()
            .unwrap()
            .queries
            .get(&activation_id)
            .copied()
            .unwrap_or(0)
    }

    /// Returns how many cancel requests were made for an activation.
    pub fn cancel_count(&self, activation_id: ActivationId) -> u32 {
        self.state
            .read()
            .unwrap()
            .cancels
            .get(&activation_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl StatusSource for InMemoryStatusSource {
    async fn get_status(
        &self,
        activation_id: ActivationId,
    ) -> Result<DeliveryStatus, ServiceError> {
        *self
            .state
            .write()
            .unwrap()
            .queries
            .entry(activation_id)
            .or_default() += 1;

        let mut gate = self.gate.subscribe();
        let _ = gate.wait_for(|open| *open).await;

        let mut state = self.state.write().unwrap();
        if let Some(error) = state.query_failures.pop_front() {
            return Err(error);
        }
        let status = state
            .statuses
            .get(&activation_id)
            .copied()
            .unwrap_or(DeliveryStatus::Pending);
        tracing::debug!(%activation_id, ?status, "provider status queried");
        Ok(status)
    }

    async fn cancel(&self, activation_id: ActivationId) -> Result<(), ServiceError> {
        let mut state = self.state.write().unwrap();
        *state.cancels.entry(activation_id).or_default() += 1;

        if state.fail_on_cancel {
            return Err(ServiceError::Transient("provider unavailable".to_string()));
        }
        tracing::debug!(%activation_id, "provider activation cancelled");
        Ok(())
    }
}
