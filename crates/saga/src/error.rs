//! Saga error types.

use common::{ActivationId, ProfileId};
use domain::{Amount, DomainError};
use saga_store::SagaStoreError;
use thiserror::Error;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Saga store error.
    #[error("Saga store error: {0}")]
    Store(#[from] SagaStoreError),

    /// Domain error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// No saga exists for the activation.
    #[error("Saga not found for activation {0}")]
    NotFound(ActivationId),

    /// An existing saga disagrees with a creation request.
    #[error("Cannot create saga for activation {activation_id}: {reason}")]
    Creation {
        activation_id: ActivationId,
        reason: String,
    },

    /// An activity failed with a non-retryable error; the saga was flagged
    /// for manual review.
    #[error("Activity '{activity}' failed permanently for activation {activation_id}: {reason}")]
    PermanentFailure {
        activation_id: ActivationId,
        activity: &'static str,
        reason: String,
    },

    /// The refund was recorded but the credit did not go through.
    #[error(
        "Refund of {amount} to profile {profile_id} for activation {activation_id} needs reconciliation: {reason}"
    )]
    ReconciliationRequired {
        activation_id: ActivationId,
        profile_id: ProfileId,
        amount: Amount,
        reason: String,
    },

    /// The scheduler is not in a state to accept the request.
    #[error("Scheduler error: {0}")]
    Scheduler(String),
}

impl SagaError {
    /// Returns true if an operator has to look at the saga.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SagaError::PermanentFailure { .. } | SagaError::ReconciliationRequired { .. }
        )
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
