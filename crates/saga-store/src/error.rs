use common::ActivationId;
use domain::{DomainError, SagaStatus, Version};
use thiserror::Error;

/// Errors that can occur when interacting with the saga store.
#[derive(Debug, Error)]
pub enum SagaStoreError {
    /// The stored version did not match the caller's expectation.
    #[error(
        "Concurrency conflict for activation {activation_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        activation_id: ActivationId,
        expected: Version,
        actual: Version,
    },

    /// The stored status is outside the allowed source set of a transition.
    #[error("Saga for activation {activation_id} is {actual}, cannot move to {to}")]
    StatusConflict {
        activation_id: ActivationId,
        actual: SagaStatus,
        to: SagaStatus,
    },

    /// A saga already exists for the activation.
    #[error("Saga already exists for activation {0}")]
    AlreadyExists(ActivationId),

    /// No saga exists for the activation.
    #[error("Saga not found for activation {0}")]
    NotFound(ActivationId),

    /// A malformed request was rejected before touching storage.
    #[error("Invalid store request: {0}")]
    InvalidRequest(String),

    /// Stored or requested data violates a domain rule.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl SagaStoreError {
    /// Returns true if another writer won the race for this saga.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            SagaStoreError::ConcurrencyConflict { .. } | SagaStoreError::StatusConflict { .. }
        )
    }

    /// Returns true if retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            SagaStoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, SagaStoreError>;
