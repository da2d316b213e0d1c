//! Domain error types.

use thiserror::Error;

use crate::state::SagaStatus;

/// Errors raised while validating saga data or transitions.
#[derive(Debug, Error, PartialEq)]
pub enum DomainError {
    /// Amount is not a positive, finite number.
    #[error("Invalid amount: {0}")]
    InvalidAmount(f64),

    /// Delay cannot be represented as a timestamp offset.
    #[error("Invalid delay: {0}")]
    InvalidDelay(String),

    /// The requested status change is not an edge of the saga graph.
    #[error("Invalid saga transition from {from} to {to}")]
    InvalidTransition { from: SagaStatus, to: SagaStatus },

    /// A persisted status value could not be decoded.
    #[error("Unknown saga status: {0}")]
    UnknownStatus(String),

    /// A persisted flag value could not be decoded.
    #[error("Unknown saga flag: {0}")]
    UnknownFlag(String),
}
