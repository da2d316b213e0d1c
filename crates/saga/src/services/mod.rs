//! External collaborator traits and in-memory implementations.

pub mod ledger;
pub mod notifier;
pub mod status_source;

use thiserror::Error;

pub use ledger::{InMemoryLedger, Ledger};
pub use notifier::{InMemoryNotifier, NotificationKind, Notifier};
pub use status_source::{DeliveryStatus, InMemoryStatusSource, StatusSource};

/// Failure reported by an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// Timeouts, temporary unavailability; worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Malformed data, constraint violations; retrying cannot help.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl ServiceError {
    /// Returns true if the failed call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Transient(_))
    }
}
