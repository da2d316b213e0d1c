//! Deferred verification and compensation for activation purchases.
//!
//! A purchase is verified after a grace period and refunded exactly once
//! if the code never arrived. The pieces, leaves first:
//!
//! - [`services`]: the status source, ledger and notifier collaborators
//! - [`activity`]: the side effects the saga performs, run under a retry policy
//! - [`executor`]: the state machine that commits transitions and then acts
//! - [`scheduler`]: saga creation, the recovery sweep and manual cancels
//!
//! Races between the sweep and a manual cancel are settled by the store's
//! conditional transition, never by in-process locks.

pub mod activity;
pub mod config;
pub mod error;
pub mod executor;
pub mod scheduler;
pub mod services;

pub use activity::{Activities, Activity, ActivityFailure, ActivityOutput, Disposition};
pub use config::{RetryPolicy, SchedulerConfig};
pub use error::{Result, SagaError};
pub use executor::{CancelOutcome, SagaExecutor, SagaOutcome};
pub use scheduler::{SagaHandle, ScheduleCheck, Scheduler, SweepReport};
pub use services::{
    DeliveryStatus, InMemoryLedger, InMemoryNotifier, InMemoryStatusSource, Ledger,
    NotificationKind, Notifier, ServiceError, StatusSource,
};
