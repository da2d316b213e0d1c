//! Durable storage for activation sagas.
//!
//! Both stores implement the same [`SagaStore`] contract, whose
//! [`SagaStore::transition`] is a version- and status-guarded conditional
//! update: of any number of racing writers exactly one commits.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;

pub use error::{Result, SagaStoreError};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use store::{SagaStore, SagaStoreExt, TransitionOptions, validate_transition};
