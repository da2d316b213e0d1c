//! Domain layer for the activation refund saga.
//!
//! This crate provides:
//! - the persisted [`Saga`] record
//! - the [`SagaStatus`] state machine and its legal transitions
//! - value objects ([`Amount`], [`Version`], [`SagaFlag`])

pub mod error;
pub mod saga;
pub mod state;
pub mod value_objects;

pub use error::DomainError;
pub use saga::Saga;
pub use state::SagaStatus;
pub use value_objects::{Amount, SagaFlag, Version};
