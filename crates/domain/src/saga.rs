//! The persisted saga record.

use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{ActivationId, ChatId, ProfileId, SagaId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::state::SagaStatus;
use crate::value_objects::{Amount, SagaFlag, Version};

/// One purchased activation and the state of its verification/refund lifecycle.
///
/// Identity fields and `amount` never change after creation; `status`,
/// `version` and the bookkeeping fields are only changed through a saga
/// store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Saga {
    pub id: SagaId,
    pub activation_id: ActivationId,
    pub profile_id: ProfileId,
    pub chat_id: ChatId,
    pub amount: Amount,
    pub status: SagaStatus,
    pub version: Version,
    /// Due timestamp of the scheduled check; `None` once consumed.
    pub run_at: Option<DateTime<Utc>>,
    /// Set when the ledger confirmed the refund credit.
    pub credited_at: Option<DateTime<Utc>>,
    pub flag: Option<SagaFlag>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Saga {
    /// Creates a new `Scheduled` saga due `delay` after `now`.
    pub fn scheduled(
        activation_id: ActivationId,
        profile_id: ProfileId,
        chat_id: ChatId,
        amount: Amount,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        let delay =
            chrono::Duration::from_std(delay).map_err(|e| DomainError::InvalidDelay(e.to_string()))?;
        let run_at = now
            .checked_add_signed(delay)
            .ok_or_else(|| DomainError::InvalidDelay("due timestamp out of range".to_string()))?;

        Ok(Self {
            id: SagaId::new(),
            activation_id,
            profile_id,
            chat_id,
            amount,
            status: SagaStatus::Scheduled,
            version: Version::first(),
            run_at: Some(run_at),
            credited_at: None,
            flag: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Returns true if the scheduled check should fire at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SagaStatus::Scheduled
            && self.flag.is_none()
            && self.run_at.is_some_and(|run_at| run_at <= now)
    }

    /// Returns true if the saga sits in a non-terminal, executor-held status
    /// (or is refunded without a confirmed credit) and has not been touched
    /// since `cutoff`.
    pub fn is_stalled(&self, cutoff: DateTime<Utc>) -> bool {
        if self.flag.is_some() || self.updated_at > cutoff {
            return false;
        }
        SagaStatus::IN_FLIGHT.contains(&self.status)
            || (self.status == SagaStatus::Refunded && self.credited_at.is_none())
    }

    /// Returns true if this saga describes the same purchase as the given
    /// fields; used to make creation idempotent.
    pub fn matches_purchase(&self, profile_id: ProfileId, chat_id: ChatId, amount: Amount) -> bool {
        self.profile_id == profile_id && self.chat_id == chat_id && self.amount == amount
    }

    /// Applies a status change, bumping the version and consuming `run_at`
    /// when the saga leaves `Scheduled`.
    pub fn apply_transition(
        &mut self,
        next: SagaStatus,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        self.status.ensure_transition(next)?;
        self.status = next;
        if next != SagaStatus::Scheduled {
            self.run_at = None;
        }
        self.touch(now);
        Ok(())
    }

    /// Bumps the version and the update timestamp.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.version = self.version.next();
        self.updated_at = now;
    }
}
