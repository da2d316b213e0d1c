//! The saga state machine.
//!
//! Every status change goes through [`SagaStore::transition`] guarded on the
//! version the executor last read. Side effects run only after the guarding
//! transition committed, so the writer that loses a race never performs them.

use chrono::Utc;
use common::ActivationId;
use domain::{Saga, SagaFlag, SagaStatus};
use saga_store::{SagaStore, SagaStoreExt, TransitionOptions};

use crate::activity::{Activities, Activity, ActivityFailure, Disposition};
use crate::config::RetryPolicy;
use crate::error::{Result, SagaError};
use crate::services::{DeliveryStatus, Ledger, NotificationKind, Notifier, StatusSource};

/// Rounds of reload-and-retry a cancel request makes before giving up on a
/// saga that keeps changing under it.
const MAX_CANCEL_ROUNDS: usize = 3;

/// How a single executor run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaOutcome {
    /// The code was delivered; no refund.
    Delivered,
    /// The refund was recorded and credited.
    Refunded,
    /// Another writer moved the saga first; nothing was done.
    Superseded(SagaStatus),
    /// The saga was not in a state this run acts on.
    Skipped(SagaStatus),
}

/// Reply to a manual cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// This request refunded the purchase.
    Refunded,
    /// The purchase had already been refunded.
    AlreadyRefunded,
    /// The code was delivered; nothing to cancel.
    AlreadyDelivered,
    /// Compensation is already under way elsewhere.
    InProgress,
}

impl CancelOutcome {
    /// Returns the outcome as a stable string.
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelOutcome::Refunded => "refunded",
            CancelOutcome::AlreadyRefunded => "already_refunded",
            CancelOutcome::AlreadyDelivered => "already_delivered",
            CancelOutcome::InProgress => "in_progress",
        }
    }
}

enum Transition {
    Applied(Saga),
    Lost(Saga),
}

/// Drives sagas through verification and compensation.
pub struct SagaExecutor<S, Src, L, N> {
    store: S,
    activities: Activities<Src, L, N>,
}

impl<S, Src, L, N> SagaExecutor<S, Src, L, N>
where
    S: SagaStore,
    Src: StatusSource,
    L: Ledger,
    N: Notifier,
{
    /// Creates a new executor.
    pub fn new(store: S, status_source: Src, ledger: L, notifier: N, policy: RetryPolicy) -> Self {
        Self {
            store,
            activities: Activities::new(status_source, ledger, notifier, policy),
        }
    }

    /// Returns the saga store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Fires the scheduled check for an activation.
    #[tracing::instrument(skip(self), fields(activation_id = %activation_id))]
    pub async fn run_scheduled(&self, activation_id: ActivationId) -> Result<SagaOutcome> {
        let saga = self
            .store
            .get(activation_id)
            .await?
            .ok_or(SagaError::NotFound(activation_id))?;
        self.fire(saga).await
    }

    /// Re-enters the state machine at the saga's stored status.
    ///
    /// Used by the recovery sweep for due and stalled sagas alike.
    #[tracing::instrument(
        skip(self, saga),
        fields(
            activation_id = %saga.activation_id,
            profile_id = %saga.profile_id,
            status = %saga.status,
        )
    )]
    pub async fn resume(&self, saga: Saga) -> Result<SagaOutcome> {
        if saga.flag.is_some() {
            tracing::debug!(flag = ?saga.flag, "flagged saga left alone");
            return Ok(SagaOutcome::Skipped(saga.status));
        }

        match saga.status {
            SagaStatus::Scheduled => self.fire(saga).await,
            SagaStatus::Checking => {
                tracing::info!("resuming interrupted status check");
                self.check(saga).await
            }
            SagaStatus::Expired | SagaStatus::Cancelling => {
                tracing::info!("resuming interrupted compensation");
                self.compensate(saga).await
            }
            SagaStatus::Refunded if saga.credited_at.is_none() => {
                // The listing may predate a credit that has since landed.
                let current = self.store.get_required(saga.activation_id).await?;
                if current.credited_at.is_some() || current.flag.is_some() {
                    return Ok(SagaOutcome::Skipped(current.status));
                }
                // The credit may or may not have happened before the crash.
                Err(self
                    .reconciliation(&current, "refund recorded without a confirmed credit")
                    .await)
            }
            status => Ok(SagaOutcome::Skipped(status)),
        }
    }

    /// Manually cancels a purchase.
    #[tracing::instrument(skip(self), fields(activation_id = %activation_id))]
    pub async fn cancel(&self, activation_id: ActivationId) -> Result<CancelOutcome> {
        for _ in 0..MAX_CANCEL_ROUNDS {
            let saga = self
                .store
                .get(activation_id)
                .await?
                .ok_or(SagaError::NotFound(activation_id))?;

            match saga.status {
                SagaStatus::Delivered => {
                    tracing::debug!("cancel after delivery ignored");
                    return Ok(CancelOutcome::AlreadyDelivered);
                }
                SagaStatus::Refunded => {
                    tracing::debug!("cancel after refund ignored");
                    self.notify(&saga, NotificationKind::AlreadyRefunded).await;
                    return Ok(CancelOutcome::AlreadyRefunded);
                }
                SagaStatus::Expired | SagaStatus::Cancelling => {
                    return Ok(CancelOutcome::InProgress);
                }
                SagaStatus::Scheduled | SagaStatus::Checking => {}
            }

            match self
                .try_transition(&saga, SagaStatus::Cancelling, &SagaStatus::CANCELLABLE)
                .await?
            {
                Transition::Applied(saga) => {
                    self.cancel_reservation(&saga).await;
                    return Ok(match self.compensate(saga).await? {
                        SagaOutcome::Refunded => CancelOutcome::Refunded,
                        _ => CancelOutcome::InProgress,
                    });
                }
                Transition::Lost(current) => {
                    tracing::debug!(status = %current.status, "cancel raced another writer, reloading");
                }
            }
        }

        Ok(CancelOutcome::InProgress)
    }

    async fn fire(&self, saga: Saga) -> Result<SagaOutcome> {
        if saga.status != SagaStatus::Scheduled || saga.flag.is_some() {
            tracing::debug!(status = %saga.status, "scheduled check no longer applies");
            return Ok(SagaOutcome::Skipped(saga.status));
        }

        match self
            .try_transition(&saga, SagaStatus::Checking, &[SagaStatus::Scheduled])
            .await?
        {
            Transition::Applied(saga) => self.check(saga).await,
            Transition::Lost(current) => Ok(SagaOutcome::Superseded(current.status)),
        }
    }

    async fn check(&self, saga: Saga) -> Result<SagaOutcome> {
        let status = match self.activities.query_status(&saga).await {
            Ok(status) => status,
            Err(failure) if failure.disposition() == Disposition::Fallback => {
                tracing::warn!(attempts = failure.attempts, error = %failure.error, "status unavailable, treating as pending");
                DeliveryStatus::Pending
            }
            Err(failure) => return Err(self.manual_review(&saga, &failure).await),
        };

        if status == DeliveryStatus::Delivered {
            return match self
                .try_transition(&saga, SagaStatus::Delivered, &[SagaStatus::Checking])
                .await?
            {
                Transition::Applied(saga) => {
                    metrics::counter!("saga_outcomes_total", "outcome" => "delivered").increment(1);
                    self.notify(&saga, NotificationKind::Delivered).await;
                    Ok(SagaOutcome::Delivered)
                }
                Transition::Lost(current) => Ok(SagaOutcome::Superseded(current.status)),
            };
        }

        self.cancel_reservation(&saga).await;
        match self
            .try_transition(&saga, SagaStatus::Expired, &[SagaStatus::Checking])
            .await?
        {
            Transition::Applied(saga) => self.compensate(saga).await,
            Transition::Lost(current) => Ok(SagaOutcome::Superseded(current.status)),
        }
    }

    async fn compensate(&self, saga: Saga) -> Result<SagaOutcome> {
        match self
            .try_transition(&saga, SagaStatus::Refunded, &SagaStatus::COMPENSABLE)
            .await?
        {
            Transition::Applied(saga) => self.settle(saga).await,
            Transition::Lost(current) => {
                tracing::debug!(status = %current.status, "compensation already handled");
                Ok(SagaOutcome::Superseded(current.status))
            }
        }
    }

    /// Credits and notifies after the refund was recorded. Runs at most once
    /// per saga: only the writer that committed `Refunded` gets here.
    async fn settle(&self, saga: Saga) -> Result<SagaOutcome> {
        if let Err(failure) = self.activities.execute(Activity::CreditRefund, &saga).await {
            return Err(self.reconciliation(&saga, &failure.to_string()).await);
        }

        if let Err(e) = self.store.mark_credited(saga.activation_id, Utc::now()).await {
            tracing::error!(error = %e, "credit applied but not recorded");
        }

        metrics::counter!("saga_outcomes_total", "outcome" => "refunded").increment(1);
        tracing::info!(amount = %saga.amount, profile_id = %saga.profile_id, "refund credited");
        self.notify(&saga, NotificationKind::Refunded).await;
        Ok(SagaOutcome::Refunded)
    }

    async fn notify(&self, saga: &Saga, kind: NotificationKind) {
        if let Err(failure) = self.activities.execute(Activity::Notify(kind), saga).await {
            tracing::warn!(%failure, "notification dropped");
        }
    }

    async fn cancel_reservation(&self, saga: &Saga) {
        if let Err(failure) = self
            .activities
            .execute(Activity::CancelReservation, saga)
            .await
        {
            // The refund still goes ahead; the provider may deliver late.
            tracing::warn!(%failure, "provider cancel failed");
        }
    }

    async fn try_transition(
        &self,
        saga: &Saga,
        to: SagaStatus,
        allowed_from: &[SagaStatus],
    ) -> Result<Transition> {
        let options = TransitionOptions::new(saga.version, allowed_from);

        match self.store.transition(saga.activation_id, to, options).await {
            Ok(updated) => {
                metrics::counter!("saga_transitions_total", "to" => to.as_str()).increment(1);
                tracing::info!(from = %saga.status, to = %to, version = %updated.version, "saga transitioned");
                Ok(Transition::Applied(updated))
            }
            Err(e) if e.is_conflict() => {
                let current = self.store.get_required(saga.activation_id).await?;
                tracing::debug!(
                    to = %to,
                    current = %current.status,
                    "transition lost to another writer"
                );
                Ok(Transition::Lost(current))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn manual_review(&self, saga: &Saga, failure: &ActivityFailure) -> SagaError {
        let reason = failure.to_string();
        if let Err(e) = self
            .store
            .flag(saga.activation_id, SagaFlag::ManualReview, &reason)
            .await
        {
            tracing::error!(error = %e, "failed to flag saga for manual review");
        }

        metrics::counter!("saga_manual_review_total").increment(1);
        tracing::error!(
            activation_id = %saga.activation_id,
            profile_id = %saga.profile_id,
            status = %saga.status,
            %reason,
            "saga flagged for manual review"
        );

        SagaError::PermanentFailure {
            activation_id: saga.activation_id,
            activity: failure.activity.name(),
            reason: failure.error.to_string(),
        }
    }

    async fn reconciliation(&self, saga: &Saga, reason: &str) -> SagaError {
        if let Err(e) = self
            .store
            .flag(saga.activation_id, SagaFlag::Reconciliation, reason)
            .await
        {
            tracing::error!(error = %e, "failed to flag saga for reconciliation");
        }

        metrics::counter!("saga_reconciliation_required_total").increment(1);
        tracing::error!(
            activation_id = %saga.activation_id,
            profile_id = %saga.profile_id,
            amount = %saga.amount,
            %reason,
            "refund requires reconciliation"
        );

        SagaError::ReconciliationRequired {
            activation_id: saga.activation_id,
            profile_id: saga.profile_id,
            amount: saga.amount,
            reason: reason.to_string(),
        }
    }
}
