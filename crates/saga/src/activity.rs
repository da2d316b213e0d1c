//! External activities and the retry runner shared by all of them.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use backon::Retryable;
use domain::Saga;

use crate::config::RetryPolicy;
use crate::services::{DeliveryStatus, Ledger, NotificationKind, Notifier, ServiceError, StatusSource};

/// A side effect performed against an external collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    /// Ask the provider whether the code was delivered.
    QueryStatus,
    /// Ask the provider to cancel the activation.
    CancelReservation,
    /// Credit the saga amount back to the owner.
    CreditRefund,
    /// Tell the user about an outcome.
    Notify(NotificationKind),
}

/// What the executor does once an activity has failed for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Substitute a default result and carry on.
    Fallback,
    /// Log and carry on without a result.
    Continue,
    /// Stop the saga and flag it for an operator.
    Fatal,
}

impl Activity {
    /// Returns the activity name used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            Activity::QueryStatus => "query_status",
            Activity::CancelReservation => "cancel_reservation",
            Activity::CreditRefund => "credit_refund",
            Activity::Notify(_) => "notify",
        }
    }

    /// Disposition after the retry budget ran out on transient errors.
    pub fn on_exhausted(&self) -> Disposition {
        match self {
            Activity::QueryStatus => Disposition::Fallback,
            Activity::CancelReservation | Activity::Notify(_) => Disposition::Continue,
            Activity::CreditRefund => Disposition::Fatal,
        }
    }

    /// Disposition after a non-retryable error.
    pub fn on_rejected(&self) -> Disposition {
        match self {
            Activity::QueryStatus | Activity::CreditRefund => Disposition::Fatal,
            Activity::CancelReservation | Activity::Notify(_) => Disposition::Continue,
        }
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activity::Notify(kind) => write!(f, "notify({kind})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Result of a successful activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityOutput {
    /// Status reported by the provider.
    Status(DeliveryStatus),
    /// The activity has no result.
    Done,
}

impl ActivityOutput {
    /// Returns the reported status, if this output carries one.
    pub fn into_status(self) -> Option<DeliveryStatus> {
        match self {
            ActivityOutput::Status(status) => Some(status),
            ActivityOutput::Done => None,
        }
    }
}

/// An activity that did not succeed within its retry budget.
#[derive(Debug, Clone)]
pub struct ActivityFailure {
    pub activity: Activity,
    pub attempts: u32,
    pub error: ServiceError,
}

impl ActivityFailure {
    /// A successful attempt whose output does not fit the activity.
    ///
    /// Classified as non-retryable so the saga stops instead of guessing.
    pub fn unexpected_output(activity: Activity, output: ActivityOutput) -> Self {
        Self {
            activity,
            attempts: 1,
            error: ServiceError::Permanent(format!("unexpected output {output:?}")),
        }
    }

    /// Returns how the executor should proceed.
    pub fn disposition(&self) -> Disposition {
        if self.error.is_retryable() {
            self.activity.on_exhausted()
        } else {
            self.activity.on_rejected()
        }
    }
}

impl fmt::Display for ActivityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed after {} attempt(s): {}",
            self.activity, self.attempts, self.error
        )
    }
}

/// Dispatches activities to the collaborators and retries them.
pub struct Activities<Src, L, N> {
    status_source: Src,
    ledger: L,
    notifier: N,
    policy: RetryPolicy,
}

impl<Src, L, N> Activities<Src, L, N>
where
    Src: StatusSource,
    L: Ledger,
    N: Notifier,
{
    /// Creates a dispatcher over the given collaborators.
    pub fn new(status_source: Src, ledger: L, notifier: N, policy: RetryPolicy) -> Self {
        Self {
            status_source,
            ledger,
            notifier,
            policy,
        }
    }

    /// Returns the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Performs a single attempt of `activity` for `saga`.
    pub async fn perform(
        &self,
        activity: Activity,
        saga: &Saga,
    ) -> Result<ActivityOutput, ServiceError> {
        match activity {
            Activity::QueryStatus => self
                .status_source
                .get_status(saga.activation_id)
                .await
                .map(ActivityOutput::Status),
            Activity::CancelReservation => self
                .status_source
                .cancel(saga.activation_id)
                .await
                .map(|()| ActivityOutput::Done),
            Activity::CreditRefund => self
                .ledger
                .credit(saga.profile_id, saga.amount)
                .await
                .map(|()| ActivityOutput::Done),
            Activity::Notify(kind) => self
                .notifier
                .send(saga.chat_id, kind)
                .await
                .map(|()| ActivityOutput::Done),
        }
    }

    /// Queries the delivery status under the retry policy.
    pub async fn query_status(&self, saga: &Saga) -> Result<DeliveryStatus, ActivityFailure> {
        let output = self.execute(Activity::QueryStatus, saga).await?;
        output
            .into_status()
            .ok_or_else(|| ActivityFailure::unexpected_output(Activity::QueryStatus, output))
    }

    /// Runs `activity` under the retry policy.
    ///
    /// An `Unknown` delivery status counts as a transient failure. Retries
    /// stop at the first non-retryable error.
    pub async fn execute(
        &self,
        activity: Activity,
        saga: &Saga,
    ) -> Result<ActivityOutput, ActivityFailure> {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let activation_id = saga.activation_id;

        let result = (|| async move {
            attempts.fetch_add(1, Ordering::Relaxed);
            match self.perform(activity, saga).await? {
                ActivityOutput::Status(DeliveryStatus::Unknown) => Err(ServiceError::Transient(
                    "provider reported unknown status".to_string(),
                )),
                output => Ok(output),
            }
        })
        .retry(self.policy.backoff())
        .sleep(tokio::time::sleep)
        .when(ServiceError::is_retryable)
        .notify(|error: &ServiceError, delay| {
            metrics::counter!("saga_activity_retries_total", "activity" => activity.name())
                .increment(1);
            tracing::warn!(
                %activation_id,
                activity = %activity,
                ?delay,
                error = %error,
                "activity failed, retrying"
            );
        })
        .await;

        let attempts = counter.load(Ordering::Relaxed);
        match result {
            Ok(output) => {
                if attempts > 1 {
                    tracing::debug!(%activation_id, activity = %activity, attempts, "activity succeeded after retries");
                }
                Ok(output)
            }
            Err(error) => {
                metrics::counter!("saga_activity_failures_total", "activity" => activity.name())
                    .increment(1);
                Err(ActivityFailure {
                    activity,
                    attempts,
                    error,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use common::{ActivationId, ChatId, ProfileId};
    use domain::Amount;

    use super::*;
    use crate::services::{InMemoryLedger, InMemoryNotifier, InMemoryStatusSource};

    fn saga() -> Saga {
        Saga::scheduled(
            ActivationId::new(1001),
            ProfileId::new(42),
            ChatId::new(4200),
            Amount::new(2.5).unwrap(),
            Duration::ZERO,
            Utc::now(),
        )
        .unwrap()
    }

    fn activities(
        attempts: usize,
    ) -> (
        Activities<InMemoryStatusSource, InMemoryLedger, InMemoryNotifier>,
        InMemoryStatusSource,
        InMemoryLedger,
        InMemoryNotifier,
    ) {
        let source = InMemoryStatusSource::new();
        let ledger = InMemoryLedger::new();
        let notifier = InMemoryNotifier::new();
        let activities = Activities::new(
            source.clone(),
            ledger.clone(),
            notifier.clone(),
            RetryPolicy::immediate(attempts),
        );
        (activities, source, ledger, notifier)
    }

    #[test]
    fn test_classification() {
        assert_eq!(Activity::QueryStatus.on_exhausted(), Disposition::Fallback);
        assert_eq!(Activity::QueryStatus.on_rejected(), Disposition::Fatal);
        assert_eq!(Activity::CreditRefund.on_exhausted(), Disposition::Fatal);
        assert_eq!(
            Activity::Notify(NotificationKind::Refunded).on_rejected(),
            Disposition::Continue
        );
        assert_eq!(
            Activity::Notify(NotificationKind::Refunded).to_string(),
            "notify(refunded)"
        );
    }

    #[tokio::test]
    async fn test_dispatch_reaches_each_collaborator() {
        let (activities, source, ledger, notifier) = activities(1);
        let saga = saga();

        let status = activities.perform(Activity::QueryStatus, &saga).await.unwrap();
        assert_eq!(status, ActivityOutput::Status(DeliveryStatus::Pending));

        activities
            .perform(Activity::CancelReservation, &saga)
            .await
            .unwrap();
        activities.perform(Activity::CreditRefund, &saga).await.unwrap();
        activities
            .perform(Activity::Notify(NotificationKind::Refunded), &saga)
            .await
            .unwrap();

        assert_eq!(source.cancel_count(saga.activation_id), 1);
        assert_eq!(ledger.balance(saga.profile_id), 2.5);
        assert_eq!(notifier.sent_to(saga.chat_id), vec![NotificationKind::Refunded]);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let (activities, source, _, _) = activities(5);
        let saga = saga();
        source.fail_next_queries(3, ServiceError::Transient("timeout".to_string()));
        source.set_status(saga.activation_id, DeliveryStatus::Delivered);

        let status = activities.query_status(&saga).await.unwrap();
        assert_eq!(status, DeliveryStatus::Delivered);
        assert_eq!(source.query_count(saga.activation_id), 4);
    }

    #[test]
    fn test_missing_status_is_fatal() {
        assert_eq!(ActivityOutput::Done.into_status(), None);

        let failure = ActivityFailure::unexpected_output(Activity::QueryStatus, ActivityOutput::Done);
        assert!(!failure.error.is_retryable());
        assert_eq!(failure.disposition(), Disposition::Fatal);
    }

    #[tokio::test]
    async fn test_unknown_status_exhausts_to_fallback() {
        let (activities, source, _, _) = activities(3);
        let saga = saga();
        source.set_status(saga.activation_id, DeliveryStatus::Unknown);

        let failure = activities
            .execute(Activity::QueryStatus, &saga)
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.disposition(), Disposition::Fallback);
        assert_eq!(source.query_count(saga.activation_id), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_short_circuits() {
        let (activities, _, ledger, _) = activities(10);
        let saga = saga();
        ledger.set_fail_permanently(true);

        let failure = activities
            .execute(Activity::CreditRefund, &saga)
            .await
            .unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(failure.disposition(), Disposition::Fatal);
    }
}
