//! Durable scheduler.
//!
//! The delay of a scheduled check lives in the saga's persisted `run_at`.
//! A background sweep polls the store for due sagas, and for sagas left
//! in flight by a crashed run, and hands them to the executor. Nothing is
//! kept in process memory that a restart would lose.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use common::{ActivationId, ChatId, ProfileId, SagaId};
use domain::{Amount, Saga};
use saga_store::{SagaStore, SagaStoreError, SagaStoreExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::config::SchedulerConfig;
use crate::error::{Result, SagaError};
use crate::executor::{CancelOutcome, SagaExecutor};
use crate::services::{Ledger, Notifier, StatusSource};

/// Reference to a scheduled saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaHandle {
    pub saga_id: SagaId,
    pub activation_id: ActivationId,
}

impl From<&Saga> for SagaHandle {
    fn from(saga: &Saga) -> Self {
        Self {
            saga_id: saga.id,
            activation_id: saga.activation_id,
        }
    }
}

/// Request to verify a purchase after a grace period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleCheck {
    pub profile_id: ProfileId,
    pub chat_id: ChatId,
    pub activation_id: ActivationId,
    pub amount: f64,
    /// Overrides the configured check delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_secs: Option<u64>,
}

impl ScheduleCheck {
    /// Creates a request using the configured check delay.
    pub fn new(
        profile_id: ProfileId,
        chat_id: ChatId,
        activation_id: ActivationId,
        amount: f64,
    ) -> Self {
        Self {
            profile_id,
            chat_id,
            activation_id,
            amount,
            delay_secs: None,
        }
    }

    /// Sets an explicit delay, truncated to whole seconds.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_secs = Some(delay.as_secs());
        self
    }
}

/// Summary of one recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Scheduled sagas whose `run_at` had passed.
    pub due: usize,
    /// In-flight sagas not touched within the stall timeout.
    pub stalled: usize,
    /// Runs started by this sweep.
    pub spawned: usize,
    /// Sagas already being run by this process.
    pub skipped: usize,
}

/// Releases an activation id from the in-flight set when its run ends,
/// including by panic.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<ActivationId>>>,
    activation_id: ActivationId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.activation_id);
    }
}

struct Inner<S, Src, L, N> {
    executor: SagaExecutor<S, Src, L, N>,
    config: SchedulerConfig,
    started: AtomicBool,
    shutdown: watch::Sender<bool>,
    in_flight: Arc<Mutex<HashSet<ActivationId>>>,
    permits: Semaphore,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    runner: Mutex<Option<JoinHandle<()>>>,
}

/// Schedules checks, runs the recovery sweep and forwards manual cancels.
pub struct Scheduler<S, Src, L, N> {
    inner: Arc<Inner<S, Src, L, N>>,
}

impl<S, Src, L, N> Clone for Scheduler<S, Src, L, N> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, Src, L, N> Scheduler<S, Src, L, N>
where
    S: SagaStore + 'static,
    Src: StatusSource + 'static,
    L: Ledger + 'static,
    N: Notifier + 'static,
{
    /// Creates a scheduler around an executor. Nothing runs until
    /// [`Self::prepare`] is called.
    pub fn new(executor: SagaExecutor<S, Src, L, N>, config: SchedulerConfig) -> Self {
        let permits = Semaphore::new(config.max_in_flight.max(1));
        Self {
            inner: Arc::new(Inner {
                executor,
                config,
                started: AtomicBool::new(false),
                shutdown: watch::Sender::new(false),
                in_flight: Arc::new(Mutex::new(HashSet::new())),
                permits,
                tasks: tokio::sync::Mutex::new(JoinSet::new()),
                runner: Mutex::new(None),
            }),
        }
    }

    /// Returns the executor.
    pub fn executor(&self) -> &SagaExecutor<S, Src, L, N> {
        &self.inner.executor
    }

    /// Returns the saga store.
    pub fn store(&self) -> &S {
        self.inner.executor.store()
    }

    /// Returns the scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Returns the number of sagas this process is currently running.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().unwrap().len()
    }

    /// Creates a saga due after the requested delay.
    ///
    /// Repeating a request for an activation that already has a saga
    /// returns the existing handle, provided the purchase matches.
    #[tracing::instrument(
        skip(self, request),
        fields(
            activation_id = %request.activation_id,
            profile_id = %request.profile_id,
        )
    )]
    pub async fn schedule_check(&self, request: ScheduleCheck) -> Result<SagaHandle> {
        let amount = Amount::new(request.amount)?;
        let delay = request
            .delay_secs
            .map(Duration::from_secs)
            .unwrap_or(self.inner.config.check_delay);
        let saga = Saga::scheduled(
            request.activation_id,
            request.profile_id,
            request.chat_id,
            amount,
            delay,
            Utc::now(),
        )?;

        match self.store().insert(saga).await {
            Ok(saga) => {
                metrics::counter!("sagas_scheduled_total").increment(1);
                tracing::info!(saga_id = %saga.id, run_at = ?saga.run_at, "saga scheduled");
                Ok(SagaHandle::from(&saga))
            }
            Err(SagaStoreError::AlreadyExists(activation_id)) => {
                let existing = self.store().get_required(activation_id).await?;
                if existing.matches_purchase(request.profile_id, request.chat_id, amount) {
                    tracing::debug!(saga_id = %existing.id, "saga already scheduled");
                    Ok(SagaHandle::from(&existing))
                } else {
                    Err(SagaError::Creation {
                        activation_id,
                        reason: "activation belongs to a different purchase".to_string(),
                    })
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Cancels a purchase right away, without waiting for `run_at`.
    pub async fn cancel_saga(&self, handle: &SagaHandle) -> Result<CancelOutcome> {
        self.inner.executor.cancel(handle.activation_id).await
    }

    /// Starts the background sweep. The first sweep runs immediately.
    /// Calling it again is a no-op.
    pub fn prepare(&self) -> Result<()> {
        if self.inner.config.sweep_interval.is_zero() {
            return Err(SagaError::Scheduler(
                "sweep interval must be positive".to_string(),
            ));
        }
        let mut shutdown = self.inner.shutdown.subscribe();
        if *shutdown.borrow() {
            return Err(SagaError::Scheduler("scheduler has been shut down".to_string()));
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let scheduler = self.clone();
        let runner = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(scheduler.inner.config.sweep_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = scheduler.sweep().await {
                            tracing::error!(error = %e, "recovery sweep failed");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::info!("recovery sweep stopped");
        });

        *self.inner.runner.lock().unwrap() = Some(runner);
        tracing::info!(
            interval = ?self.inner.config.sweep_interval,
            max_in_flight = self.inner.config.max_in_flight,
            "scheduler started"
        );
        Ok(())
    }

    /// Runs one recovery pass: spawns due and stalled sagas and returns
    /// without waiting for them.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let started = Instant::now();
        let now = Utc::now();
        let batch = self.inner.config.batch_size;

        let due = self.store().list_due(now, batch).await?;
        let stalled = match chrono::Duration::from_std(self.inner.config.stall_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
        {
            Some(cutoff) => self.store().list_stalled(cutoff, batch).await?,
            None => Vec::new(),
        };

        let mut report = SweepReport {
            due: due.len(),
            stalled: stalled.len(),
            ..SweepReport::default()
        };

        let mut tasks = self.inner.tasks.lock().await;
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                tracing::error!(error = %e, "saga task aborted");
            }
        }

        for saga in due.into_iter().chain(stalled) {
            if self.spawn(&mut tasks, saga) {
                report.spawned += 1;
            } else {
                report.skipped += 1;
            }
        }

        metrics::histogram!("saga_sweep_duration_seconds").record(started.elapsed().as_secs_f64());
        metrics::gauge!("saga_sweep_due_sagas").set(report.due as f64);
        if report.spawned > 0 {
            tracing::info!(
                due = report.due,
                stalled = report.stalled,
                spawned = report.spawned,
                "recovery sweep dispatched sagas"
            );
        }
        Ok(report)
    }

    /// Waits for every spawned saga run to finish.
    pub async fn drain(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "saga task aborted");
            }
        }
    }

    /// Stops the sweep loop and waits for running sagas.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);

        let runner = self.inner.runner.lock().unwrap().take();
        if let Some(runner) = runner
            && let Err(e) = runner.await
        {
            tracing::error!(error = %e, "sweep loop aborted");
        }

        self.drain().await;
        tracing::info!("scheduler stopped");
    }

    fn spawn(&self, tasks: &mut JoinSet<()>, saga: Saga) -> bool {
        let activation_id = saga.activation_id;
        if !self.inner.in_flight.lock().unwrap().insert(activation_id) {
            return false;
        }

        let guard = InFlightGuard {
            in_flight: Arc::clone(&self.inner.in_flight),
            activation_id,
        };
        let inner = Arc::clone(&self.inner);
        tasks.spawn(async move {
            let _guard = guard;
            if let Ok(_permit) = inner.permits.acquire().await {
                match inner.executor.resume(saga).await {
                    Ok(outcome) => tracing::debug!(%activation_id, ?outcome, "saga run finished"),
                    // Already reported with full saga identity.
                    Err(e) if e.is_fatal() => {}
                    Err(e) => tracing::warn!(
                        %activation_id,
                        error = %e,
                        "saga run failed, left for a later sweep"
                    ),
                }
            }
        });
        true
    }
}
