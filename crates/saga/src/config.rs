//! Retry and scheduling configuration.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Exponential backoff policy applied to every external activity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Factor applied to the delay after each failed attempt.
    pub multiplier: f32,
    /// Upper bound on the delay between two attempts.
    pub max_interval: Duration,
    /// Total number of attempts, the first one included.
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            multiplier: 2.0,
            max_interval: Duration::from_secs(100),
            max_attempts: 500,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries `max_attempts` times without sleeping.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            initial_interval: Duration::ZERO,
            multiplier: 1.0,
            max_interval: Duration::ZERO,
            max_attempts,
        }
    }

    /// Overrides the attempt ceiling.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Builds the backoff schedule. The first attempt is not a retry, so
    /// the builder gets one fewer than `max_attempts`.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_interval)
            .with_factor(self.multiplier)
            .with_max_delay(self.max_interval)
            .with_max_times(self.max_attempts.saturating_sub(1))
    }
}

/// Configuration of the durable scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Grace period between purchase and status check.
    pub check_delay: Duration,
    /// How often the recovery sweep runs.
    pub sweep_interval: Duration,
    /// Maximum rows fetched per query in one sweep.
    pub batch_size: usize,
    /// Maximum sagas executed concurrently by this process.
    pub max_in_flight: usize,
    /// Age after which an in-flight saga is considered abandoned.
    pub stall_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_delay: Duration::from_secs(180),
            sweep_interval: Duration::from_secs(15),
            batch_size: 100,
            max_in_flight: 32,
            stall_timeout: Duration::from_secs(15 * 60),
        }
    }
}

impl SchedulerConfig {
    /// Sets the default check delay.
    pub fn with_check_delay(mut self, delay: Duration) -> Self {
        self.check_delay = delay;
        self
    }

    /// Sets the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Sets the stall timeout.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_interval, Duration::from_secs(100));
        assert_eq!(policy.max_attempts, 500);
    }

    #[test]
    fn test_backoff_schedule_is_capped() {
        use backon::BackoffBuilder;

        let delays: Vec<Duration> = RetryPolicy::default().backoff().build().take(10).collect();
        assert_eq!(delays[0], Duration::from_secs(1));
        assert_eq!(delays[1], Duration::from_secs(2));
        assert_eq!(delays[6], Duration::from_secs(64));
        assert_eq!(delays[7], Duration::from_secs(100));
        assert_eq!(delays[9], Duration::from_secs(100));
    }

    #[test]
    fn test_backoff_counts_retries_not_attempts() {
        use backon::BackoffBuilder;

        assert_eq!(RetryPolicy::immediate(3).backoff().build().count(), 2);
        assert_eq!(RetryPolicy::immediate(1).backoff().build().count(), 0);
        assert_eq!(RetryPolicy::immediate(0).backoff().build().count(), 0);
    }

    #[test]
    fn test_scheduler_defaults() {
        let config = SchedulerConfig::default()
            .with_sweep_interval(Duration::from_secs(1));
        assert_eq!(config.check_delay, Duration::from_secs(180));
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.max_in_flight, 32);
    }
}
