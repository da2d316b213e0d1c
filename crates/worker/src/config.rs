//! Worker configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use saga::{RetryPolicy, SchedulerConfig};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

/// Worker configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: bind address (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json` (default `text`)
/// - `DATABASE_URL`: PostgreSQL connection string; in-memory store when unset
/// - `CHECK_DELAY_SECS`: grace period before the status check (default 180)
/// - `SWEEP_INTERVAL_SECS`: recovery sweep period (default 15)
/// - `STALL_TIMEOUT_SECS`: age of an abandoned in-flight saga (default 900)
/// - `RETRY_MAX_ATTEMPTS`: attempt ceiling per activity (default 500)
/// - `STUB_SERVICES`: run with the in-memory provider, ledger and chat
///   stand-ins (default `false`, which refuses to start)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub check_delay: Duration,
    pub sweep_interval: Duration,
    pub stall_timeout: Duration,
    pub retry_max_attempts: usize,
    pub stub_services: bool,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("HOST").unwrap_or(defaults.host),
            port: parse_env("PORT").unwrap_or(defaults.port),
            log_level: std::env::var("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: parse_env("LOG_FORMAT").unwrap_or(defaults.log_format),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.is_empty()),
            check_delay: parse_env("CHECK_DELAY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.check_delay),
            sweep_interval: parse_env("SWEEP_INTERVAL_SECS")
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_interval),
            stall_timeout: parse_env("STALL_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stall_timeout),
            retry_max_attempts: parse_env("RETRY_MAX_ATTEMPTS")
                .filter(|attempts| *attempts > 0)
                .unwrap_or(defaults.retry_max_attempts),
            stub_services: parse_env("STUB_SERVICES").unwrap_or(defaults.stub_services),
        }
    }

    /// Checks that the worker may start.
    ///
    /// Only in-memory collaborators are wired in. Their status source always
    /// reports `Pending`, so every due purchase would be refunded; running
    /// with them must be asked for explicitly.
    pub fn validate(&self) -> Result<(), String> {
        if self.stub_services {
            Ok(())
        } else {
            Err("no provider, ledger or chat integration configured; \
                 set STUB_SERVICES=true to run with in-memory stand-ins"
                .to_string())
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns the scheduler settings.
    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig::default()
            .with_check_delay(self.check_delay)
            .with_sweep_interval(self.sweep_interval)
            .with_stall_timeout(self.stall_timeout)
    }

    /// Returns the activity retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default().with_max_attempts(self.retry_max_attempts)
    }
}

impl Default for Config {
    fn default() -> Self {
        let scheduler = SchedulerConfig::default();
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            database_url: None,
            check_delay: scheduler.check_delay,
            sweep_interval: scheduler.sweep_interval,
            stall_timeout: scheduler.stall_timeout,
            retry_max_attempts: RetryPolicy::default().max_attempts,
            stub_services: false,
        }
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let config = Config::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.database_url.is_none());
        assert_eq!(config.check_delay, Duration::from_secs(180));
        assert_eq!(config.retry_max_attempts, 500);
    }

    #[test]
    fn test_addr_formatting() {
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_derived_settings() {
        let config = Config {
            check_delay: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(5),
            retry_max_attempts: 7,
            ..Config::default()
        };

        let scheduler = config.scheduler();
        assert_eq!(scheduler.check_delay, Duration::from_secs(60));
        assert_eq!(scheduler.sweep_interval, Duration::from_secs(5));
        assert_eq!(scheduler.batch_size, 100);

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_stub_services_must_be_requested() {
        let config = Config::default();
        assert!(!config.stub_services);
        assert!(config.validate().unwrap_err().contains("STUB_SERVICES"));

        let config = Config {
            stub_services: true,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("text".parse::<LogFormat>(), Ok(LogFormat::Text));
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
