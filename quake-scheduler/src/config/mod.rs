//! Scheduler configuration.
//!
//! Values come from (lowest to highest precedence) built-in defaults, an
//! optional TOML file, and CLI flags. Durations are written as human strings
//! such as `"250ms"`, `"30s"`, `"5m"`, `"1h"`.

mod duration;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::metrics::HealthConfig;
use crate::resilience::{
    Backoff, BackoffStrategy, CircuitBreakerConfig, RateLimiterConfig, RetryPolicy,
};
use crate::{Error, Result};

pub use duration::{duration_str, format_duration, parse_duration};

/// Default tick interval.
const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

/// Default health-check cadence.
const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Default grace period granted to the scheduler after a termination signal.
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Executions kept in memory for observers.
const DEFAULT_HISTORY_CAPACITY: usize = 100;

/// Complete configuration of one scheduler run. Immutable once the run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Time between ticks.
    #[serde(with = "duration_str")]
    pub interval: Duration,
    /// Stop after this much wall time.
    #[serde(with = "duration_str::option")]
    pub max_runtime: Option<Duration>,
    /// Stop after this many executions.
    pub max_executions: Option<u64>,
    pub backoff: BackoffStrategy,
    #[serde(with = "duration_str")]
    pub base_backoff: Duration,
    #[serde(with = "duration_str")]
    pub max_backoff: Duration,
    /// Attempts per tick, including the first.
    pub max_attempts: u32,
    /// Longest wait honoured from a task's `retry_after` hint.
    #[serde(with = "duration_str")]
    pub max_retry_after: Duration,
    pub continue_on_error: bool,
    pub skip_empty: bool,
    #[serde(with = "duration_str")]
    pub health_check_interval: Duration,
    /// Per-attempt timeout for the task.
    #[serde(with = "duration_str::option")]
    pub task_timeout: Option<Duration>,
    pub history_capacity: usize,
    /// Where to publish the status snapshot as JSON.
    pub status_file: Option<PathBuf>,
    /// Bind address of the read-only HTTP observer.
    pub http_addr: Option<SocketAddr>,
    pub daemon: DaemonSettings,
    pub task: TaskSettings,
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub rate_limit: Option<RateLimiterConfig>,
    pub health: HealthConfig,
}

/// Process lifecycle settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Detach into the background.
    pub enabled: bool,
    pub pid_file: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
    #[serde(with = "duration_str")]
    pub shutdown_grace: Duration,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            pid_file: None,
            log_file: None,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// The scheduled command, when given in the config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskSettings {
    pub program: Option<String>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        let backoff = Backoff::default();
        Self {
            interval: DEFAULT_INTERVAL,
            max_runtime: None,
            max_executions: None,
            backoff: backoff.strategy(),
            base_backoff: backoff.base(),
            max_backoff: backoff.max(),
            max_attempts: RetryPolicy::default().max_attempts,
            max_retry_after: RetryPolicy::default().max_retry_after,
            continue_on_error: true,
            skip_empty: false,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            task_timeout: None,
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            status_file: None,
            http_addr: None,
            daemon: DaemonSettings::default(),
            task: TaskSettings::default(),
            circuit_breaker: None,
            rate_limit: None,
            health: HealthConfig::default(),
        }
    }
}

impl ScheduleConfig {
    /// Load from a TOML file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::io_path("reading config", path, e))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Check invariants that the loop relies on.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::config("interval must be greater than zero"));
        }
        if self.max_runtime.is_some_and(|d| d.is_zero()) {
            return Err(Error::config("max_runtime must be greater than zero"));
        }
        if self.max_executions == Some(0) {
            return Err(Error::config("max_executions must be at least 1"));
        }
        if self.max_attempts == 0 {
            return Err(Error::config("max_attempts must be at least 1"));
        }
        if self.max_retry_after.is_zero() {
            return Err(Error::config("max_retry_after must be greater than zero"));
        }
        if self.health_check_interval.is_zero() {
            return Err(Error::config(
                "health_check_interval must be greater than zero",
            ));
        }
        if self.history_capacity == 0 {
            return Err(Error::config("history_capacity must be at least 1"));
        }
        if self.task_timeout.is_some_and(|d| d.is_zero()) {
            return Err(Error::config("task_timeout must be greater than zero"));
        }
        if self.daemon.enabled && self.daemon.pid_file.is_none() {
            return Err(Error::config("daemon mode requires a pid file"));
        }
        if let Some(breaker) = &self.circuit_breaker {
            breaker.validate()?;
        }
        if let Some(limit) = &self.rate_limit {
            limit.validate()?;
        }
        self.health.validate()
    }

    pub fn backoff_policy(&self) -> Backoff {
        Backoff::new(self.backoff, self.base_backoff, self.max_backoff)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.backoff_policy())
            .with_max_retry_after(self.max_retry_after)
    }

    /// Explicit status file, or `<pid file>.status.json` for daemons.
    pub fn effective_status_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.status_file {
            return Some(path.clone());
        }
        if !self.daemon.enabled {
            return None;
        }
        self.daemon.pid_file.as_deref().map(default_status_file)
    }
}

/// Status file path derived from a PID file path.
pub fn default_status_file(pid_file: &Path) -> PathBuf {
    let mut name = pid_file.as_os_str().to_os_string();
    name.push(".status.json");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ScheduleConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backoff, BackoffStrategy::Exponential);
        assert!(config.continue_on_error);
    }

    #[test]
    fn test_from_toml() {
        let config = ScheduleConfig::from_toml_str(
            r#"
            interval = "5m"
            max_runtime = "12h"
            max_executions = 40
            backoff = "linear"
            base_backoff = "2s"
            max_backoff = "1m"
            max_retry_after = "10m"
            continue_on_error = false
            skip_empty = true

            [daemon]
            enabled = true
            pid_file = "/run/quake/collector.pid"
            log_file = "/var/log/quake/collector.log"

            [task]
            program = "fetch-usgs"
            args = ["--feed", "all_hour"]

            [circuit_breaker]
            failure_threshold = 4
            open_timeout = "90s"

            [rate_limit]
            max_permits = 6
            window = "1m"
            "#,
        )
        .unwrap();

        assert_eq!(config.interval, Duration::from_secs(300));
        assert_eq!(config.max_runtime, Some(Duration::from_secs(12 * 3600)));
        assert_eq!(config.max_executions, Some(40));
        assert_eq!(config.backoff, BackoffStrategy::Linear);
        assert_eq!(
            config.retry_policy().max_retry_after,
            Duration::from_secs(600)
        );
        assert!(!config.continue_on_error);
        assert!(config.skip_empty);
        assert!(config.daemon.enabled);
        assert_eq!(config.task.program.as_deref(), Some("fetch-usgs"));

        let breaker = config.circuit_breaker.as_ref().unwrap();
        assert_eq!(breaker.failure_threshold, 4);
        assert_eq!(breaker.open_timeout, Duration::from_secs(90));
        assert_eq!(breaker.success_threshold, 2);

        assert_eq!(config.rate_limit.as_ref().unwrap().max_permits, 6);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.effective_status_file(),
            Some(PathBuf::from("/run/quake/collector.pid.status.json"))
        );
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let zero_interval = ScheduleConfig {
            interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            zero_interval.validate(),
            Err(Error::Configuration(_))
        ));

        let zero_executions = ScheduleConfig {
            max_executions: Some(0),
            ..Default::default()
        };
        assert!(zero_executions.validate().is_err());

        let daemon_without_pid = ScheduleConfig {
            daemon: DaemonSettings {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(daemon_without_pid.validate().is_err());
    }

    #[test]
    fn test_unknown_backoff_in_toml_is_an_error() {
        assert!(ScheduleConfig::from_toml_str(r#"backoff = "fibonacci""#).is_err());
    }

    #[test]
    fn test_foreground_has_no_default_status_file() {
        let config = ScheduleConfig {
            daemon: DaemonSettings {
                pid_file: Some(PathBuf::from("/tmp/q.pid")),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(config.effective_status_file(), None);
    }
}
