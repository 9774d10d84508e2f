//! Health check implementation.
//!
//! Samples the resource usage of this process and runs registered component
//! checks. Reports are advisory: an unhealthy reading is logged, never acted on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock as SyncRwLock;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::collector::MetricsCollector;
use crate::{Error, Result};

const MB: u64 = 1024 * 1024;

/// Health status of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is healthy.
    Healthy,
    /// Component is degraded but functional.
    Degraded,
    /// Component is unhealthy.
    Unhealthy,
    /// Component status is unknown.
    #[default]
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Thresholds applied to process resource usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Resident memory that marks the process degraded.
    pub memory_warning_mb: u64,
    /// Resident memory that marks the process unhealthy.
    pub memory_critical_mb: u64,
    /// CPU usage (percent of one core) that marks the process degraded.
    pub cpu_warning_percent: f32,
    /// Failure ratio over recent executions that marks the scheduler degraded.
    pub failure_rate_warning: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            memory_warning_mb: 512,
            memory_critical_mb: 1024,
            cpu_warning_percent: 90.0,
            failure_rate_warning: 0.5,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.memory_warning_mb > self.memory_critical_mb {
            return Err(Error::config(
                "health.memory_warning_mb must not exceed health.memory_critical_mb",
            ));
        }
        if !(0.0..=1.0).contains(&self.failure_rate_warning) {
            return Err(Error::config(
                "health.failure_rate_warning must be between 0 and 1",
            ));
        }
        Ok(())
    }
}

/// Health information for a single component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Component name.
    pub name: String,
    /// Health status.
    pub status: HealthStatus,
    /// Optional message.
    pub message: Option<String>,
    /// Last check time (ISO 8601).
    pub last_check: Option<String>,
    /// Check duration in milliseconds.
    pub check_duration_ms: Option<u64>,
}

impl ComponentHealth {
    fn with_status(name: impl Into<String>, status: HealthStatus, message: Option<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message,
            last_check: Some(chrono::Utc::now().to_rfc3339()),
            check_duration_ms: None,
        }
    }

    /// Create a healthy component.
    pub fn healthy(name: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Healthy, None)
    }

    /// Create an unhealthy component.
    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Unhealthy, Some(message.into()))
    }

    /// Create a degraded component.
    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(name, HealthStatus::Degraded, Some(message.into()))
    }

    /// Set the check duration.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.check_duration_ms = Some(duration.as_millis() as u64);
        self
    }
}

/// Resource usage of this process at sampling time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage in percent of one core.
    pub cpu_percent: f32,
    /// Resident memory in bytes.
    pub memory_bytes: u64,
}

/// Overall health of the running scheduler process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    /// Overall status.
    pub status: HealthStatus,
    /// Component health details.
    pub components: HashMap<String, ComponentHealth>,
    /// Crate version.
    pub version: String,
    /// Uptime in seconds.
    pub uptime_secs: u64,
    /// Timestamp of the health check.
    pub timestamp: String,
    pub resources: ResourceUsage,
}

impl SystemHealth {
    /// Check if the process is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        matches!(self.status, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Check if the process is healthy.
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Health check function type.
pub type HealthCheckFn = Arc<dyn Fn() -> ComponentHealth + Send + Sync>;

/// Health checker for the scheduler process.
pub struct HealthChecker {
    config: HealthConfig,
    /// Registered health checks.
    checks: RwLock<HashMap<String, HealthCheckFn>>,
    /// Process start time.
    start_time: Instant,
    version: String,
    pid: Option<Pid>,
    system: Mutex<System>,
    metrics: Option<Arc<MetricsCollector>>,
    last_report: SyncRwLock<Option<SystemHealth>>,
}

impl HealthChecker {
    /// Create a new health checker.
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            checks: RwLock::new(HashMap::new()),
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            pid: sysinfo::get_current_pid().ok(),
            system: Mutex::new(System::new()),
            metrics: None,
            last_report: SyncRwLock::new(None),
        }
    }

    /// Publish every resource sample into `metrics`.
    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Register a health check.
    pub async fn register(&self, name: impl Into<String>, check: HealthCheckFn) {
        self.checks.write().await.insert(name.into(), check);
    }

    /// Unregister a health check.
    ///
    /// Returns true if the check was removed, false if it didn't exist.
    pub async fn unregister(&self, name: &str) -> bool {
        self.checks.write().await.remove(name).is_some()
    }

    /// The report produced by the most recent [`check_all`](Self::check_all).
    pub fn last_report(&self) -> Option<SystemHealth> {
        self.last_report.read().clone()
    }

    /// Sample resources, run all checks and store the result.
    pub async fn check_all(&self) -> SystemHealth {
        let start = Instant::now();
        let resources = self.sample_resources().await;
        let mut process = self.evaluate_resources(resources);
        process.check_duration_ms = Some(start.elapsed().as_millis() as u64);

        let mut components = HashMap::new();
        let mut overall_status = process.status;
        components.insert(process.name.clone(), process);

        let checks = self.checks.read().await;
        for (name, check) in checks.iter() {
            let start = Instant::now();
            let health = check().with_duration(start.elapsed());
            overall_status = worse(overall_status, health.status);
            components.insert(name.clone(), health);
        }
        drop(checks);

        let report = SystemHealth {
            status: overall_status,
            components,
            version: self.version.clone(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            resources,
        };

        if let Some(metrics) = &self.metrics {
            metrics.set_process_usage(f64::from(resources.cpu_percent), resources.memory_bytes);
        }
        self.log_report(&report);
        *self.last_report.write() = Some(report.clone());
        report
    }

    /// Run [`check_all`](Self::check_all) every `interval` until `cancel` fires.
    ///
    /// Runs on its own task so a slow check never delays a tick.
    pub fn spawn_monitor(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.check_all().await;
                    }
                }
            }
            debug!("Health monitor stopped");
        })
    }

    /// Classify a resource sample against the configured thresholds.
    pub fn evaluate_resources(&self, usage: ResourceUsage) -> ComponentHealth {
        let memory_mb = usage.memory_bytes / MB;

        if memory_mb >= self.config.memory_critical_mb {
            ComponentHealth::unhealthy(
                "process",
                format!(
                    "Memory critical: {} MB resident (limit {} MB)",
                    memory_mb, self.config.memory_critical_mb
                ),
            )
        } else if memory_mb >= self.config.memory_warning_mb {
            ComponentHealth::degraded(
                "process",
                format!(
                    "Memory warning: {} MB resident (threshold {} MB)",
                    memory_mb, self.config.memory_warning_mb
                ),
            )
        } else if usage.cpu_percent >= self.config.cpu_warning_percent {
            ComponentHealth::degraded(
                "process",
                format!("CPU warning: {:.1}% of one core", usage.cpu_percent),
            )
        } else {
            ComponentHealth::healthy("process")
        }
    }

    async fn sample_resources(&self) -> ResourceUsage {
        let Some(pid) = self.pid else {
            return ResourceUsage::default();
        };

        let mut system = self.system.lock().await;
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
        system
            .process(pid)
            .map(|process| ResourceUsage {
                cpu_percent: process.cpu_usage(),
                memory_bytes: process.memory(),
            })
            .unwrap_or_default()
    }

    fn log_report(&self, report: &SystemHealth) {
        let failing: Vec<String> = report
            .components
            .values()
            .filter(|c| matches!(c.status, HealthStatus::Degraded | HealthStatus::Unhealthy))
            .map(|c| match &c.message {
                Some(message) => format!("{}: {}", c.name, message),
                None => c.name.clone(),
            })
            .collect();

        match report.status {
            HealthStatus::Unhealthy | HealthStatus::Degraded => warn!(
                status = %report.status,
                cpu = report.resources.cpu_percent,
                memory_mb = report.resources.memory_bytes / MB,
                "Health check reported problems: {}",
                failing.join("; ")
            ),
            _ => debug!(
                cpu = report.resources.cpu_percent,
                memory_mb = report.resources.memory_bytes / MB,
                "Health check OK"
            ),
        }
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}

fn worse(current: HealthStatus, next: HealthStatus) -> HealthStatus {
    match (current, next) {
        (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
        (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
        _ => current,
    }
}
