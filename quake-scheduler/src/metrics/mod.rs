//! Metrics and health monitoring.
//!
//! Passive observers of the scheduling loop:
//!
//! - [`MetricsCollector`]: per-attempt and per-execution counters plus a
//!   bounded log of recent attempts
//! - [`HealthChecker`]: process resource sampling and registered component checks
//! - [`PrometheusExporter`]: text exposition of a metrics snapshot
//!
//! # Example
//!
//! ```ignore
//! use quake_scheduler::metrics::{HealthChecker, HealthConfig, MetricsCollector};
//!
//! let collector = Arc::new(MetricsCollector::new());
//! collector.record_skipped_tick();
//!
//! let health = HealthChecker::new(HealthConfig::default()).with_metrics(collector.clone());
//! let report = health.check_all().await;
//! ```

mod collector;
mod health;
mod prometheus;

pub use collector::{AttemptRecord, MetricsCollector, MetricsSnapshot};
pub use health::{
    ComponentHealth, HealthCheckFn, HealthChecker, HealthConfig, HealthStatus, ResourceUsage,
    SystemHealth,
};
pub use prometheus::PrometheusExporter;
