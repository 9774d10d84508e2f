//! Metrics collector implementation.
//!
//! Counters are lock-free atomics; the recent-attempt log is the only
//! structure behind a lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

/// Attempt records kept for observers.
const DEFAULT_ATTEMPT_LOG_CAPACITY: usize = 1000;

/// Outcome of a single attempt to invoke the task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub execution_id: Uuid,
    pub sequence: u64,
    pub task: String,
    /// 1-indexed attempt number within the execution.
    pub attempt: u32,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// Metrics collector for the scheduling loop.
#[derive(Debug)]
pub struct MetricsCollector {
    // Attempt metrics
    attempts_total: AtomicU64,
    attempt_failures: DashMap<ErrorKind, AtomicU64>,
    recent_attempts: Mutex<VecDeque<AttemptRecord>>,
    attempt_log_capacity: usize,

    // Execution metrics
    executions_total: AtomicU64,
    executions_failed: AtomicU64,
    executions_cancelled: AtomicU64,
    execution_duration_total_ms: AtomicU64,
    items_produced_total: AtomicU64,
    skipped_ticks: AtomicU64,

    // Guard metrics
    circuit_rejections: AtomicU64,
    rate_limit_waits: AtomicU64,
    rate_limit_wait_total_ms: AtomicU64,

    // Process metrics
    process_memory_bytes: AtomicU64,
    process_cpu_percent_bits: AtomicU64,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self::with_attempt_log_capacity(DEFAULT_ATTEMPT_LOG_CAPACITY)
    }

    pub fn with_attempt_log_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            attempts_total: AtomicU64::new(0),
            attempt_failures: DashMap::new(),
            recent_attempts: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            attempt_log_capacity: capacity,
            executions_total: AtomicU64::new(0),
            executions_failed: AtomicU64::new(0),
            executions_cancelled: AtomicU64::new(0),
            execution_duration_total_ms: AtomicU64::new(0),
            items_produced_total: AtomicU64::new(0),
            skipped_ticks: AtomicU64::new(0),
            circuit_rejections: AtomicU64::new(0),
            rate_limit_waits: AtomicU64::new(0),
            rate_limit_wait_total_ms: AtomicU64::new(0),
            process_memory_bytes: AtomicU64::new(0),
            process_cpu_percent_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    // ========== Attempt Metrics ==========

    /// Record one attempt, successful or not.
    ///
    /// An attempt interrupted by shutdown is logged but not counted as failed.
    pub fn record_attempt(&self, record: AttemptRecord) {
        self.attempts_total.fetch_add(1, Ordering::Relaxed);
        if let Some(kind) = record
            .error_kind
            .filter(|kind| !record.success && *kind != ErrorKind::Cancelled)
        {
            self.attempt_failures
                .entry(kind)
                .or_insert_with(|| AtomicU64::new(0))
                .fetch_add(1, Ordering::Relaxed);
        }

        let mut log = self.recent_attempts.lock();
        if log.len() == self.attempt_log_capacity {
            log.pop_front();
        }
        log.push_back(record);
    }

    /// The most recent attempts, oldest first.
    pub fn recent_attempts(&self, limit: usize) -> Vec<AttemptRecord> {
        let log = self.recent_attempts.lock();
        let skip = log.len().saturating_sub(limit);
        log.iter().skip(skip).cloned().collect()
    }

    // ========== Execution Metrics ==========

    /// Record a finalized execution.
    ///
    /// A cancelled execution is counted separately and never as a failure.
    pub fn record_execution(
        &self,
        success: bool,
        error_kind: Option<ErrorKind>,
        duration_ms: u64,
        items_produced: Option<u64>,
    ) {
        self.executions_total.fetch_add(1, Ordering::Relaxed);
        self.execution_duration_total_ms
            .fetch_add(duration_ms, Ordering::Relaxed);

        if success {
            if let Some(items) = items_produced {
                self.items_produced_total
                    .fetch_add(items, Ordering::Relaxed);
            }
        } else if error_kind == Some(ErrorKind::Cancelled) {
            self.executions_cancelled.fetch_add(1, Ordering::Relaxed);
        } else {
            self.executions_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_skipped_tick(&self) {
        self.skipped_ticks.fetch_add(1, Ordering::Relaxed);
    }

    // ========== Guard Metrics ==========

    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record time spent waiting on the rate limiter. Zero waits are ignored.
    pub fn record_rate_limit_wait(&self, waited_ms: u64) {
        if waited_ms == 0 {
            return;
        }
        self.rate_limit_waits.fetch_add(1, Ordering::Relaxed);
        self.rate_limit_wait_total_ms
            .fetch_add(waited_ms, Ordering::Relaxed);
    }

    // ========== Process Metrics ==========

    pub fn set_process_usage(&self, cpu_percent: f64, memory_bytes: u64) {
        self.process_cpu_percent_bits
            .store(cpu_percent.to_bits(), Ordering::Relaxed);
        self.process_memory_bytes
            .store(memory_bytes, Ordering::Relaxed);
    }

    // ========== Snapshot ==========

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let executions_total = self.executions_total.load(Ordering::Relaxed);
        let duration_total = self.execution_duration_total_ms.load(Ordering::Relaxed);

        MetricsSnapshot {
            attempts_total: self.attempts_total.load(Ordering::Relaxed),
            attempt_failures: self
                .attempt_failures
                .iter()
                .map(|e| (e.key().to_string(), e.value().load(Ordering::Relaxed)))
                .collect(),
            executions_total,
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            executions_cancelled: self.executions_cancelled.load(Ordering::Relaxed),
            execution_duration_avg_ms: if executions_total == 0 {
                0.0
            } else {
                duration_total as f64 / executions_total as f64
            },
            items_produced_total: self.items_produced_total.load(Ordering::Relaxed),
            skipped_ticks: self.skipped_ticks.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            rate_limit_waits: self.rate_limit_waits.load(Ordering::Relaxed),
            rate_limit_wait_total_ms: self.rate_limit_wait_total_ms.load(Ordering::Relaxed),
            process_memory_bytes: self.process_memory_bytes.load(Ordering::Relaxed),
            process_cpu_percent: f64::from_bits(
                self.process_cpu_percent_bits.load(Ordering::Relaxed),
            ),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of all metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    // Attempt metrics
    pub attempts_total: u64,
    /// Failed attempts keyed by error kind.
    pub attempt_failures: HashMap<String, u64>,

    // Execution metrics
    pub executions_total: u64,
    pub executions_failed: u64,
    pub executions_cancelled: u64,
    pub execution_duration_avg_ms: f64,
    pub items_produced_total: u64,
    pub skipped_ticks: u64,

    // Guard metrics
    pub circuit_rejections: u64,
    pub rate_limit_waits: u64,
    pub rate_limit_wait_total_ms: u64,

    // Process metrics
    pub process_memory_bytes: u64,
    pub process_cpu_percent: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(sequence: u64, attempt: u32, error_kind: Option<ErrorKind>) -> AttemptRecord {
        AttemptRecord {
            execution_id: Uuid::new_v4(),
            sequence,
            task: "fetch-usgs".to_string(),
            attempt,
            success: error_kind.is_none(),
            error_kind,
            duration_ms: 10,
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn test_metrics_collector_creation() {
        let collector = MetricsCollector::new();
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.attempts_total, 0);
        assert_eq!(snapshot.execution_duration_avg_ms, 0.0);
        assert!(collector.recent_attempts(10).is_empty());
    }

    #[test]
    fn test_attempt_metrics() {
        let collector = MetricsCollector::new();

        collector.record_attempt(attempt(1, 1, Some(ErrorKind::Network)));
        collector.record_attempt(attempt(1, 2, Some(ErrorKind::Network)));
        collector.record_attempt(attempt(1, 3, None));
        collector.record_attempt(attempt(2, 1, Some(ErrorKind::Validation)));

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.attempts_total, 4);
        assert_eq!(snapshot.attempt_failures.get("network"), Some(&2));
        assert_eq!(snapshot.attempt_failures.get("validation"), Some(&1));

        let recent = collector.recent_attempts(2);
        assert_eq!(recent.len(), 2);
        assert_eq!((recent[0].sequence, recent[0].attempt), (1, 3));
        assert_eq!((recent[1].sequence, recent[1].attempt), (2, 1));
    }

    #[test]
    fn test_cancelled_attempt_is_not_a_failure() {
        let collector = MetricsCollector::new();

        collector.record_attempt(attempt(1, 1, Some(ErrorKind::Network)));
        collector.record_attempt(attempt(1, 2, Some(ErrorKind::Cancelled)));

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.attempts_total, 2);
        assert_eq!(snapshot.attempt_failures.get("network"), Some(&1));
        assert!(!snapshot.attempt_failures.contains_key("cancelled"));
        assert_eq!(collector.recent_attempts(10).len(), 2);
    }

    #[test]
    fn test_attempt_log_is_bounded() {
        let collector = MetricsCollector::with_attempt_log_capacity(3);
        for i in 1..=5 {
            collector.record_attempt(attempt(i, 1, None));
        }

        let recent = collector.recent_attempts(10);
        let sequences: Vec<_> = recent.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5]);
        assert_eq!(collector.snapshot().attempts_total, 5);
    }

    #[test]
    fn test_execution_metrics() {
        let collector = MetricsCollector::new();

        collector.record_execution(true, None, 100, Some(12));
        collector.record_execution(false, Some(ErrorKind::UpstreamClient), 300, None);
        collector.record_execution(false, Some(ErrorKind::Cancelled), 200, None);
        collector.record_skipped_tick();

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.executions_total, 3);
        assert_eq!(snapshot.executions_failed, 1);
        assert_eq!(snapshot.executions_cancelled, 1);
        assert_eq!(snapshot.items_produced_total, 12);
        assert_eq!(snapshot.execution_duration_avg_ms, 200.0);
        assert_eq!(snapshot.skipped_ticks, 1);
    }

    #[test]
    fn test_guard_and_process_metrics() {
        let collector = MetricsCollector::new();

        collector.record_circuit_rejection();
        collector.record_rate_limit_wait(0);
        collector.record_rate_limit_wait(1500);
        collector.set_process_usage(12.5, 64 * 1024 * 1024);

        let snapshot = collector.snapshot();
        assert_eq!(snapshot.circuit_rejections, 1);
        assert_eq!(snapshot.rate_limit_waits, 1);
        assert_eq!(snapshot.rate_limit_wait_total_ms, 1500);
        assert_eq!(snapshot.process_cpu_percent, 12.5);
        assert_eq!(snapshot.process_memory_bytes, 64 * 1024 * 1024);
    }
}
