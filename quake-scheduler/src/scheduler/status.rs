//! Scheduler lifecycle state and the status snapshot shown to observers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::executor::Execution;

/// Lifecycle of a scheduler. Moves strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    #[default]
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerState::Idle => write!(f, "idle"),
            SchedulerState::Running => write!(f, "running"),
            SchedulerState::Stopping => write!(f, "stopping"),
            SchedulerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `stop()` or a shutdown signal.
    Requested,
    MaxExecutions,
    MaxRuntime,
    /// A tick failed with `continue_on_error` disabled.
    TaskFailed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Requested => write!(f, "stop requested"),
            StopReason::MaxExecutions => write!(f, "max executions reached"),
            StopReason::MaxRuntime => write!(f, "max runtime reached"),
            StopReason::TaskFailed => write!(f, "task failed"),
        }
    }
}

/// Point-in-time view of a scheduler.
///
/// Only the tick path mutates it; every read gets a complete copy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub running: bool,
    pub pid: u32,
    pub task: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub next_execution_at: Option<DateTime<Utc>>,
    /// Finalized executions, cancelled ones included.
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    pub skipped_ticks: u64,
    /// `successes / (successes + failures)`, 0 before the first outcome.
    pub success_rate: f64,
    pub total_runtime_ms: u64,
    pub average_runtime_ms: f64,
    pub last_error: Option<String>,
    pub last_error_kind: Option<ErrorKind>,
    pub stop_reason: Option<StopReason>,
}

impl SchedulerStatus {
    pub(crate) fn new() -> Self {
        Self {
            pid: std::process::id(),
            ..Default::default()
        }
    }

    pub(crate) fn mark_running(&mut self, task: &str) {
        self.state = SchedulerState::Running;
        self.running = true;
        self.task = Some(task.to_string());
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn record_execution(&mut self, execution: &Execution) {
        self.executions += 1;
        self.last_execution_at = Some(execution.finished_at);
        self.total_runtime_ms += execution.duration_ms;
        self.average_runtime_ms = self.total_runtime_ms as f64 / self.executions as f64;

        if execution.success {
            self.successes += 1;
        } else if execution.is_failure() {
            self.failures += 1;
            self.last_error = execution.error.clone();
            self.last_error_kind = execution.error_kind;
        }

        let outcomes = self.successes + self.failures;
        if outcomes > 0 {
            self.success_rate = self.successes as f64 / outcomes as f64;
        }
    }

    pub(crate) fn mark_stopped(&mut self, reason: StopReason) {
        self.state = SchedulerState::Stopped;
        self.running = false;
        self.next_execution_at = None;
        self.stopped_at = Some(Utc::now());
        self.stop_reason = Some(reason);
    }
}
