//! The recorded outcome of one tick.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Error;
use crate::error::ErrorKind;
use crate::task::{TaskError, TaskOutput, TaskSpec};

/// One finalized tick, including its internal retries. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    /// 1-indexed position in the run's tick order.
    pub sequence: u64,
    pub task: String,
    pub args: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Attempts actually used, including retries.
    pub attempts: u32,
    pub items_produced: Option<u64>,
}

impl Execution {
    /// Whether the tick was interrupted by shutdown rather than failing.
    pub fn is_cancelled(&self) -> bool {
        self.error_kind == Some(ErrorKind::Cancelled)
    }

    /// Whether this counts as a failed tick.
    pub fn is_failure(&self) -> bool {
        !self.success && !self.is_cancelled()
    }

    /// A successful tick that reported producing nothing.
    pub fn is_empty(&self) -> bool {
        self.success && self.items_produced == Some(0)
    }

    /// The terminal error this execution represents, if it failed.
    pub fn failure(&self) -> Option<Error> {
        if !self.is_failure() {
            return None;
        }
        Some(Error::TaskFailed {
            kind: self.error_kind.unwrap_or(ErrorKind::UpstreamServer),
            attempts: self.attempts,
            message: self.error.clone().unwrap_or_default(),
        })
    }
}

/// An execution that has started but not finished.
#[derive(Debug, Clone)]
pub(crate) struct PendingExecution {
    id: Uuid,
    sequence: u64,
    task: String,
    args: Vec<String>,
    started_at: DateTime<Utc>,
}

impl PendingExecution {
    pub(crate) fn start(spec: &TaskSpec, sequence: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence,
            task: spec.name.clone(),
            args: spec.args.clone(),
            started_at: Utc::now(),
        }
    }

    pub(crate) fn id(&self) -> Uuid {
        self.id
    }

    /// Seal the record. `elapsed` is measured on the executor's clock.
    pub(crate) fn finish(
        self,
        attempts: u32,
        elapsed: Duration,
        result: Result<TaskOutput, TaskError>,
    ) -> Execution {
        let finished_at = self.started_at
            + chrono::Duration::from_std(elapsed).unwrap_or(chrono::Duration::zero());
        let (success, error, error_kind, items_produced) = match result {
            Ok(output) => (true, None, None, output.items_produced),
            Err(err) => (false, Some(err.message), Some(err.kind), None),
        };

        Execution {
            id: self.id,
            sequence: self.sequence,
            task: self.task,
            args: self.args,
            started_at: self.started_at,
            finished_at,
            duration_ms: elapsed.as_millis() as u64,
            success,
            error,
            error_kind,
            attempts,
            items_produced,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TaskSpec {
        TaskSpec::new("fetch-faults", ["--region", "cascadia"])
    }

    #[test]
    fn test_finish_success() {
        let pending = PendingExecution::start(&spec(), 4);
        let id = pending.id();
        let execution =
            pending.finish(2, Duration::from_millis(1500), Ok(TaskOutput::with_items(0)));

        assert_eq!(execution.id, id);
        assert_eq!(execution.sequence, 4);
        assert_eq!(execution.args, vec!["--region", "cascadia"]);
        assert_eq!(execution.duration_ms, 1500);
        assert_eq!(
            execution.finished_at - execution.started_at,
            chrono::Duration::milliseconds(1500)
        );
        assert!(execution.success);
        assert!(execution.is_empty());
        assert!(execution.failure().is_none());
    }

    #[test]
    fn test_finish_failure_maps_to_terminal_error() {
        let execution = PendingExecution::start(&spec(), 1).finish(
            1,
            Duration::ZERO,
            Err(TaskError::validation("missing 'features' array")),
        );

        assert!(execution.is_failure());
        match execution.failure() {
            Some(Error::TaskFailed {
                kind,
                attempts,
                message,
            }) => {
                assert_eq!(kind, ErrorKind::Validation);
                assert_eq!(attempts, 1);
                assert_eq!(message, "missing 'features' array");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_cancelled_is_not_a_failure() {
        let execution = PendingExecution::start(&spec(), 1).finish(
            1,
            Duration::ZERO,
            Err(TaskError::cancelled()),
        );
        assert!(execution.is_cancelled());
        assert!(!execution.is_failure());
        assert!(execution.failure().is_none());
    }
}
