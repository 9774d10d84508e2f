//! Run the task as a subprocess.
//!
//! Output conventions understood by [`CommandRunner`]:
//!
//! - stdout line `items_produced=<n>`: item count on success (last one wins)
//! - stderr line `error_kind=<kind>`: explicit failure classification
//! - stderr line `retry_after=<duration>`: rate-limit hint, e.g. `retry_after=30s`
//!
//! Without an explicit kind, the exit code is classified with
//! [`classify_exit_code`].

use std::path::PathBuf;

use async_trait::async_trait;
use process_utils::task_command;
use tracing::{debug, trace, warn};

use super::{TaskError, TaskOutput, TaskRunner, TaskSpec};
use crate::config::parse_duration;
use crate::error::ErrorKind;
use crate::resilience::{classify_exit_code, classify_io_error};

/// Stderr lines kept in a failure message.
const STDERR_TAIL_LINES: usize = 5;

/// Spawns `spec.name` with `spec.args` for every invocation.
#[derive(Debug, Clone, Default)]
pub struct CommandRunner {
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

#[async_trait]
impl TaskRunner for CommandRunner {
    async fn invoke(&self, spec: &TaskSpec) -> Result<TaskOutput, TaskError> {
        let mut command = task_command(&spec.name, &spec.args);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        command.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        debug!(program = %spec.name, args = ?spec.args, "Spawning task");
        let output = command.output().await.map_err(|e| {
            TaskError::new(
                classify_io_error(&e),
                format!("failed to run '{}': {}", spec.name, e),
            )
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            trace!(program = %spec.name, "stderr: {}", line);
        }

        if output.status.success() {
            return Ok(TaskOutput {
                items_produced: parse_items_produced(&stdout),
            });
        }

        let err = classify_failure(output.status.code(), &stderr);
        warn!(
            program = %spec.name,
            status = %output.status,
            kind = %err.kind,
            "Task exited unsuccessfully"
        );
        Err(err)
    }
}

fn parse_items_produced(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .filter_map(|line| line.trim().strip_prefix("items_produced="))
        .filter_map(|value| value.trim().parse().ok())
        .last()
}

fn classify_failure(code: Option<i32>, stderr: &str) -> TaskError {
    let mut explicit_kind = None;
    let mut retry_after = None;

    for line in stderr.lines().map(str::trim) {
        if let Some(kind) = line.strip_prefix("error_kind=") {
            match kind.parse::<ErrorKind>() {
                Ok(kind) if kind.is_task_reportable() => explicit_kind = Some(kind),
                Ok(kind) => debug!(%kind, "Ignoring error kind reserved for the scheduler"),
                Err(e) => debug!("Ignoring task error kind: {}", e),
            }
        } else if let Some(hint) = line.strip_prefix("retry_after=") {
            retry_after = parse_duration(hint).ok();
        }
    }

    let kind = explicit_kind.unwrap_or_else(|| classify_exit_code(code));
    let status = match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    };

    let tail: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|l| {
            !l.is_empty() && !l.starts_with("error_kind=") && !l.starts_with("retry_after=")
        })
        .collect();
    let tail = &tail[tail.len().saturating_sub(STDERR_TAIL_LINES)..];
    let message = if tail.is_empty() {
        status
    } else {
        format!("{status}: {}", tail.join(" | "))
    };

    TaskError {
        retry_after: if kind == ErrorKind::RateLimit {
            retry_after
        } else {
            None
        },
        ..TaskError::new(kind, message)
    }
}
