//! Operator commands against a running instance: status and stop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use process_utils::{is_process_alive, request_termination};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use super::pid_file::PidFile;
use crate::config::default_status_file;
use crate::scheduler::SchedulerStatus;
use crate::utils::fs::read_json;
use crate::{Error, Result};

/// How often `stop_running` re-checks whether the process has exited.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What the PID file says about an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum InstanceState {
    NotRunning,
    /// The PID file names a process that no longer exists.
    Stale { pid: u32 },
    Running { pid: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub pid_file: PathBuf,
    pub instance: InstanceState,
    /// Last status snapshot published by the instance, if any.
    pub status: Option<SchedulerStatus>,
}

/// Inspect the instance named by `pid_file`.
///
/// Reads `status_file`, or the default location next to the PID file.
pub fn query_status(pid_file: &Path, status_file: Option<&Path>) -> Result<InstanceReport> {
    let instance = match PidFile::read_pid(pid_file)? {
        None => InstanceState::NotRunning,
        Some(pid) if is_process_alive(pid) => InstanceState::Running { pid },
        Some(pid) => InstanceState::Stale { pid },
    };

    let status_path = status_file
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_status_file(pid_file));
    let status = read_json::<SchedulerStatus>(&status_path)?;

    Ok(InstanceReport {
        pid_file: pid_file.to_path_buf(),
        instance,
        status,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    StaleRemoved { pid: u32 },
    Stopped { pid: u32 },
}

/// Ask the instance named by `pid_file` to shut down and wait for it to exit.
///
/// Fails with [`Error::ShutdownTimeout`] if it is still alive after `timeout`.
pub async fn stop_running(pid_file: &Path, timeout: Duration) -> Result<StopOutcome> {
    let Some(pid) = PidFile::read_pid(pid_file)? else {
        return Ok(StopOutcome::NotRunning);
    };

    if !is_process_alive(pid) {
        remove_if_names(pid_file, pid)?;
        info!(pid, "Removed stale PID file");
        return Ok(StopOutcome::StaleRemoved { pid });
    }

    request_termination(pid)?;
    info!(pid, "Sent termination request");

    let deadline = Instant::now() + timeout;
    while is_process_alive(pid) {
        if Instant::now() >= deadline {
            return Err(Error::ShutdownTimeout(timeout));
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }

    // A clean shutdown removes its own PID file; a killed one does not.
    remove_if_names(pid_file, pid)?;
    debug!(pid, "Process exited");
    Ok(StopOutcome::Stopped { pid })
}

fn remove_if_names(pid_file: &Path, pid: u32) -> Result<()> {
    if PidFile::read_pid(pid_file)? != Some(pid) {
        return Ok(());
    }
    match std::fs::remove_file(pid_file) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io_path("removing pid file", pid_file, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::SchedulerState;
    use crate::utils::fs::write_json_atomic;

    #[tokio::test]
    async fn test_query_status_without_instance() {
        let dir = tempfile::tempdir().unwrap();
        let report = query_status(&dir.path().join("quake.pid"), None).unwrap();
        assert_eq!(report.instance, InstanceState::NotRunning);
        assert!(report.status.is_none());
    }

    #[tokio::test]
    async fn test_query_status_reads_published_status() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("quake.pid");
        std::fs::write(&pid_path, format!("{}\n", std::process::id())).unwrap();

        let status = SchedulerStatus {
            state: SchedulerState::Running,
            running: true,
            executions: 7,
            ..Default::default()
        };
        write_json_atomic(&default_status_file(&pid_path), &status)
            .await
            .unwrap();

        let report = query_status(&pid_path, None).unwrap();
        assert_eq!(
            report.instance,
            InstanceState::Running {
                pid: std::process::id()
            }
        );
        assert_eq!(report.status, Some(status));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_running_removes_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("quake.pid");
        std::fs::write(&pid_path, format!("{}\n", i32::MAX)).unwrap();

        let report = query_status(&pid_path, None).unwrap();
        assert_eq!(report.instance, InstanceState::Stale { pid: i32::MAX as u32 });

        let outcome = stop_running(&pid_path, Duration::from_secs(1)).await.unwrap();
        assert_eq!(outcome, StopOutcome::StaleRemoved { pid: i32::MAX as u32 });
        assert!(!pid_path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_running_terminates_process() {
        let dir = tempfile::tempdir().unwrap();
        let pid_path = dir.path().join("quake.pid");

        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        std::fs::write(&pid_path, format!("{pid}\n")).unwrap();
        // Reap the child so it does not linger as a zombie.
        let reaper = tokio::spawn(async move { child.wait().await });

        let outcome = stop_running(&pid_path, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::Stopped { pid });
        assert!(!pid_path.exists());
        assert!(!reaper.await.unwrap().unwrap().success());
    }
}
