//! Small process-related helpers shared across the workspace.
//!
//! - building child commands for scheduled tasks (no console window on Windows)
//! - probing whether a PID still names a live process
//! - asking a process to terminate

use std::ffi::OsStr;
use std::io;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

impl NoWindowExt for std::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.creation_flags(CREATE_NO_WINDOW);
        }
    }
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` for a scheduled task.
///
/// The child gets a null stdin, piped stdout/stderr, and is killed if the
/// handle is dropped before it exits (e.g. when a shutdown grace period runs out).
#[cfg(feature = "tokio")]
pub fn task_command<I, S>(program: impl AsRef<OsStr>, args: I) -> tokio::process::Command
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Convert a `u32` PID into a signal target, rejecting values that would
/// address a process group (`0`) or overflow `pid_t`.
#[cfg(unix)]
fn to_nix_pid(pid: u32) -> Option<nix::unistd::Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(nix::unistd::Pid::from_raw(raw)),
        _ => None,
    }
}

/// Check whether `pid` names a live process.
///
/// Uses the null signal: `EPERM` still means the process exists (owned by
/// another user). On non-Unix targets liveness cannot be probed and the PID
/// is assumed alive.
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::kill;

        let Some(target) = to_nix_pid(pid) else {
            return false;
        };
        match kill(target, None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
    #[cfg(not(unix))]
    {
        pid != 0
    }
}

/// Ask the process named by `pid` to terminate (`SIGTERM` on Unix).
pub fn request_termination(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};

        let target = to_nix_pid(pid).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}"))
        })?;
        kill(target, Signal::SIGTERM).map_err(io::Error::from)
    }
    #[cfg(not(unix))]
    {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot signal pid {pid} on this platform"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_invalid_pids_are_not_alive() {
        assert!(!is_process_alive(0));
        assert!(!is_process_alive(u32::MAX));
        // Above any Linux pid_max.
        assert!(!is_process_alive(i32::MAX as u32));
    }

    #[cfg(unix)]
    #[test]
    fn test_request_termination_rejects_group_pid() {
        let err = request_termination(0).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[cfg(feature = "tokio")]
    #[tokio::test]
    async fn test_task_command_captures_output() {
        let output = if cfg!(windows) {
            task_command("cmd", ["/C", "echo hello"]).output().await
        } else {
            task_command("sh", ["-c", "echo hello"]).output().await
        }
        .unwrap();
        assert!(output.status.success());
        assert!(String::from_utf8_lossy(&output.stdout).contains("hello"));
    }
}
