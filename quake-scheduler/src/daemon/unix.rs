//! Unix detachment: double fork, new session, redirected standard streams.
//!
//! Everything here must run before any other thread exists, which in
//! practice means before the tokio runtime or the logging worker start.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::Path;

use nix::sys::stat::{Mode, umask};
use nix::unistd::{ForkResult, dup2, fork, setsid};

use crate::utils::fs::ensure_parent_dir_sync;
use crate::{Error, Result};

const DEV_NULL: &str = "/dev/null";

/// Detach from the controlling terminal.
///
/// Returns in the grandchild only; both ancestors exit with status 0.
pub(crate) fn detach() -> Result<()> {
    fork_and_exit_parent()?;
    setsid().map_err(|e| Error::Io(e.into()))?;
    // A second fork drops session leadership so no terminal can be reacquired.
    fork_and_exit_parent()?;
    umask(Mode::from_bits_truncate(0o022));
    Ok(())
}

fn fork_and_exit_parent() -> Result<()> {
    // SAFETY: called while the process is still single-threaded.
    match unsafe { fork() }.map_err(|e| Error::Io(e.into()))? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => Ok(()),
    }
}

/// Point stdin at `/dev/null` and stdout/stderr at `log_file` (or
/// `/dev/null` when there is none).
pub(crate) fn redirect_streams(log_file: Option<&Path>) -> Result<()> {
    let null = OpenOptions::new()
        .read(true)
        .write(true)
        .open(DEV_NULL)
        .map_err(|e| Error::io_path("opening", Path::new(DEV_NULL), e))?;

    let out = match log_file {
        Some(path) => {
            ensure_parent_dir_sync(path)?;
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| Error::io_path("opening log file", path, e))?
        }
        None => null
            .try_clone()
            .map_err(|e| Error::io_path("duplicating", Path::new(DEV_NULL), e))?,
    };

    for (source, target) in [
        (null.as_raw_fd(), std::io::stdin().as_raw_fd()),
        (out.as_raw_fd(), std::io::stdout().as_raw_fd()),
        (out.as_raw_fd(), std::io::stderr().as_raw_fd()),
    ] {
        dup2(source, target).map_err(|e| Error::Io(e.into()))?;
    }
    Ok(())
}

