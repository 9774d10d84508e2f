//! PID file: single-instance detection and ownership.
//!
//! The file holds the decimal PID followed by a newline. It is created
//! exclusively, held under an advisory lock for the life of the process, and
//! removed on drop if it still names this process.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use process_utils::is_process_alive;
use tracing::{debug, warn};

use crate::utils::fs::ensure_parent_dir_sync;
use crate::{Error, Result};

/// An owned, locked PID file.
pub struct PidFile {
    path: PathBuf,
    pid: u32,
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

impl PidFile {
    /// Read the PID recorded in `path`.
    ///
    /// `None` when the file is missing or does not hold a valid PID.
    pub fn read_pid(path: &Path) -> Result<Option<u32>> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io_path("reading pid file", path, e)),
        };
        match raw.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => {
                warn!(path = %path.display(), "PID file does not contain a valid pid");
                Ok(None)
            }
        }
    }

    /// Fail with [`Error::AlreadyRunning`] if `path` names a live process.
    ///
    /// A stale or unreadable PID file is removed.
    pub fn check_existing(path: &Path) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        if let Some(pid) = Self::read_pid(path)?
            && is_process_alive(pid)
        {
            return Err(Error::AlreadyRunning(format!(
                "pid {} (from {})",
                pid,
                path.display()
            )));
        }

        debug!(path = %path.display(), "Removing stale PID file");
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io_path("removing stale pid file", path, e)),
        }
    }

    /// Claim `path` for the current process.
    pub fn acquire(path: &Path) -> Result<Self> {
        Self::check_existing(path)?;
        ensure_parent_dir_sync(path)?;

        let file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(Error::AlreadyRunning(format!(
                    "pid file {} was created concurrently",
                    path.display()
                )));
            }
            Err(e) => return Err(Error::io_path("creating pid file", path, e)),
        };

        let pid = std::process::id();

        #[cfg(unix)]
        let mut lock = {
            use nix::fcntl::{Flock, FlockArg};

            Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
                Error::AlreadyRunning(format!(
                    "pid file {} is locked by another process: {}",
                    path.display(),
                    errno
                ))
            })?
        };
        #[cfg(not(unix))]
        let mut lock = file;

        writeln!(lock, "{pid}")
            .and_then(|_| lock.sync_all())
            .map_err(|e| Error::io_path("writing pid file", path, e))?;

        debug!(path = %path.display(), pid, "PID file written");
        Ok(Self {
            path: path.to_path_buf(),
            pid,
            #[cfg(unix)]
            _lock: lock,
            #[cfg(not(unix))]
            _file: lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl std::fmt::Debug for PidFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PidFile")
            .field("path", &self.path)
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        match Self::read_pid(&self.path) {
            Ok(Some(pid)) if pid == self.pid => {
                if let Err(e) = std::fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), "Failed to remove PID file: {}", e);
                } else {
                    debug!(path = %self.path.display(), "PID file removed");
                }
            }
            _ => warn!(
                path = %self.path.display(),
                "PID file no longer names this process, leaving it in place"
            ),
        }
    }
}
