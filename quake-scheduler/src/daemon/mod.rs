//! Process lifecycle around a scheduler run.
//!
//! [`DaemonManager::prepare`] is synchronous and must run before the tokio
//! runtime is built: it checks for a live instance, optionally detaches,
//! redirects output and claims the PID file. The returned [`DaemonHandle`]
//! then supervises the scheduler inside the runtime and removes the PID file
//! when it is dropped, whichever way the run ends.

mod control;
mod pid_file;
mod signals;

#[cfg(not(unix))]
mod other;
#[cfg(unix)]
mod unix;

#[cfg(not(unix))]
use other as platform;
#[cfg(unix)]
use unix as platform;

pub use control::{InstanceReport, InstanceState, StopOutcome, query_status, stop_running};
pub use pid_file::PidFile;
pub use signals::{ShutdownSignal, Signals};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DaemonSettings;
use crate::scheduler::Scheduler;
use crate::task::TaskSpec;
use crate::{Error, Result};

pub struct DaemonManager {
    settings: DaemonSettings,
}

impl DaemonManager {
    pub fn new(settings: DaemonSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &DaemonSettings {
        &self.settings
    }

    /// Claim the process for one scheduler run.
    ///
    /// Fails with [`Error::AlreadyRunning`] before detaching if the PID file
    /// names a live process. When detached, only the grandchild returns.
    pub fn prepare(&self) -> Result<DaemonHandle> {
        let settings = &self.settings;
        if settings.enabled && settings.pid_file.is_none() {
            return Err(Error::config("daemon mode requires a pid file"));
        }

        if let Some(path) = &settings.pid_file {
            PidFile::check_existing(path)?;
        }

        if settings.enabled {
            platform::detach()?;
            platform::redirect_streams(settings.log_file.as_deref())?;
        }

        let pid_file = settings
            .pid_file
            .as_deref()
            .map(PidFile::acquire)
            .transpose()?;

        Ok(DaemonHandle {
            pid: std::process::id(),
            pid_file,
            log_file: settings.log_file.clone(),
            detached: settings.enabled,
            shutdown_grace: settings.shutdown_grace,
            cancel: CancellationToken::new(),
        })
    }
}

/// A claimed process. Dropping it releases the PID file.
#[derive(Debug)]
pub struct DaemonHandle {
    pid: u32,
    pid_file: Option<PidFile>,
    log_file: Option<PathBuf>,
    detached: bool,
    shutdown_grace: Duration,
    cancel: CancellationToken,
}

impl DaemonHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pid_file(&self) -> Option<&Path> {
        self.pid_file.as_ref().map(PidFile::path)
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    pub fn is_detached(&self) -> bool {
        self.detached
    }

    /// Token cancelled when the run is over or a shutdown signal arrives.
    ///
    /// Build the scheduler with it so every wait observes the signal.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the scheduler until it stops on its own or a termination signal
    /// arrives, then release the PID file.
    ///
    /// After a signal the scheduler gets `shutdown_grace` to finish; past
    /// that, or on a second signal, it is aborted.
    pub async fn supervise(self, scheduler: Arc<Scheduler>, spec: TaskSpec) -> Result<()> {
        let mut signals = Signals::install()?;

        info!(
            pid = self.pid,
            pid_file = ?self.pid_file(),
            detached = self.detached,
            "Supervising scheduler"
        );

        let mut run = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.start(spec).await }
        });

        let result = tokio::select! {
            biased;
            joined = &mut run => flatten(joined),
            signal = signals.recv() => {
                info!(%signal, "Received shutdown signal, stopping scheduler");
                scheduler.stop();
                scheduler.cancellation_token().cancel();
                self.cancel.cancel();
                self.await_shutdown(&mut run, &mut signals).await
            }
        };

        self.cancel.cancel();
        info!(pid = self.pid, ok = result.is_ok(), "Daemon exiting");
        drop(self);
        result
    }

    async fn await_shutdown(
        &self,
        run: &mut JoinHandle<Result<()>>,
        signals: &mut Signals,
    ) -> Result<()> {
        let grace = self.shutdown_grace;
        tokio::select! {
            biased;
            joined = &mut *run => flatten(joined),
            signal = signals.recv() => {
                warn!(%signal, "Second signal received, aborting scheduler");
                run.abort();
                Err(Error::Other(format!("shutdown forced by {signal}")))
            }
            _ = tokio::time::sleep(grace) => {
                warn!(grace = ?grace, "Scheduler did not stop within the grace period");
                run.abort();
                Err(Error::ShutdownTimeout(grace))
            }
        }
    }
}

fn flatten(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(Error::Other(format!("scheduler task panicked: {e}"))),
        Err(e) => Err(Error::Other(format!("scheduler task aborted: {e}"))),
    }
}
