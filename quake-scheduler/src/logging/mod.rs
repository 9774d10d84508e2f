//! Logging setup.
//!
//! - Console output with local-time timestamps in the foreground
//! - Optional append-only log file written through a non-blocking worker
//! - File-only output once the process has detached

use std::path::{Path, PathBuf};

use chrono::Local;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::Writer, time::FormatTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

use crate::utils::fs::ensure_parent_dir_sync;
use crate::{Error, Result};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "quake_scheduler=info,tower_http=warn";

/// Timestamps in the host's local timezone.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = Local::now();
        write!(w, "{}", now.format("%Y-%m-%dT%H:%M:%S%.3f%:z"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// Net `-v` count minus `-q` count.
    pub verbosity: i8,
    pub log_file: Option<PathBuf>,
    /// The process has detached; stdout/stderr already point at the log file.
    pub detached: bool,
}

/// Filter directive for a verbosity level. `RUST_LOG` takes precedence.
pub fn filter_directive(verbosity: i8) -> &'static str {
    match verbosity {
        i8::MIN..=-1 => "quake_scheduler=warn,tower_http=error",
        0 => DEFAULT_LOG_FILTER,
        1 => "quake_scheduler=debug,tower_http=info",
        _ => "quake_scheduler=trace,tower_http=debug",
    }
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for the life of the process; dropping it
/// flushes and stops the file writer.
pub fn init_logging(options: &LoggingOptions) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(options.verbosity)));

    let (file_layer, guard) = match &options.log_file {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_timer(LocalTimer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // Once detached, stdout is the log file (or /dev/null); writing to both
    // would duplicate every line.
    let console_layer = (!options.detached || options.log_file.is_none()).then(|| {
        fmt::layer()
            .with_ansi(!options.detached)
            .with_timer(LocalTimer)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("Failed to set global default subscriber: {}", e)))?;

    Ok(guard)
}

fn file_writer(
    path: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    ensure_parent_dir_sync(path)?;
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| Error::config(format!("invalid log file name: {}", path.display())))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(file_name)
        .build(dir)
        .map_err(|e| Error::config(format!("cannot open log file {}: {}", path.display(), e)))?;
    Ok(tracing_appender::non_blocking(appender))
}
