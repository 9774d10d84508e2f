//! Application-wide error types.
//!
//! Failures crossing the task boundary are classified once into an
//! [`ErrorKind`]; retry and propagation logic switch on that kind.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Classified failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection reset, timeout.
    Network,
    /// Transient upstream failure (5xx-equivalent).
    UpstreamServer,
    /// Rejected request (4xx-equivalent).
    UpstreamClient,
    /// Malformed response payload.
    Validation,
    /// Invalid setup.
    Configuration,
    /// Quota exceeded.
    RateLimit,
    /// Rejected locally by an open circuit breaker.
    CircuitOpen,
    /// Another instance is already running.
    AlreadyRunning,
    /// Cooperative shutdown.
    Cancelled,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 9] = [
        ErrorKind::Network,
        ErrorKind::UpstreamServer,
        ErrorKind::UpstreamClient,
        ErrorKind::Validation,
        ErrorKind::Configuration,
        ErrorKind::RateLimit,
        ErrorKind::CircuitOpen,
        ErrorKind::AlreadyRunning,
        ErrorKind::Cancelled,
    ];

    /// Whether a failure of this kind may succeed when retried.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::UpstreamServer | ErrorKind::RateLimit
        )
    }

    /// Whether this kind says something about the health of the guarded dependency.
    pub fn counts_against_dependency(self) -> bool {
        self.is_retryable()
    }

    /// Whether a task may report this kind about its own failure. The rest
    /// are produced locally by the guards and the shutdown path.
    pub fn is_task_reportable(self) -> bool {
        !matches!(
            self,
            ErrorKind::CircuitOpen | ErrorKind::AlreadyRunning | ErrorKind::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::UpstreamServer => "upstream_server",
            ErrorKind::UpstreamClient => "upstream_client",
            ErrorKind::Validation => "validation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::AlreadyRunning => "already_running",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        match normalized.as_str() {
            "network" | "timeout" => Ok(ErrorKind::Network),
            "upstream_server" | "server" | "5xx" => Ok(ErrorKind::UpstreamServer),
            "upstream_client" | "client" | "4xx" => Ok(ErrorKind::UpstreamClient),
            "validation" => Ok(ErrorKind::Validation),
            "configuration" | "config" => Ok(ErrorKind::Configuration),
            "rate_limit" | "rate_limited" | "429" => Ok(ErrorKind::RateLimit),
            "circuit_open" => Ok(ErrorKind::CircuitOpen),
            "already_running" => Ok(ErrorKind::AlreadyRunning),
            "cancelled" | "canceled" | "cancellation" => Ok(ErrorKind::Cancelled),
            _ => Err(format!("unknown error kind '{}'", s.trim())),
        }
    }
}

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("task failed after {attempts} attempt(s) [{kind}]: {message}")]
    TaskFailed {
        kind: ErrorKind,
        attempts: u32,
        message: String,
    },

    #[error("circuit open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    #[error("already running: {0}")]
    AlreadyRunning(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config file error: {0}")]
    ConfigFile(#[from] toml::de::Error),

    #[error("IO error while {op} {path}: {source}")]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    /// The classified kind, when the error belongs to the failure taxonomy.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::TaskFailed { kind, .. } => Some(*kind),
            Error::CircuitOpen { .. } => Some(ErrorKind::CircuitOpen),
            Error::AlreadyRunning(_) => Some(ErrorKind::AlreadyRunning),
            Error::Cancelled => Some(ErrorKind::Cancelled),
            Error::Validation(_) | Error::Serialization(_) => Some(ErrorKind::Validation),
            Error::Configuration(_) | Error::ConfigFile(_) => Some(ErrorKind::Configuration),
            Error::ShutdownTimeout(_)
            | Error::IoPath { .. }
            | Error::Io(_)
            | Error::Other(_) => None,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self.kind() {
            Some(ErrorKind::AlreadyRunning) => 3,
            Some(ErrorKind::Configuration) => 78,
            _ => 1,
        }
    }
}
