//! Retry policy and failure classification.

use std::time::Duration;

use crate::error::ErrorKind;
use crate::task::TaskError;

use super::backoff::Backoff;

/// Longest wait a rate-limit hint may impose by default.
pub const DEFAULT_MAX_RETRY_AFTER: Duration = Duration::from_secs(5 * 60);

/// How many times a tick may attempt the task, and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per tick, including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Ceiling applied to upstream `retry_after` hints.
    pub max_retry_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            max_retry_after: DEFAULT_MAX_RETRY_AFTER,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            max_retry_after: DEFAULT_MAX_RETRY_AFTER,
        }
    }

    pub fn with_max_retry_after(mut self, limit: Duration) -> Self {
        self.max_retry_after = limit;
        self
    }

    /// No retries at all.
    pub fn single_attempt() -> Self {
        Self::new(1, Backoff::none())
    }

    /// Whether another attempt should follow failed attempt `attempt`.
    pub fn should_retry(&self, attempt: u32, kind: ErrorKind) -> bool {
        kind.is_retryable() && attempt < self.max_attempts
    }

    /// Delay before the attempt following failed attempt `attempt`.
    ///
    /// A rate-limit hint from upstream extends the backoff delay up to
    /// `max_retry_after`.
    pub fn delay_for(&self, attempt: u32, error: &TaskError) -> Duration {
        let delay = self.backoff.delay(attempt);
        match (error.kind, error.retry_after) {
            (ErrorKind::RateLimit, Some(hint)) => delay.max(hint.min(self.max_retry_after)),
            _ => delay,
        }
    }
}

/// Classify a non-zero process exit code.
///
/// Follows the BSD `sysexits.h` convention; codes outside it are treated as
/// transient upstream failures. `None` (killed by a signal) counts as network.
pub fn classify_exit_code(code: Option<i32>) -> ErrorKind {
    match code {
        None => ErrorKind::Network,
        Some(64) => ErrorKind::Configuration, // EX_USAGE
        Some(65) => ErrorKind::Validation,    // EX_DATAERR
        Some(66) => ErrorKind::UpstreamClient, // EX_NOINPUT
        Some(68) => ErrorKind::Network,       // EX_NOHOST
        Some(69) => ErrorKind::UpstreamServer, // EX_UNAVAILABLE
        Some(75) => ErrorKind::Network,       // EX_TEMPFAIL
        Some(76) => ErrorKind::Validation,    // EX_PROTOCOL
        Some(77) => ErrorKind::UpstreamClient, // EX_NOPERM
        Some(78) => ErrorKind::Configuration, // EX_CONFIG
        Some(_) => ErrorKind::UpstreamServer,
    }
}

/// Classify an I/O error raised while spawning or talking to a task process.
pub fn classify_io_error(err: &std::io::Error) -> ErrorKind {
    use std::io::ErrorKind as Io;

    match err.kind() {
        Io::NotFound | Io::PermissionDenied | Io::InvalidInput => ErrorKind::Configuration,
        _ => ErrorKind::Network,
    }
}
