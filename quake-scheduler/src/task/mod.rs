//! The unit of work being scheduled.
//!
//! The core treats a task as opaque: it is identified by a name and an
//! argument list, and reports either success (optionally with a count of items
//! produced) or a [`TaskError`] already classified into an [`ErrorKind`].

mod command;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ErrorKind;

pub use command::CommandRunner;

/// Identity and arguments of the scheduled task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub name: String,
    pub args: Vec<String>,
}

impl TaskSpec {
    pub fn new<I, S>(name: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// What a successful invocation reports back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Items the task says it produced, if it reports a count.
    pub items_produced: Option<u64>,
}

impl TaskOutput {
    pub fn with_items(items: u64) -> Self {
        Self {
            items_produced: Some(items),
        }
    }
}

/// A classified failure from one invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{kind}] {message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    /// Upstream hint for how long to wait before retrying (rate limits).
    pub retry_after: Option<Duration>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn upstream_server(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamServer, message)
    }

    pub fn upstream_client(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamClient, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn rate_limited(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            retry_after,
            ..Self::new(ErrorKind::RateLimit, message)
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled by shutdown")
    }

    pub fn circuit_open(retry_in: Duration) -> Self {
        Self::new(
            ErrorKind::CircuitOpen,
            format!("circuit open, retry in {}ms", retry_in.as_millis()),
        )
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Something the executor can invoke once per attempt.
///
/// Implementations classify their own failures; the executor never inspects
/// error text.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Invoke the task once.
    ///
    /// # Cancel Safety
    ///
    /// The future may be dropped when a per-attempt timeout expires or the
    /// shutdown grace period runs out. Implementations must not leave work
    /// running after drop.
    async fn invoke(&self, spec: &TaskSpec) -> Result<TaskOutput, TaskError>;
}

/// Adapts an async closure into a [`TaskRunner`] for in-process tasks.
pub struct FnRunner<F> {
    f: F,
}

impl<F> FnRunner<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskRunner for FnRunner<F>
where
    F: Fn(TaskSpec) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TaskOutput, TaskError>> + Send,
{
    async fn invoke(&self, spec: &TaskSpec) -> Result<TaskOutput, TaskError> {
        (self.f)(spec.clone()).await
    }
}
