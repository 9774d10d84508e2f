//! Executor: one tick's worth of attempts against the task.
//!
//! Each attempt passes through the circuit breaker, then the rate limiter,
//! then the task itself. Failures are retried according to the
//! [`RetryPolicy`]; every outcome, including cancellation, ends up in an
//! [`Execution`] value rather than an error.

mod execution;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::Error;
use crate::clock::{SharedClock, SystemClock, sleep_or_cancel};
use crate::config::format_duration;
use crate::error::ErrorKind;
use crate::metrics::{AttemptRecord, MetricsCollector};
use crate::resilience::{CircuitBreaker, RateLimiter, RetryPolicy};
use crate::task::{TaskError, TaskOutput, TaskRunner, TaskSpec};

pub use execution::Execution;
use execution::PendingExecution;

/// Runs the task with retry, backoff and the optional guards.
pub struct Executor {
    runner: Arc<dyn TaskRunner>,
    retry: RetryPolicy,
    task_timeout: Option<Duration>,
    breaker: Option<Arc<CircuitBreaker>>,
    limiter: Option<Arc<RateLimiter>>,
    metrics: Arc<MetricsCollector>,
    clock: SharedClock,
}

impl Executor {
    pub fn new(
        runner: Arc<dyn TaskRunner>,
        retry: RetryPolicy,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            runner,
            retry,
            task_timeout: None,
            breaker: None,
            limiter: None,
            metrics,
            clock: SystemClock::shared(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Abort an attempt that runs longer than `timeout`; it fails as `network`.
    pub fn with_task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.task_timeout = timeout;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Run one tick. Never fails: the outcome is the returned [`Execution`].
    ///
    /// `cancel` interrupts backoff and rate-limiter waits. An attempt already
    /// in flight is allowed to finish.
    pub async fn run(
        &self,
        spec: &TaskSpec,
        sequence: u64,
        cancel: &CancellationToken,
    ) -> Execution {
        let pending = PendingExecution::start(spec, sequence);
        let execution_id = pending.id();
        let started = self.clock.now();
        let mut attempt = 0;

        let result = loop {
            attempt += 1;
            let attempt_started = self.clock.now();
            let outcome = self.attempt(spec, cancel).await;
            self.record_attempt(execution_id, sequence, spec, attempt, attempt_started, &outcome);

            let err = match outcome {
                Ok(output) => break Ok(output),
                Err(err) => err,
            };

            if err.kind == ErrorKind::Cancelled || !self.retry.should_retry(attempt, err.kind) {
                break Err(err);
            }

            let delay = self.retry.delay_for(attempt, &err);
            warn!(
                task = %spec.name,
                sequence,
                attempt,
                kind = %err.kind,
                "Attempt failed, retrying in {}: {}",
                format_duration(delay),
                err.message
            );
            if !sleep_or_cancel(self.clock.as_ref(), delay, cancel).await {
                debug!(task = %spec.name, sequence, "Backoff interrupted by shutdown");
                break Err(TaskError::cancelled());
            }
        };

        let elapsed = self.clock.now().saturating_duration_since(started);
        let execution = pending.finish(attempt, elapsed, result);
        self.metrics.record_execution(
            execution.success,
            execution.error_kind,
            execution.duration_ms,
            execution.items_produced,
        );
        execution
    }

    async fn attempt(
        &self,
        spec: &TaskSpec,
        cancel: &CancellationToken,
    ) -> Result<TaskOutput, TaskError> {
        if let Some(breaker) = &self.breaker
            && let Err(err) = breaker.try_acquire()
        {
            self.metrics.record_circuit_rejection();
            let retry_in = match err {
                Error::CircuitOpen { retry_in } => retry_in,
                _ => Duration::ZERO,
            };
            return Err(TaskError::circuit_open(retry_in));
        }

        if let Some(limiter) = &self.limiter {
            match limiter.acquire(cancel).await {
                Ok(waited) => self.metrics.record_rate_limit_wait(waited.as_millis() as u64),
                Err(_) => {
                    if let Some(breaker) = &self.breaker {
                        breaker.release();
                    }
                    return Err(TaskError::cancelled());
                }
            }
        }

        let result = match self.task_timeout {
            Some(limit) => tokio::time::timeout(limit, self.runner.invoke(spec))
                .await
                .unwrap_or_else(|_| {
                    Err(TaskError::network(format!(
                        "attempt timed out after {}",
                        format_duration(limit)
                    )))
                }),
            None => self.runner.invoke(spec).await,
        };

        if let Some(breaker) = &self.breaker {
            match &result {
                Ok(_) => breaker.record_success(),
                Err(err) if err.kind.counts_against_dependency() => breaker.record_failure(),
                Err(_) => breaker.release(),
            }
        }
        result
    }

    fn record_attempt(
        &self,
        execution_id: Uuid,
        sequence: u64,
        spec: &TaskSpec,
        attempt: u32,
        started: tokio::time::Instant,
        outcome: &Result<TaskOutput, TaskError>,
    ) {
        let duration = self.clock.now().saturating_duration_since(started);
        self.metrics.record_attempt(AttemptRecord {
            execution_id,
            sequence,
            task: spec.name.clone(),
            attempt,
            success: outcome.is_ok(),
            error_kind: outcome.as_ref().err().map(|e| e.kind),
            duration_ms: duration.as_millis() as u64,
            finished_at: Utc::now(),
        });
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::resilience::{
        Backoff, BackoffStrategy, CircuitBreakerConfig, CircuitState, RateLimiterConfig,
    };
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Replays scripted outcomes, then succeeds with no item count.
    #[derive(Default)]
    struct ScriptedRunner {
        script: Mutex<VecDeque<Result<TaskOutput, TaskError>>>,
        calls: AtomicU32,
        cancel_on_call: Option<CancellationToken>,
    }

    impl ScriptedRunner {
        fn new(script: Vec<Result<TaskOutput, TaskError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl TaskRunner for ScriptedRunner {
        async fn invoke(&self, _spec: &TaskSpec) -> Result<TaskOutput, TaskError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(cancel) = &self.cancel_on_call {
                cancel.cancel();
            }
            self.script
                .lock()
                .pop_front()
                .unwrap_or(Ok(TaskOutput::default()))
        }
    }

    fn exponential(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            Backoff::new(
                BackoffStrategy::Exponential,
                Duration::from_secs(1),
                Duration::from_secs(10),
            ),
        )
    }

    fn executor(
        runner: Arc<ScriptedRunner>,
        retry: RetryPolicy,
        clock: &Arc<ManualClock>,
    ) -> Executor {
        Executor::new(runner, retry, Arc::new(MetricsCollector::new())).with_clock(clock.clone())
    }

    fn spec() -> TaskSpec {
        TaskSpec::new("fetch-usgs", ["--feed", "all_hour"])
    }

    #[tokio::test]
    async fn test_retries_until_success_with_exponential_backoff() {
        let clock = ManualClock::shared();
        let runner = ScriptedRunner::new(vec![
            Err(TaskError::network("connection reset")),
            Err(TaskError::network("connection reset")),
            Ok(TaskOutput::with_items(42)),
        ]);
        let executor = executor(runner.clone(), exponential(5), &clock);

        let execution = executor.run(&spec(), 1, &CancellationToken::new()).await;

        assert!(execution.success);
        assert_eq!(execution.attempts, 3);
        assert_eq!(execution.items_produced, Some(42));
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert_eq!(clock.total_slept(), Duration::from_secs(3));
        assert_eq!(execution.duration_ms, 3000);
        assert_eq!(runner.calls(), 3);

        let snapshot = executor.metrics().snapshot();
        assert_eq!(snapshot.attempts_total, 3);
        assert_eq!(snapshot.attempt_failures.get("network"), Some(&2));
        assert_eq!(snapshot.executions_total, 1);
        assert_eq!(snapshot.executions_failed, 0);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let clock = ManualClock::shared();
        let runner = ScriptedRunner::new(vec![Err(TaskError::validation("bad GeoJSON"))]);
        let executor = executor(runner.clone(), exponential(5), &clock);

        let execution = executor.run(&spec(), 1, &CancellationToken::new()).await;

        assert!(!execution.success);
        assert_eq!(execution.attempts, 1);
        assert_eq!(execution.error_kind, Some(ErrorKind::Validation));
        assert_eq!(execution.error.as_deref(), Some("bad GeoJSON"));
        assert!(clock.sleeps().is_empty());
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_last_error() {
        let clock = ManualClock::shared();
        let runner = ScriptedRunner::new(vec![
            Err(TaskError::network("timeout")),
            Err(TaskError::upstream_server("HTTP 502")),
            Err(TaskError::upstream_server("HTTP 503")),
        ]);
        let executor = executor(runner.clone(), exponential(3), &clock);

        let execution = executor.run(&spec(), 7, &CancellationToken::new()).await;

        assert!(execution.is_failure());
        assert_eq!(execution.sequence, 7);
        assert_eq!(execution.attempts, 3);
        assert_eq!(execution.error_kind, Some(ErrorKind::UpstreamServer));
        assert_eq!(execution.error.as_deref(), Some("HTTP 503"));
        assert_eq!(executor.metrics().snapshot().executions_failed, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_hint_extends_backoff() {
        let clock = ManualClock::shared();
        let runner = ScriptedRunner::new(vec![Err(TaskError::rate_limited(
            "HTTP 429",
            Some(Duration::from_secs(30)),
        ))]);
        let executor = executor(runner, exponential(3), &clock);

        let execution = executor.run(&spec(), 1, &CancellationToken::new()).await;

        assert!(execution.success);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(30)]);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_calling_task() {
        let clock = ManualClock::shared();
        let breaker = Arc::new(CircuitBreaker::with_clock(
            "usgs",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
            clock.clone(),
        ));
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let runner = ScriptedRunner::new(vec![]);
        let executor =
            executor(runner.clone(), exponential(3), &clock).with_circuit_breaker(breaker);

        let execution = executor.run(&spec(), 1, &CancellationToken::new()).await;

        assert_eq!(runner.calls(), 0);
        assert_eq!(execution.error_kind, Some(ErrorKind::CircuitOpen));
        assert_eq!(execution.attempts, 1);
        assert_eq!(executor.metrics().snapshot().circuit_rejections, 1);
    }

    #[tokio::test]
    async fn test_only_dependency_failures_trip_the_breaker() {
        let clock = ManualClock::shared();
        let breaker = Arc::new(CircuitBreaker::with_clock(
            "usgs",
            CircuitBreakerConfig {
                failure_threshold: 2,
                ..Default::default()
            },
            clock.clone(),
        ));
        let runner = ScriptedRunner::new(vec![
            Err(TaskError::upstream_client("HTTP 404")),
            Err(TaskError::upstream_client("HTTP 404")),
            Err(TaskError::upstream_server("HTTP 500")),
        ]);
        let executor = executor(runner, RetryPolicy::single_attempt(), &clock)
            .with_circuit_breaker(breaker.clone());
        let cancel = CancellationToken::new();

        executor.run(&spec(), 1, &cancel).await;
        executor.run(&spec(), 2, &cancel).await;
        assert_eq!(breaker.state(), CircuitState::Closed);

        executor.run(&spec(), 3, &cancel).await;
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_ends_as_cancelled() {
        let clock = ManualClock::shared();
        let cancel = CancellationToken::new();
        let runner = Arc::new(ScriptedRunner {
            script: Mutex::new(vec![Err(TaskError::network("reset"))].into()),
            cancel_on_call: Some(cancel.clone()),
            ..Default::default()
        });
        let executor = executor(runner.clone(), exponential(5), &clock);

        let execution = executor.run(&spec(), 1, &cancel).await;

        assert!(execution.is_cancelled());
        assert!(!execution.is_failure());
        assert_eq!(execution.attempts, 1);
        assert!(clock.sleeps().is_empty());
        assert_eq!(executor.metrics().snapshot().executions_cancelled, 1);
    }

    #[tokio::test]
    async fn test_rate_limiter_wait_is_recorded() {
        let clock = ManualClock::shared();
        let limiter = Arc::new(RateLimiter::with_clock(
            RateLimiterConfig::new(1, Duration::from_secs(10)).unwrap(),
            clock.clone(),
        ));
        let runner = ScriptedRunner::new(vec![]);
        let executor = executor(runner, exponential(3), &clock).with_rate_limiter(limiter);
        let cancel = CancellationToken::new();

        executor.run(&spec(), 1, &cancel).await;
        let second = executor.run(&spec(), 2, &cancel).await;

        assert!(second.success);
        assert_eq!(second.duration_ms, 10_000);
        let snapshot = executor.metrics().snapshot();
        assert_eq!(snapshot.rate_limit_waits, 1);
        assert_eq!(snapshot.rate_limit_wait_total_ms, 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_timeout_is_a_network_failure() {
        struct Hangs;

        #[async_trait::async_trait]
        impl TaskRunner for Hangs {
            async fn invoke(&self, _spec: &TaskSpec) -> Result<TaskOutput, TaskError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(TaskOutput::default())
            }
        }

        let executor = Executor::new(
            Arc::new(Hangs),
            RetryPolicy::single_attempt(),
            Arc::new(MetricsCollector::new()),
        )
        .with_task_timeout(Some(Duration::from_secs(5)));

        let execution = executor.run(&spec(), 1, &CancellationToken::new()).await;

        assert_eq!(execution.error_kind, Some(ErrorKind::Network));
        assert!(execution.error.unwrap().contains("timed out after 5s"));
    }
}
