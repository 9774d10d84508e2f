//! The interval-driven tick loop.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::history::ExecutionHistory;
use super::status::{SchedulerState, SchedulerStatus, StopReason};
use crate::clock::{SharedClock, SystemClock, sleep_or_cancel};
use crate::config::{ScheduleConfig, format_duration};
use crate::executor::{Execution, Executor};
use crate::metrics::{ComponentHealth, HealthChecker, MetricsCollector};
use crate::resilience::{CircuitBreaker, CircuitState, RateLimiter};
use crate::task::{TaskRunner, TaskSpec};
use crate::utils::fs::write_json_atomic;
use crate::{Error, Result};

/// Executions considered by the scheduler health component.
const HEALTH_FAILURE_WINDOW: usize = 10;

/// Runs one task on a fixed interval until a bound is reached or it is stopped.
///
/// Share it behind an `Arc`: [`start`](Self::start) drives the loop while
/// [`stop`](Self::stop) and [`status`](Self::status) may be called from
/// anywhere.
pub struct Scheduler {
    config: ScheduleConfig,
    executor: Executor,
    health: Arc<HealthChecker>,
    clock: SharedClock,
    status: RwLock<SchedulerStatus>,
    history: Arc<ExecutionHistory>,
    status_file: Option<PathBuf>,
    cancellation_token: CancellationToken,
}

impl Scheduler {
    /// Build a scheduler from a validated config and a task runner.
    pub fn builder(config: ScheduleConfig, runner: Arc<dyn TaskRunner>) -> SchedulerBuilder {
        SchedulerBuilder::new(config, runner)
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Get the cancellation token for this scheduler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        self.executor.metrics()
    }

    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.executor.circuit_breaker()
    }

    /// Snapshot of the current status.
    pub fn status(&self) -> SchedulerStatus {
        self.status.read().clone()
    }

    pub fn state(&self) -> SchedulerState {
        self.status.read().state
    }

    /// Retained executions, oldest first.
    pub fn history(&self) -> Vec<Execution> {
        self.history.all()
    }

    /// The newest `limit` executions, oldest first.
    pub fn recent_executions(&self, limit: usize) -> Vec<Execution> {
        self.history.recent(limit)
    }

    /// Ask the loop to stop. A no-op unless the scheduler is running.
    ///
    /// An attempt already in flight finishes; pending waits end immediately.
    pub fn stop(&self) {
        {
            let mut status = self.status.write();
            if status.state != SchedulerState::Running {
                debug!(state = %status.state, "Stop ignored");
                return;
            }
            status.state = SchedulerState::Stopping;
        }
        info!("Scheduler stop requested");
        self.cancellation_token.cancel();
    }

    /// Run the loop until a stop condition.
    ///
    /// Returns the terminal error when a tick fails and `continue_on_error`
    /// is off; every other way of ending is `Ok`. Fails with
    /// [`Error::AlreadyRunning`] unless the scheduler is idle.
    pub async fn start(&self, spec: TaskSpec) -> Result<()> {
        {
            let mut status = self.status.write();
            if status.state != SchedulerState::Idle {
                return Err(Error::AlreadyRunning(format!(
                    "scheduler is {}",
                    status.state
                )));
            }
            status.mark_running(&spec.name);
        }

        info!(
            task = %spec.name,
            args = ?spec.args,
            interval = %format_duration(self.config.interval),
            max_runtime = ?self.config.max_runtime.map(format_duration),
            max_executions = ?self.config.max_executions,
            "Scheduler started"
        );

        self.register_health_checks().await;
        let monitor_token = self.cancellation_token.child_token();
        let monitor = self
            .health
            .clone()
            .spawn_monitor(self.config.health_check_interval, monitor_token.clone());

        let (reason, terminal) = self.run_loop(&spec).await;
        self.status.write().state = SchedulerState::Stopping;

        monitor_token.cancel();
        if let Err(e) = monitor.await {
            warn!("Health monitor task failed: {}", e);
        }

        self.status.write().mark_stopped(reason);
        self.publish_status().await;

        let status = self.status();
        info!(
            reason = %reason,
            executions = status.executions,
            failures = status.failures,
            skipped = status.skipped_ticks,
            "Scheduler stopped"
        );

        match terminal {
            Some(err) => {
                error!("Scheduler terminated by failed tick: {}", err);
                Err(err)
            }
            None => Ok(()),
        }
    }

    async fn run_loop(&self, spec: &TaskSpec) -> (StopReason, Option<Error>) {
        let interval = self.config.interval;
        let started = self.clock.now();
        let deadline = self.config.max_runtime.map(|limit| started + limit);
        let mut next_tick = started + interval;
        let mut sequence = 0u64;
        let mut skip_next = false;

        loop {
            self.set_next_execution(next_tick);

            let wake = deadline.map_or(next_tick, |d| d.min(next_tick));
            let wait = wake.saturating_duration_since(self.clock.now());
            if !sleep_or_cancel(self.clock.as_ref(), wait, &self.cancellation_token).await {
                return (StopReason::Requested, None);
            }
            if self.runtime_exceeded(deadline) {
                return (StopReason::MaxRuntime, None);
            }

            if skip_next {
                skip_next = false;
                self.status.write().skipped_ticks += 1;
                self.metrics().record_skipped_tick();
                info!(task = %spec.name, "Skipping tick after empty execution");
                next_tick = self.next_boundary(next_tick);
                continue;
            }

            sequence += 1;
            let execution = self.executor.run(spec, sequence, &self.cancellation_token).await;
            self.record(&execution);
            self.publish_status().await;

            if execution.is_cancelled() {
                return (StopReason::Requested, None);
            }
            if execution.is_failure() && !self.config.continue_on_error {
                return (StopReason::TaskFailed, execution.failure());
            }
            if self
                .config
                .max_executions
                .is_some_and(|max| sequence >= max)
            {
                return (StopReason::MaxExecutions, None);
            }
            if self.runtime_exceeded(deadline) {
                return (StopReason::MaxRuntime, None);
            }

            skip_next = self.config.skip_empty && execution.is_empty();
            next_tick = self.next_boundary(next_tick);
        }
    }

    /// First tick boundary strictly after now. Boundaries that passed while a
    /// tick was running are skipped, not replayed.
    fn next_boundary(&self, previous: Instant) -> Instant {
        let interval = self.config.interval;
        let now = self.clock.now();
        let mut next = previous + interval;
        if next <= now {
            let behind = now.saturating_duration_since(next);
            let missed = u32::try_from(behind.as_nanos() / interval.as_nanos() + 1)
                .unwrap_or(u32::MAX);
            next = interval
                .checked_mul(missed)
                .map_or(now + interval, |skip| next + skip);
            debug!(missed, "Skipped tick boundaries that passed during execution");
        }
        next
    }

    fn runtime_exceeded(&self, deadline: Option<Instant>) -> bool {
        deadline.is_some_and(|d| self.clock.now() >= d)
    }

    fn set_next_execution(&self, next_tick: Instant) {
        let until = next_tick.saturating_duration_since(self.clock.now());
        let at =
            Utc::now() + chrono::Duration::from_std(until).unwrap_or(chrono::Duration::zero());
        self.status.write().next_execution_at = Some(at);
    }

    fn record(&self, execution: &Execution) {
        self.status.write().record_execution(execution);
        self.history.push(execution.clone());

        if execution.success {
            info!(
                task = %execution.task,
                sequence = execution.sequence,
                attempts = execution.attempts,
                items = ?execution.items_produced,
                duration_ms = execution.duration_ms,
                "Tick succeeded"
            );
        } else if execution.is_cancelled() {
            info!(
                task = %execution.task,
                sequence = execution.sequence,
                "Tick interrupted by shutdown"
            );
        } else {
            warn!(
                task = %execution.task,
                sequence = execution.sequence,
                attempts = execution.attempts,
                kind = execution.error_kind.map_or("unknown", |k| k.as_str()),
                "Tick failed: {}",
                execution.error.as_deref().unwrap_or("unknown error")
            );
        }
    }

    async fn publish_status(&self) {
        let Some(path) = &self.status_file else {
            return;
        };
        let status = self.status();
        if let Err(e) = write_json_atomic(path, &status).await {
            warn!("Failed to write status file: {}", e);
        }
    }

    async fn register_health_checks(&self) {
        let history = self.history.clone();
        let threshold = self.health.config().failure_rate_warning;
        self.health
            .register(
                "scheduler",
                Arc::new(move || match history.failure_rate(HEALTH_FAILURE_WINDOW) {
                    Some(rate) if rate > threshold => ComponentHealth::degraded(
                        "scheduler",
                        format!("{:.0}% of recent executions failed", rate * 100.0),
                    ),
                    _ => ComponentHealth::healthy("scheduler"),
                }),
            )
            .await;

        if let Some(breaker) = self.circuit_breaker().cloned() {
            self.health
                .register(
                    "circuit_breaker",
                    Arc::new(move || match breaker.state() {
                        CircuitState::Closed => ComponentHealth::healthy("circuit_breaker"),
                        state => ComponentHealth::degraded(
                            "circuit_breaker",
                            format!("circuit '{}' is {}", breaker.name(), state),
                        ),
                    }),
                )
                .await;
        }
    }
}

/// Wires a [`Scheduler`] together from its config.
pub struct SchedulerBuilder {
    config: ScheduleConfig,
    runner: Arc<dyn TaskRunner>,
    clock: SharedClock,
    metrics: Option<Arc<MetricsCollector>>,
    cancellation_token: Option<CancellationToken>,
}

impl SchedulerBuilder {
    pub fn new(config: ScheduleConfig, runner: Arc<dyn TaskRunner>) -> Self {
        Self {
            config,
            runner,
            clock: SystemClock::shared(),
            metrics: None,
            cancellation_token: None,
        }
    }

    /// Time source for ticks, backoff and the guards.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Share a shutdown token with the caller instead of creating one.
    pub fn cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = Some(token);
        self
    }

    pub fn build(self) -> Result<Scheduler> {
        self.config.validate()?;

        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(MetricsCollector::new()));
        let guard_name = self
            .config
            .task
            .program
            .clone()
            .unwrap_or_else(|| "task".to_string());

        let mut executor = Executor::new(self.runner, self.config.retry_policy(), metrics.clone())
            .with_clock(self.clock.clone())
            .with_task_timeout(self.config.task_timeout);
        if let Some(breaker) = &self.config.circuit_breaker {
            executor = executor.with_circuit_breaker(Arc::new(CircuitBreaker::with_clock(
                guard_name,
                breaker.clone(),
                self.clock.clone(),
            )));
        }
        if let Some(limit) = &self.config.rate_limit {
            executor = executor.with_rate_limiter(Arc::new(RateLimiter::with_clock(
                limit.clone(),
                self.clock.clone(),
            )));
        }

        let health =
            Arc::new(HealthChecker::new(self.config.health.clone()).with_metrics(metrics));

        Ok(Scheduler {
            status_file: self.config.effective_status_file(),
            history: Arc::new(ExecutionHistory::new(self.config.history_capacity)),
            status: RwLock::new(SchedulerStatus::new()),
            cancellation_token: self.cancellation_token.unwrap_or_default(),
            clock: self.clock,
            health,
            executor,
            config: self.config,
        })
    }
}
