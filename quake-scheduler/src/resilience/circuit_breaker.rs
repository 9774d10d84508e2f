//! Circuit breaker guarding one unreliable downstream call path.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::config::duration_str;
use crate::{Error, Result};

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed (normal operation).
    Closed,
    /// Circuit is open (failing, rejecting requests).
    Open,
    /// Circuit is half-open (probing whether the dependency recovered).
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    #[serde(with = "duration_str")]
    pub open_timeout: Duration,
    /// Consecutive half-open successes needed to close the circuit.
    pub success_threshold: u32,
    /// Concurrent probe calls admitted while half-open.
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            success_threshold: 2,
            half_open_max_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::config(
                "circuit_breaker.failure_threshold must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(Error::config(
                "circuit_breaker.success_threshold must be at least 1",
            ));
        }
        if self.half_open_max_probes == 0 {
            return Err(Error::config(
                "circuit_breaker.half_open_max_probes must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    /// Milliseconds since the last recorded failure.
    pub last_failure_ago_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    probes_in_flight: u32,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            last_failure_at: None,
            probes_in_flight: 0,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.consecutive_successes = 0;
        self.probes_in_flight = 0;
    }
}

/// Circuit breaker for protecting against cascading failures.
///
/// All transitions happen under one lock, so concurrent callers sharing a
/// breaker observe a consistent state machine.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker on the system clock.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, SystemClock::shared())
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerState::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.check_state_transition(&mut inner);
        inner.state
    }

    /// Ask to place a call through the breaker.
    ///
    /// Closed: always admitted. Open: rejected with [`Error::CircuitOpen`] until
    /// the open timeout has elapsed. Half-open: admitted while fewer than
    /// `half_open_max_probes` probes are in flight.
    ///
    /// Every admitted call must be followed by exactly one of
    /// [`record_success`](Self::record_success), [`record_failure`](Self::record_failure)
    /// or [`release`](Self::release).
    pub fn try_acquire(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.check_state_transition(&mut inner);

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(Error::CircuitOpen {
                retry_in: self.remaining_open_time(&inner),
            }),
            CircuitState::HalfOpen => {
                if inner.probes_in_flight < self.config.half_open_max_probes {
                    inner.probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen {
                        retry_in: Duration::ZERO,
                    })
                }
            }
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    *inner = BreakerState::closed();
                    info!(breaker = %self.name, "Circuit breaker closed after successful recovery");
                } else {
                    debug!(
                        breaker = %self.name,
                        "Circuit breaker probe succeeded ({}/{})",
                        inner.consecutive_successes,
                        self.config.success_threshold
                    );
                }
            }
            CircuitState::Open => {
                // A call admitted before the circuit opened finished late.
            }
        }
    }

    /// Record a failed operation.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        let now = self.clock.now();
        inner.last_failure_at = Some(now);

        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.open(now);
                    warn!(
                        breaker = %self.name,
                        "Circuit breaker opened after {} consecutive failures",
                        inner.consecutive_failures
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.consecutive_failures += 1;
                inner.open(now);
                warn!(breaker = %self.name, "Circuit breaker reopened after a failed probe");
            }
            CircuitState::Open => {
                inner.consecutive_failures += 1;
            }
        }
    }

    /// Release an admitted call whose outcome says nothing about the
    /// dependency's health (e.g. a rejected request or a malformed payload).
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }

    /// Reset the circuit breaker to closed state.
    pub fn reset(&self) {
        *self.inner.lock() = BreakerState::closed();
        debug!(breaker = %self.name, "Circuit breaker reset to closed state");
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let mut inner = self.inner.lock();
        self.check_state_transition(&mut inner);
        let now = self.clock.now();
        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            last_failure_ago_ms: inner
                .last_failure_at
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
        }
    }

    fn remaining_open_time(&self, inner: &BreakerState) -> Duration {
        inner
            .opened_at
            .map(|opened| {
                self.config
                    .open_timeout
                    .saturating_sub(self.clock.now().saturating_duration_since(opened))
            })
            .unwrap_or(Duration::ZERO)
    }

    /// Check if state should transition (open -> half-open after the timeout).
    fn check_state_transition(&self, inner: &mut BreakerState) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && self.clock.now().saturating_duration_since(opened_at) >= self.config.open_timeout
        {
            inner.state = CircuitState::HalfOpen;
            inner.consecutive_successes = 0;
            inner.probes_in_flight = 0;
            debug!(breaker = %self.name, "Circuit breaker transitioned to half-open state");
        }
    }
}
