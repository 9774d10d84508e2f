//! Resilience primitives guarding the outbound task call path.
//!
//! - [`Backoff`]: delay between retry attempts (none / linear / exponential)
//! - [`RetryPolicy`]: attempt budget plus classification-aware retry decisions
//! - [`CircuitBreaker`]: stops calling a failing dependency for a cooldown period
//! - [`RateLimiter`]: bounds calls per time window

mod backoff;
mod circuit_breaker;
mod rate_limiter;
mod retry;

pub use backoff::{Backoff, BackoffStrategy};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
pub use retry::{RetryPolicy, classify_exit_code, classify_io_error};
