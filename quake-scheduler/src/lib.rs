//! quake-scheduler library crate.
//!
//! A resilient periodic runner for earthquake and fault data collection
//! tasks: an interval scheduler, an executor with retry and backoff, a
//! circuit breaker and rate limiter on the call path, a daemon manager, and
//! health and metrics collection.

pub mod api;
pub mod cli;
pub mod clock;
pub mod config;
pub mod daemon;
pub mod error;
pub mod executor;
pub mod logging;
pub mod metrics;
pub mod panic_hook;
pub mod resilience;
pub mod scheduler;
pub mod task;
pub mod utils;

pub use error::{Error, Result};
