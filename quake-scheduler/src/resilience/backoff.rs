//! Backoff policies: pure functions from attempt number to delay.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Backoff strategy, selected by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Immediate retry.
    None,
    /// `base * n`.
    Linear,
    /// `base * 2^(n-1)`.
    #[default]
    Exponential,
}

impl BackoffStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            BackoffStrategy::None => "none",
            BackoffStrategy::Linear => "linear",
            BackoffStrategy::Exponential => "exponential",
        }
    }
}

impl fmt::Display for BackoffStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" | "immediate" => Ok(BackoffStrategy::None),
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" | "exp" => Ok(BackoffStrategy::Exponential),
            other => Err(format!(
                "unknown backoff strategy '{other}' (expected none, linear or exponential)"
            )),
        }
    }
}

/// A backoff strategy bound to its base delay and cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    strategy: BackoffStrategy,
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(strategy: BackoffStrategy, base: Duration, max: Duration) -> Self {
        Self {
            strategy,
            base,
            max,
        }
    }

    /// Immediate retries.
    pub fn none() -> Self {
        Self::new(BackoffStrategy::None, Duration::ZERO, Duration::ZERO)
    }

    pub fn strategy(&self) -> BackoffStrategy {
        self.strategy
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retrying after failed attempt `attempt` (1-indexed).
    ///
    /// Always within `[0, max]`. Attempt `0` is not a valid attempt number and
    /// yields no delay, as does a zero base.
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base.is_zero() {
            return Duration::ZERO;
        }

        let raw = match self.strategy {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Linear => self.base.saturating_mul(attempt),
            BackoffStrategy::Exponential => {
                let shift = (attempt - 1).min(31);
                self.base
                    .checked_mul(1u32 << shift)
                    .unwrap_or(Duration::MAX)
            }
        };

        raw.min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            BackoffStrategy::Exponential,
            Duration::from_secs(1),
            Duration::from_secs(60),
        )
    }
}
