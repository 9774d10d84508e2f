//! Rate limiting for outbound task calls.
//!
//! Sliding-window log: the limiter remembers when each of the last `N`
//! permits was granted and only grants another once the oldest has left the
//! window. Any window of the configured length therefore contains at most
//! `N` grants.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::clock::{SharedClock, SystemClock, sleep_or_cancel};
use crate::config::duration_str;
use crate::{Error, Result};

/// Configuration for a rate limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Permits per window.
    pub max_permits: u32,
    /// Window length.
    #[serde(with = "duration_str")]
    pub window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_permits: 10,
            window: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    pub fn new(max_permits: u32, window: Duration) -> Result<Self> {
        let config = Self {
            max_permits,
            window,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_permits == 0 {
            return Err(Error::config("rate_limit.max_permits must be at least 1"));
        }
        if self.window.is_zero() {
            return Err(Error::config("rate_limit.window must be greater than zero"));
        }
        Ok(())
    }
}

/// Sliding-window rate limiter, shareable across callers.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    clock: SharedClock,
    granted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a new rate limiter on the system clock.
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: RateLimiterConfig, clock: SharedClock) -> Self {
        Self {
            granted: Mutex::new(VecDeque::with_capacity(config.max_permits as usize)),
            config,
            clock,
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Try to take a permit without waiting.
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut granted = self.granted.lock();
        self.evict_expired(&mut granted, now);

        if granted.len() < self.config.max_permits as usize {
            granted.push_back(now);
            true
        } else {
            false
        }
    }

    /// Wait until a permit is available or `cancel` fires.
    ///
    /// Returns the total time spent waiting. Cancellation yields
    /// [`Error::Cancelled`]; the call is never silently dropped.
    ///
    /// # Cancel Safety
    ///
    /// The lock is never held across an await point, so dropping this future
    /// leaves the limiter consistent and consumes no permit.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Duration> {
        let mut total_wait = Duration::ZERO;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let wait = {
                let now = self.clock.now();
                let mut granted = self.granted.lock();
                self.evict_expired(&mut granted, now);

                if granted.len() < self.config.max_permits as usize {
                    granted.push_back(now);
                    return Ok(total_wait);
                }
                self.wait_for(&granted, now)
            };

            trace!(wait = ?wait, "rate limited");
            if !sleep_or_cancel(self.clock.as_ref(), wait, cancel).await {
                return Err(Error::Cancelled);
            }
            total_wait += wait;
        }
    }

    /// Permits that could be granted right now.
    pub fn available_permits(&self) -> u32 {
        let now = self.clock.now();
        let mut granted = self.granted.lock();
        self.evict_expired(&mut granted, now);
        self.config.max_permits - granted.len() as u32
    }

    /// Time until the next permit frees up.
    pub fn time_until_available(&self) -> Duration {
        let now = self.clock.now();
        let mut granted = self.granted.lock();
        self.evict_expired(&mut granted, now);

        if granted.len() < self.config.max_permits as usize {
            Duration::ZERO
        } else {
            self.wait_for(&granted, now)
        }
    }

    fn wait_for(&self, granted: &VecDeque<Instant>, now: Instant) -> Duration {
        granted
            .front()
            .map(|oldest| (*oldest + self.config.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    fn evict_expired(&self, granted: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = granted.front() {
            if now.saturating_duration_since(*oldest) >= self.config.window {
                granted.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn limiter(clock: &Arc<ManualClock>, permits: u32, window_secs: u64) -> RateLimiter {
        RateLimiter::with_clock(
            RateLimiterConfig::new(permits, Duration::from_secs(window_secs)).unwrap(),
            clock.clone(),
        )
    }

    #[test]
    fn test_rate_limiter_try_acquire() {
        let clock = ManualClock::shared();
        let limiter = limiter(&clock, 2, 10);

        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        assert_eq!(limiter.available_permits(), 0);
        assert_eq!(limiter.time_until_available(), Duration::from_secs(10));

        clock.advance(Duration::from_secs(10));
        assert_eq!(limiter.available_permits(), 2);
        assert!(limiter.try_acquire());
    }

    #[test]
    fn test_rate_limiter_config_validation() {
        assert!(RateLimiterConfig::new(0, Duration::from_secs(1)).is_err());
        assert!(RateLimiterConfig::new(1, Duration::ZERO).is_err());
        assert!(RateLimiterConfig::new(5, Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn test_acquire_waits_for_window_to_slide() {
        let clock = ManualClock::shared();
        let limiter = limiter(&clock, 1, 5);
        let cancel = CancellationToken::new();

        assert_eq!(limiter.acquire(&cancel).await.unwrap(), Duration::ZERO);
        clock.advance(Duration::from_secs(2));

        let waited = limiter.acquire(&cancel).await.unwrap();
        assert_eq!(waited, Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_acquire_returns_cancelled() {
        let clock = ManualClock::shared();
        let limiter = limiter(&clock, 1, 5);
        let cancel = CancellationToken::new();

        limiter.acquire(&cancel).await.unwrap();
        cancel.cancel();

        assert!(matches!(
            limiter.acquire(&cancel).await,
            Err(Error::Cancelled)
        ));
        // The cancelled caller consumed nothing.
        clock.advance(Duration::from_secs(5));
        assert_eq!(limiter.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_never_more_than_n_in_any_window() {
        let clock = ManualClock::shared();
        let limiter = limiter(&clock, 3, 10);
        let cancel = CancellationToken::new();
        let mut grants = Vec::new();

        for i in 0..20 {
            if i % 4 == 0 {
                clock.advance(Duration::from_millis(1700));
            }
            limiter.acquire(&cancel).await.unwrap();
            grants.push(clock.elapsed());
        }

        for (i, start) in grants.iter().enumerate() {
            let in_window = grants[i..]
                .iter()
                .filter(|t| **t - *start < Duration::from_secs(10))
                .count();
            assert!(in_window <= 3, "window starting at {start:?} had {in_window}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_on_system_clock() {
        use std::sync::atomic::{AtomicU32, Ordering};

        let limiter = Arc::new(RateLimiter::new(
            RateLimiterConfig::new(2, Duration::from_secs(1)).unwrap(),
        ));
        let cancel = CancellationToken::new();
        let done = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();

        for _ in 0..6 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let done = done.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire(&cancel).await.unwrap();
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(done.load(Ordering::SeqCst), 6);
    }
}
