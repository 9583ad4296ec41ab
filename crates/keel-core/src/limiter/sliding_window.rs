//! Sliding-window log.
//!
//! Remembers the admission time of every request in the last `window` and
//! admits a new one while fewer than `max_requests` are remembered. Unlike a
//! fixed window, a burst straddling a window boundary cannot double the rate.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{ConfigError, RateLimited};

use super::RateLimiter;

pub struct SlidingWindow {
    max_requests: u32,
    window: Duration,
    log: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    pub fn new(max_requests: u32, window: Duration) -> Result<Self, ConfigError> {
        if max_requests == 0 {
            return Err(ConfigError::invalid("max_requests", "must be > 0"));
        }
        if window.is_zero() {
            return Err(ConfigError::invalid("window", "must be > 0"));
        }

        info!(max_requests, window = ?window, "Initialized sliding window limiter");

        Ok(Self {
            max_requests,
            window,
            log: Mutex::new(VecDeque::new()),
        })
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Requests admitted within the current window.
    pub fn in_window(&self) -> u32 {
        let mut log = self.lock();
        self.evict(&mut log, Instant::now());
        log.len() as u32
    }

    pub fn try_acquire(&self) -> Result<(), RateLimited> {
        let now = Instant::now();
        let mut log = self.lock();
        self.evict(&mut log, now);

        if log.len() < self.max_requests as usize {
            log.push_back(now);
            return Ok(());
        }

        // The log is full, so the oldest entry decides when a slot frees up.
        let retry_after = log
            .front()
            .map(|oldest| self.window.saturating_sub(now.saturating_duration_since(*oldest)))
            .unwrap_or_default();
        debug!(in_window = log.len(), retry_after = ?retry_after, "Rate limited");
        Err(RateLimited { retry_after })
    }

    /// Wait until the window has room and take it.
    pub async fn acquire(&self) {
        super::acquire(self).await;
    }

    fn evict(&self, log: &mut VecDeque<Instant>, now: Instant) {
        while log
            .front()
            .is_some_and(|oldest| now.saturating_duration_since(*oldest) >= self.window)
        {
            log.pop_front();
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Instant>> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RateLimiter for SlidingWindow {
    fn try_acquire(&self) -> Result<(), RateLimited> {
        SlidingWindow::try_acquire(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, Duration::from_secs(1))]
    #[case(3, Duration::ZERO)]
    fn rejects_invalid_parameters(#[case] max_requests: u32, #[case] window: Duration) {
        assert!(SlidingWindow::new(max_requests, window).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn limits_requests_within_window() {
        let limiter = SlidingWindow::new(3, Duration::from_secs(1)).unwrap();

        for _ in 0..3 {
            limiter.try_acquire().unwrap();
        }
        let limited = limiter.try_acquire().unwrap_err();
        assert_eq!(limited.retry_after, Duration::from_secs(1));
        assert_eq!(limiter.in_window(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn old_requests_slide_out() {
        let limiter = SlidingWindow::new(3, Duration::from_secs(1)).unwrap();
        limiter.try_acquire().unwrap();
        limiter.try_acquire().unwrap();

        tokio::time::advance(Duration::from_millis(600)).await;
        limiter.try_acquire().unwrap();

        tokio::time::advance(Duration::from_millis(300)).await;
        let limited = limiter.try_acquire().unwrap_err();
        assert_eq!(limited.retry_after, Duration::from_millis(100));

        // The first two expire; the one from 600ms is still counted.
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(limiter.in_window(), 1);
        limiter.try_acquire().unwrap();
        limiter.try_acquire().unwrap();

        let limited = limiter.try_acquire().unwrap_err();
        assert_eq!(limited.retry_after, Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_requests_are_not_logged() {
        let limiter = SlidingWindow::new(1, Duration::from_millis(200)).unwrap();
        limiter.try_acquire().unwrap();

        for _ in 0..5 {
            assert!(limiter.try_acquire().is_err());
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        tokio::time::advance(Duration::from_millis(150)).await;

        limiter.try_acquire().unwrap();
    }
}
