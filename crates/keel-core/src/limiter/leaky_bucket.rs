//! Leaky bucket used as a meter.
//!
//! Every admitted request adds one unit of water. The bucket drains at one
//! unit per `leak_interval`, so the sustained rate is fixed while up to
//! `capacity` requests can be admitted back to back.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{ConfigError, RateLimited};

use super::{RateLimiter, saturating_secs};

struct Level {
    water: f64,
    last_leak: Instant,
}

pub struct LeakyBucket {
    capacity: u32,
    leak_interval: Duration,
    state: Mutex<Level>,
}

impl LeakyBucket {
    pub fn new(capacity: u32, leak_interval: Duration) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::invalid("capacity", "must be > 0"));
        }
        if leak_interval.is_zero() {
            return Err(ConfigError::invalid("leak_interval", "must be > 0"));
        }

        info!(capacity, leak_interval = ?leak_interval, "Initialized leaky bucket");

        Ok(Self {
            capacity,
            leak_interval,
            state: Mutex::new(Level {
                water: 0.0,
                last_leak: Instant::now(),
            }),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn leak_interval(&self) -> Duration {
        self.leak_interval
    }

    /// Requests still draining, rounded up.
    pub fn level(&self) -> u32 {
        let mut level = self.lock();
        self.leak(&mut level);
        level.water.ceil() as u32
    }

    pub fn try_acquire(&self) -> Result<(), RateLimited> {
        let mut level = self.lock();
        self.leak(&mut level);

        let overflow = level.water + 1.0 - f64::from(self.capacity);
        if overflow <= 0.0 {
            level.water += 1.0;
            return Ok(());
        }

        let retry_after = saturating_secs(overflow * self.leak_interval.as_secs_f64());
        debug!(level = level.water, retry_after = ?retry_after, "Rate limited");
        Err(RateLimited { retry_after })
    }

    /// Wait until the bucket has room and take it.
    pub async fn acquire(&self) {
        super::acquire(self).await;
    }

    fn leak(&self, level: &mut Level) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(level.last_leak);
        let drained = elapsed.as_secs_f64() / self.leak_interval.as_secs_f64();
        level.water = (level.water - drained).max(0.0);
        level.last_leak = now;
    }

    fn lock(&self) -> MutexGuard<'_, Level> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RateLimiter for LeakyBucket {
    fn try_acquire(&self) -> Result<(), RateLimited> {
        LeakyBucket::try_acquire(self)
    }
}
