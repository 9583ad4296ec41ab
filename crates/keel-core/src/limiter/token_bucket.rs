//! Token bucket.
//!
//! Starts full. Tokens refill continuously at `refill_per_second`, capped at
//! `capacity`. Typically checked before submitting to an executor so bursts
//! are shed at the door instead of piling up in the queue.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{ConfigError, RateLimited};

use super::{RateLimiter, saturating_secs};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    capacity: u32,
    refill_per_second: f64,
    state: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_second: f64) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::invalid("capacity", "must be > 0"));
        }
        if !(refill_per_second.is_finite() && refill_per_second > 0.0) {
            return Err(ConfigError::invalid(
                "refill_per_second",
                format!("must be a positive number, got {refill_per_second}"),
            ));
        }

        info!(capacity, refill_per_second, "Initialized token bucket");

        Ok(Self {
            capacity,
            refill_per_second,
            state: Mutex::new(Bucket {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }

    /// Whole tokens available right now.
    pub fn available(&self) -> u32 {
        let mut bucket = self.lock();
        self.refill(&mut bucket);
        bucket.tokens.floor() as u32
    }

    pub fn try_acquire(&self) -> Result<(), RateLimited> {
        self.try_acquire_n(1)
    }

    /// Take `n` tokens at once, or none.
    ///
    /// A request larger than the capacity can never succeed and reports
    /// `Duration::MAX`.
    pub fn try_acquire_n(&self, n: u32) -> Result<(), RateLimited> {
        if n > self.capacity {
            return Err(RateLimited {
                retry_after: Duration::MAX,
            });
        }

        let mut bucket = self.lock();
        self.refill(&mut bucket);

        let wanted = f64::from(n);
        if bucket.tokens >= wanted {
            bucket.tokens -= wanted;
            return Ok(());
        }

        let missing = wanted - bucket.tokens;
        let retry_after = saturating_secs(missing / self.refill_per_second);
        debug!(requested = n, retry_after = ?retry_after, "Rate limited");
        Err(RateLimited { retry_after })
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        super::acquire(self).await;
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_per_second)
            .min(f64::from(self.capacity));
        bucket.last_refill = now;
    }

    fn lock(&self) -> MutexGuard<'_, Bucket> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RateLimiter for TokenBucket {
    fn try_acquire(&self) -> Result<(), RateLimited> {
        TokenBucket::try_acquire(self)
    }
}
