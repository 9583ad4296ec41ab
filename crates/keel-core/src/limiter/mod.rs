//! Limiter - executor の手前で流量を絞る
//!
//! # 学習ポイント
//! - 3 種類のアルゴリズムを同じ `RateLimited { retry_after }` で返す
//! - 時刻は `tokio::time::Instant`（テストで `start_paused` が効く）
//! - `retry_after` が `Duration` に収まらない場合は `Duration::MAX` に丸める
//!
//! | 型 | 許可の条件 | バースト |
//! |----|-----------|---------|
//! | `TokenBucket` | トークンが残っている（連続補充） | capacity まで |
//! | `LeakyBucket` | 水位 + 1 が capacity 以下（一定速度で排出） | capacity まで |
//! | `SlidingWindow` | 直近 `window` 内の許可数が上限未満 | 上限まで |
//!
//! ```ignore
//! let limiter = SlidingWindow::new(100, Duration::from_secs(60))?;
//! limiter.try_acquire()?;     // Err(RateLimited { retry_after })
//! limiter::acquire(&limiter).await;
//! ```

mod leaky_bucket;
mod sliding_window;
mod token_bucket;

use std::time::Duration;

use crate::error::RateLimited;

pub use leaky_bucket::LeakyBucket;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

/// Non-blocking admission check shared by every limiter.
pub trait RateLimiter: Send + Sync {
    fn try_acquire(&self) -> Result<(), RateLimited>;
}

/// Wait until `limiter` admits one request.
pub async fn acquire<L: RateLimiter + ?Sized>(limiter: &L) {
    while let Err(limited) = limiter.try_acquire() {
        // The hint is exact up to float rounding; the floor keeps a rounding
        // miss from spinning.
        tokio::time::sleep(limited.retry_after.max(Duration::from_millis(1))).await;
    }
}

/// Seconds to a `Duration`, saturating instead of panicking.
pub(crate) fn saturating_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
