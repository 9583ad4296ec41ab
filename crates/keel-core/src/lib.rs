//! keel-core
//!
//! In-process concurrency building blocks.
//!
//! # モジュール構成
//! - **queue**: FIFO work queue（bounded / unbounded, block / reject）
//! - **promise**: 一度だけ確定する結果セル（Promise / TaskFuture, cancel）
//! - **app**: TaskExecutor（1 queue + 1 worker の Active Object）と builder
//! - **breaker**: CircuitBreaker（Closed / Open / HalfOpen）
//! - **limiter**: TokenBucket / LeakyBucket / SlidingWindow（共通の `RateLimiter` trait）
//! - **domain**: ID, 状態, イベント
//! - **ports** / **impls**: EventSink, IdGenerator とその実装
//! - **config** / **error**: 設定と thiserror ベースのエラー型
//!
//! ```ignore
//! let executor = TaskExecutor::new(ExecutorConfig::named("orders"))?;
//! let breaker = Arc::new(CircuitBreaker::new("inventory", BreakerConfig::default())?);
//!
//! let future = submit_guarded(&executor, breaker, || async { reserve(42).await }).await?;
//! let reserved = future.get(Duration::from_secs(1)).await?;
//! ```

pub mod app;
pub mod breaker;
pub mod config;
pub mod domain;
pub mod error;
pub mod impls;
pub mod limiter;
pub mod ports;
pub mod promise;
pub mod queue;

pub use app::{BuildError, ExecutorBuilder, TaskExecutor, submit_guarded};
pub use breaker::{BreakerSnapshot, CircuitBreaker};
pub use config::{BreakerConfig, ExecutorConfig, FailureRateRule, OverflowPolicy, Settings};
pub use domain::{CircuitState, ExecutorState, OperationId, StateTransition};
pub use error::{
    AlreadyCompleted, BreakerError, CircuitOpen, ConfigError, RateLimited, SubmitError,
    TaskError, WaitError,
};
pub use limiter::{LeakyBucket, RateLimiter, SlidingWindow, TokenBucket};
pub use promise::{CancelFlag, CancelOutcome, Promise, TaskFuture};
pub use queue::WorkQueue;
