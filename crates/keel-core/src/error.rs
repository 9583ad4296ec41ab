//! Errors - submit / 実行 / 待機 / breaker / limiter / 設定のエラー型

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Boxed, shareable operation error. Kept behind `Arc` so every reader of a
/// future sees the same error value.
pub type OperationError = Arc<dyn StdError + Send + Sync + 'static>;

/// Submission was refused. Always returned synchronously to the submitter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("executor is not accepting work")]
    Stopped,

    #[error("work queue is full (capacity={capacity})")]
    QueueFull { capacity: usize },
}

/// Why a future was rejected.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    /// The operation returned an error. The original error is kept as-is.
    #[error("operation failed: {0}")]
    Failed(OperationError),

    #[error("operation panicked: {0}")]
    Panicked(String),

    #[error("operation exceeded its deadline of {0:?}")]
    DeadlineExceeded(Duration),

    #[error("operation was cancelled before it started")]
    Cancelled,

    #[error("executor shut down before the operation ran")]
    ExecutorShutdown,
}

impl TaskError {
    pub fn failed<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        TaskError::Failed(Arc::new(error))
    }

    /// Borrow the operation error as its concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match self {
            TaskError::Failed(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }

    /// The call never reached the dependency because a breaker was open.
    ///
    /// Looks through the source chain, so a `BreakerError::Open` carried
    /// inside `Failed` counts too.
    pub fn is_circuit_open(&self) -> bool {
        let TaskError::Failed(inner) = self else {
            return false;
        };
        let mut current: Option<&(dyn StdError + 'static)> = Some(inner.as_ref());
        while let Some(err) = current {
            if err.is::<CircuitOpen>() {
                return true;
            }
            current = err.source();
        }
        false
    }
}

/// `Future::get` did not see a settlement in time, or saw a rejection.
#[derive(Debug, Clone, Error)]
pub enum WaitError {
    #[error("no result within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Task(#[from] TaskError),
}

impl WaitError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WaitError::Timeout(_))
    }

    pub fn task_error(&self) -> Option<&TaskError> {
        match self {
            WaitError::Task(err) => Some(err),
            WaitError::Timeout(_) => None,
        }
    }
}

/// A promise was settled twice. Local precondition failure, never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("future was already completed")]
pub struct AlreadyCompleted;

/// Rejection by an open breaker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker '{breaker}' is open (next probe in {retry_in:?})")]
pub struct CircuitOpen {
    pub breaker: String,
    pub retry_in: Duration,
}

/// Result of a call guarded by a `CircuitBreaker`.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("{0}")]
    Open(#[source] CircuitOpen),

    #[error("operation exceeded breaker timeout of {0:?}")]
    Timeout(Duration),

    #[error("operation failed: {0}")]
    Failure(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open(_))
    }

    pub fn into_failure(self) -> Option<E> {
        match self {
            BreakerError::Failure(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> BreakerError<E>
where
    E: StdError + Send + Sync + 'static,
{
    /// Flatten into a future rejection: dependency errors stay verbatim,
    /// an open circuit becomes a `CircuitOpen` failure, a breaker timeout
    /// becomes `DeadlineExceeded`.
    pub fn into_task_error(self) -> TaskError {
        match self {
            BreakerError::Open(open) => TaskError::failed(open),
            BreakerError::Timeout(limit) => TaskError::DeadlineExceeded(limit),
            BreakerError::Failure(e) => TaskError::failed(e),
        }
    }
}

/// A rate limiter refused the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limited (retry after {retry_after:?})")]
pub struct RateLimited {
    pub retry_after: Duration,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("failed to read settings: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}
