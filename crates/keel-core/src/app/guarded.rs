//! Breaker in front of an executor.
//!
//! The operation is queued on the executor like any other; when the worker
//! reaches it, the call goes through the breaker. A rejection by an open
//! circuit therefore costs one queue slot but never touches the dependency.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;

use crate::breaker::CircuitBreaker;
use crate::error::SubmitError;
use crate::promise::TaskFuture;

use super::executor::TaskExecutor;

/// Submit `op` to `executor`, guarded by `breaker`.
///
/// The future resolves with the operation's value, or rejects with
/// `TaskError::Failed` carrying a `BreakerError<E>`. Use
/// `TaskError::is_circuit_open` or `downcast_ref::<BreakerError<E>>()` to
/// tell the cases apart.
pub async fn submit_guarded<F, Fut, T, E>(
    executor: &TaskExecutor,
    breaker: Arc<CircuitBreaker>,
    op: F,
) -> Result<TaskFuture<T>, SubmitError>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: StdError + Send + Sync + 'static,
{
    executor
        .submit(move || async move { breaker.execute(op).await })
        .await
}
