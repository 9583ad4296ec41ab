//! WorkerLoop - executor の唯一の consumer
//!
//! # フロー
//! 1. `WorkQueue::pop()` で次の operation を取得（閉じられて空なら終了）
//! 2. 開始前に cancel 済みなら `Cancelled` で reject
//! 3. 専用 task に spawn して await（panic / deadline をここで捕捉）
//! 4. future を settle し、`OperationRecord` を sink に流す
//!
//! 1 件ずつ await するので、同じ executor で 2 件が同時に走ることはありません。

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::domain::{Event, ExecutorState, OperationOutcome};
use crate::error::TaskError;
use crate::ports::EventSink;

use super::executor::{Core, Job};

pub(crate) async fn worker_loop(core: Arc<Core>) {
    info!(executor = %core.config.name, id = %core.id, "Worker started");

    while let Some(job) = core.queue.pop().await {
        run_job(&core, job).await;
    }

    core.sinks.emit(&Event::ExecutorStopped {
        executor: core.id,
        name: core.config.name.clone(),
    });
    core.state.send_replace(ExecutorState::Stopped);
    info!(executor = %core.config.name, "Worker stopped");
}

async fn run_job(core: &Core, mut job: Job) {
    let Some(run) = job.take_run() else {
        return;
    };

    let cancel = job.settle.cancel_flag();
    if cancel.is_cancelled() {
        if job.settle.reject(TaskError::Cancelled).is_ok() {
            debug!(operation_id = %job.id, "Skipped operation cancelled before start");
        }
        core.record(&job, None, OperationOutcome::Cancelled);
        return;
    }

    let started_at = Utc::now();
    debug!(executor = %core.config.name, operation_id = %job.id, "Operation started");

    // The body runs on its own task: a panic surfaces as a JoinError instead
    // of unwinding through the worker, and a deadline can abort it.
    let mut handle = tokio::spawn(run(cancel));
    let joined = match core.config.operation_timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
            Ok(joined) => joined,
            Err(_elapsed) => {
                let joined = abort_after_deadline(handle, limit).await;
                if let Ok(Err(TaskError::DeadlineExceeded(_))) = joined {
                    warn!(
                        executor = %core.config.name,
                        operation_id = %job.id,
                        limit = ?limit,
                        "Operation exceeded deadline, aborted"
                    );
                }
                joined
            }
        },
        None => handle.await,
    };

    let result = joined.unwrap_or_else(|join_err| Err(join_error(core, &job, join_err)));

    let outcome = match result {
        Ok(()) => OperationOutcome::Succeeded,
        Err(err) => {
            let outcome = outcome_of(&err);
            if job.settle.reject(err).is_err() {
                debug!(operation_id = %job.id, "Rejection dropped, future already completed");
            }
            outcome
        }
    };
    core.record(&job, Some(started_at), outcome);
}

/// Abort a body that overran `limit` and wait for the abort to land, so the
/// next operation never overlaps with it. A body that finished before the
/// abort keeps its own result.
async fn abort_after_deadline(
    handle: JoinHandle<Result<(), TaskError>>,
    limit: Duration,
) -> Result<Result<(), TaskError>, JoinError> {
    handle.abort();
    match handle.await {
        Err(err) if err.is_cancelled() => Ok(Err(TaskError::DeadlineExceeded(limit))),
        finished => finished,
    }
}

fn join_error(core: &Core, job: &Job, err: JoinError) -> TaskError {
    if err.is_panic() {
        let message = panic_message(err.into_panic());
        error!(
            executor = %core.config.name,
            operation_id = %job.id,
            panic = %message,
            "Operation panicked"
        );
        TaskError::Panicked(message)
    } else {
        // Cancelled from outside, i.e. the runtime is shutting down.
        TaskError::ExecutorShutdown
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn outcome_of(err: &TaskError) -> OperationOutcome {
    match err {
        TaskError::Failed(inner) => OperationOutcome::Failed(inner.to_string()),
        TaskError::Panicked(message) => OperationOutcome::Panicked(message.clone()),
        TaskError::DeadlineExceeded(_) => OperationOutcome::DeadlineExceeded,
        TaskError::Cancelled => OperationOutcome::Cancelled,
        TaskError::ExecutorShutdown => OperationOutcome::Discarded,
    }
}
