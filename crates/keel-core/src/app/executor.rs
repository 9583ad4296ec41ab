//! TaskExecutor - Active Object
//!
//! 1 executor = 1 queue + 1 worker。submit した順に 1 件ずつ実行し、
//! 呼び出し側にはすぐに `TaskFuture` を返します。
//!
//! # Lifecycle
//! `Running → Draining → Stopped`
//! - `shutdown(true)`: queue を閉じ、残りを実行してから停止
//! - `shutdown(false)`: queue を閉じ、未開始の operation は `ExecutorShutdown` で reject
//! - drop: `shutdown(true)` と同じ

use std::error::Error as StdError;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::config::{ExecutorConfig, OverflowPolicy};
use crate::domain::{
    Event, ExecutorId, ExecutorState, OperationId, OperationOutcome, OperationRecord,
};
use crate::error::{SubmitError, TaskError};
use crate::impls::SinkSet;
use crate::ports::{EventSink, IdGenerator};
use crate::promise::{self, CancelFlag, Settle, TaskFuture, Withdraw};
use crate::queue::{PushError, WorkQueue};

use super::builder::ExecutorBuilder;

type RunFuture = Pin<Box<dyn Future<Output = Result<(), TaskError>> + Send>>;
type RunFn = Box<dyn FnOnce(CancelFlag) -> RunFuture + Send>;

/// A queued operation with its result type erased.
///
/// `run` resolves the promise itself on success; any `Err` it returns is
/// applied by the worker through `settle`. A job dropped while still armed
/// rejects its future with `ExecutorShutdown`, so no future is left pending
/// when the queue is discarded or the runtime goes away.
pub(crate) struct Job {
    pub(crate) id: OperationId,
    pub(crate) enqueued_at: DateTime<Utc>,
    pub(crate) settle: Box<dyn Settle>,
    run: Option<RunFn>,
}

impl Job {
    /// Take the body out. After this the job no longer rejects on drop.
    pub(crate) fn take_run(&mut self) -> Option<RunFn> {
        self.run.take()
    }

    fn disarm(&mut self) {
        self.run = None;
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        if self.run.is_some() && self.settle.reject(TaskError::ExecutorShutdown).is_ok() {
            debug!(operation_id = %self.id, "Rejected operation that never ran");
        }
    }
}

/// State shared by the executor handle, its worker and outstanding futures.
pub(crate) struct Core {
    pub(crate) id: ExecutorId,
    pub(crate) config: ExecutorConfig,
    pub(crate) queue: WorkQueue<Job>,
    pub(crate) sinks: SinkSet,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) state: watch::Sender<ExecutorState>,
}

impl Core {
    pub(crate) fn record(
        &self,
        job: &Job,
        started_at: Option<DateTime<Utc>>,
        outcome: OperationOutcome,
    ) {
        self.sinks.emit(&Event::Operation(OperationRecord {
            operation_id: job.id,
            executor: self.config.name.clone(),
            enqueued_at: job.enqueued_at,
            started_at,
            completed_at: Utc::now(),
            outcome,
        }));
    }
}

impl Withdraw for Core {
    fn withdraw(&self, id: OperationId) -> bool {
        let Some(mut job) = self.queue.remove_first(|job| job.id == id) else {
            return false;
        };
        // The caller settles the future with `Cancelled`.
        job.disarm();
        debug!(executor = %self.config.name, operation_id = %id, "Withdrew queued operation");
        self.record(&job, None, OperationOutcome::Cancelled);
        true
    }
}

/// Serial executor handle.
///
/// Share it with `Arc<TaskExecutor>`; dropping the last handle drains and
/// stops the worker.
pub struct TaskExecutor {
    core: Arc<Core>,
}

impl TaskExecutor {
    /// Build and start an executor. Must be called inside a Tokio runtime.
    pub fn new(config: ExecutorConfig) -> Result<Self, super::BuildError> {
        ExecutorBuilder::new(config).build()
    }

    pub fn builder(config: ExecutorConfig) -> ExecutorBuilder {
        ExecutorBuilder::new(config)
    }

    pub(crate) fn from_core(core: Arc<Core>) -> Self {
        Self { core }
    }

    pub fn id(&self) -> ExecutorId {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.config.name
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.core.config
    }

    pub fn state(&self) -> ExecutorState {
        *self.core.state.borrow()
    }

    /// Operations queued and not yet started.
    pub fn pending(&self) -> usize {
        self.core.queue.len()
    }

    /// Enqueue `op`. Returns as soon as it is queued; never waits for it to run.
    ///
    /// With `OverflowPolicy::Block` this waits for queue space when the queue
    /// is bounded and full; with `Reject` it fails with `QueueFull`.
    pub async fn submit<F, Fut, T, E>(&self, op: F) -> Result<TaskFuture<T>, SubmitError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        self.submit_cancellable(move |_cancel| op()).await
    }

    /// Enqueue without waiting; `QueueFull` when at capacity regardless of
    /// the overflow policy.
    pub fn try_submit<F, Fut, T, E>(&self, op: F) -> Result<TaskFuture<T>, SubmitError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        self.try_submit_cancellable(move |_cancel| op())
    }

    /// Like `submit`, but `op` receives the future's cancel flag.
    pub async fn submit_cancellable<F, Fut, T, E>(
        &self,
        op: F,
    ) -> Result<TaskFuture<T>, SubmitError>
    where
        F: FnOnce(CancelFlag) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let (job, future) = self.prepare(op);
        let pushed = match self.core.config.overflow {
            OverflowPolicy::Block => self.core.queue.push(job).await,
            OverflowPolicy::Reject => self.core.queue.try_push(job),
        };
        self.finish_submit(pushed, future)
    }

    /// Like `try_submit`, but `op` receives the future's cancel flag.
    pub fn try_submit_cancellable<F, Fut, T, E>(
        &self,
        op: F,
    ) -> Result<TaskFuture<T>, SubmitError>
    where
        F: FnOnce(CancelFlag) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        self.ensure_running()?;
        let (job, future) = self.prepare(op);
        let pushed = self.core.queue.try_push(job);
        self.finish_submit(pushed, future)
    }

    /// Stop accepting work and close the queue.
    ///
    /// With `drain = false`, operations that have not started are discarded
    /// and their futures rejected with `ExecutorShutdown`. The running
    /// operation (if any) is never interrupted. Safe to call more than once.
    pub fn shutdown(&self, drain: bool) {
        let began = self.core.state.send_if_modified(|state| {
            if *state == ExecutorState::Running {
                *state = ExecutorState::Draining;
                true
            } else {
                false
            }
        });
        self.core.queue.close();

        let discarded = if drain { Vec::new() } else { self.core.queue.drain() };
        let count = discarded.len();
        for job in discarded {
            self.core.record(&job, None, OperationOutcome::Discarded);
            // Dropping the armed job rejects its future.
            drop(job);
        }

        if began || count > 0 {
            info!(
                executor = %self.core.config.name,
                drain,
                discarded = count,
                "Executor shutting down"
            );
        }
    }

    /// Wait until the worker has exited. `false` if `timeout` elapsed first.
    pub async fn await_shutdown(&self, timeout: Duration) -> bool {
        let mut rx = self.core.state.subscribe();
        let stopped = tokio::time::timeout(timeout, async move {
            rx.wait_for(|state| state.is_terminal()).await.is_ok()
        })
        .await;
        matches!(stopped, Ok(true))
    }

    fn ensure_running(&self) -> Result<(), SubmitError> {
        if self.state().accepts_work() {
            Ok(())
        } else {
            Err(SubmitError::Stopped)
        }
    }

    fn prepare<F, Fut, T, E>(&self, op: F) -> (Job, TaskFuture<T>)
    where
        F: FnOnce(CancelFlag) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let (promise, future) = promise::channel::<T>();
        let id = self.core.ids.operation_id();

        let resolver = promise.clone();
        let run: RunFn = Box::new(move |cancel| {
            Box::pin(async move {
                let value = op(cancel).await.map_err(TaskError::failed)?;
                if resolver.resolve(value).is_err() {
                    debug!(operation_id = %id, "Result dropped, future already completed");
                }
                Ok(())
            })
        });

        let job = Job {
            id,
            enqueued_at: Utc::now(),
            settle: Box::new(promise),
            run: Some(run),
        };
        let withdraw: Weak<dyn Withdraw> = Arc::downgrade(&self.core) as Weak<dyn Withdraw>;
        (job, future.attach(id, withdraw))
    }

    fn finish_submit<T>(
        &self,
        pushed: Result<(), PushError<Job>>,
        future: TaskFuture<T>,
    ) -> Result<TaskFuture<T>, SubmitError> {
        match pushed {
            Ok(()) => {
                debug!(
                    executor = %self.core.config.name,
                    operation_id = ?future.id(),
                    "Operation queued"
                );
                Ok(future)
            }
            Err(err) => {
                let full = err.is_full();
                // The caller never sees this future; do not settle it.
                err.into_inner().disarm();
                if full {
                    Err(SubmitError::QueueFull {
                        capacity: self.core.config.queue_capacity,
                    })
                } else {
                    Err(SubmitError::Stopped)
                }
            }
        }
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        if self.state().accepts_work() {
            self.shutdown(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::MemorySink;
    use crate::promise::CancelOutcome;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[derive(Debug, thiserror::Error)]
    #[error("boom: {0}")]
    struct Boom(&'static str);

    type Never = std::convert::Infallible;

    fn executor(config: ExecutorConfig) -> TaskExecutor {
        TaskExecutor::new(config).unwrap()
    }

    /// Occupies the worker until the returned sender fires.
    async fn block_worker(exec: &TaskExecutor) -> (oneshot::Sender<()>, TaskFuture<()>) {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let future = exec
            .submit(move || async move {
                started_tx.send(()).ok();
                release_rx.await.ok();
                Ok::<_, Never>(())
            })
            .await
            .unwrap();
        started_rx.await.unwrap();
        (release_tx, future)
    }

    #[tokio::test]
    async fn runs_in_submission_order() {
        let exec = executor(ExecutorConfig::named("fifo"));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let mut futures = Vec::new();
        for i in 0..20 {
            let seen = Arc::clone(&seen);
            futures.push(
                exec.submit(move || async move {
                    seen.lock().unwrap().push(i);
                    Ok::<_, Never>(i)
                })
                .await
                .unwrap(),
            );
        }

        for (i, f) in futures.into_iter().enumerate() {
            assert_eq!(f.wait().await.unwrap(), i);
        }
        assert_eq!(*seen.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_runs_two_operations_at_once() {
        let exec = Arc::new(executor(ExecutorConfig::named("serial")));
        let running = Arc::new(AtomicUsize::new(0));
        let overlap = Arc::new(AtomicBool::new(false));

        let mut futures = Vec::new();
        for _ in 0..50 {
            let running = Arc::clone(&running);
            let overlap = Arc::clone(&overlap);
            futures.push(
                exec.submit(move || async move {
                    if running.fetch_add(1, Ordering::SeqCst) > 0 {
                        overlap.store(true, Ordering::SeqCst);
                    }
                    tokio::task::yield_now().await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, Never>(())
                })
                .await
                .unwrap(),
            );
        }
        for f in futures {
            f.wait().await.unwrap();
        }

        assert!(!overlap.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn operation_error_is_kept_verbatim() {
        let exec = executor(ExecutorConfig::named("errors"));
        let future = exec
            .submit(|| async { Err::<(), _>(Boom("inventory")) })
            .await
            .unwrap();

        let err = future.wait().await.unwrap_err();
        assert_eq!(err.downcast_ref::<Boom>().map(|b| b.0), Some("inventory"));
    }

    #[tokio::test]
    async fn panic_rejects_future_and_worker_survives() {
        let exec = executor(ExecutorConfig::named("panics"));
        let bad = exec
            .submit(|| async {
                if true {
                    panic!("kaboom");
                }
                Ok::<u8, Never>(0)
            })
            .await
            .unwrap();
        let good = exec.submit(|| async { Ok::<_, Never>(2u8) }).await.unwrap();

        assert!(matches!(
            bad.wait().await,
            Err(TaskError::Panicked(msg)) if msg.contains("kaboom")
        ));
        assert_eq!(good.wait().await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_aborts_slow_operation() {
        let config =
            ExecutorConfig::named("deadline").with_operation_timeout(Duration::from_millis(50));
        let exec = executor(config);

        let slow = exec
            .submit(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, Never>(())
            })
            .await
            .unwrap();
        let next = exec.submit(|| async { Ok::<_, Never>(1) }).await.unwrap();

        assert!(matches!(
            slow.wait().await,
            Err(TaskError::DeadlineExceeded(d)) if d == Duration::from_millis(50)
        ));
        assert_eq!(next.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn reject_policy_fails_fast_when_full() {
        let config = ExecutorConfig::named("bounded").with_capacity(1, OverflowPolicy::Reject);
        let exec = executor(config);
        let (release, running) = block_worker(&exec).await;

        let queued = exec.submit(|| async { Ok::<_, Never>(1) }).await.unwrap();
        let err = exec
            .submit(|| async { Ok::<_, Never>(2) })
            .await
            .unwrap_err();
        assert_eq!(err, SubmitError::QueueFull { capacity: 1 });

        release.send(()).unwrap();
        running.wait().await.unwrap();
        assert_eq!(queued.wait().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn block_policy_waits_for_space() {
        let config = ExecutorConfig::named("blocking").with_capacity(1, OverflowPolicy::Block);
        let exec = Arc::new(executor(config));
        let (release, _running) = block_worker(&exec).await;
        exec.try_submit(|| async { Ok::<_, Never>(1) }).unwrap();

        assert!(matches!(
            exec.try_submit(|| async { Ok::<_, Never>(0) }),
            Err(SubmitError::QueueFull { .. })
        ));

        let waiting = tokio::spawn({
            let exec = Arc::clone(&exec);
            async move { exec.submit(|| async { Ok::<_, Never>(2) }).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        release.send(()).unwrap();
        let future = waiting.await.unwrap().unwrap();
        assert_eq!(future.wait().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cancel_withdraws_queued_operation() {
        let sink = Arc::new(MemorySink::new());
        let exec = TaskExecutor::builder(ExecutorConfig::named("cancel"))
            .with_sink(sink.clone())
            .build()
            .unwrap();
        let (release, _running) = block_worker(&exec).await;

        let ran = Arc::new(AtomicBool::new(false));
        let queued = exec
            .submit({
                let ran = Arc::clone(&ran);
                move || async move {
                    ran.store(true, Ordering::SeqCst);
                    Ok::<_, Never>(())
                }
            })
            .await
            .unwrap();

        assert_eq!(queued.cancel(), CancelOutcome::Withdrawn);
        assert_eq!(exec.pending(), 0);
        assert!(matches!(queued.wait().await, Err(TaskError::Cancelled)));

        release.send(()).unwrap();
        exec.shutdown(true);
        assert!(exec.await_shutdown(Duration::from_secs(1)).await);
        assert!(!ran.load(Ordering::SeqCst));
        assert!(
            sink.operations()
                .iter()
                .any(|r| r.outcome == OperationOutcome::Cancelled && r.started_at.is_none())
        );
    }

    #[tokio::test]
    async fn cancel_signals_running_operation() {
        let exec = executor(ExecutorConfig::named("signal"));
        let (started_tx, started_rx) = oneshot::channel::<()>();

        let future = exec
            .submit_cancellable(move |cancel| async move {
                started_tx.send(()).ok();
                while !cancel.is_cancelled() {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Err::<(), _>(Boom("stopped early"))
            })
            .await
            .unwrap();
        started_rx.await.unwrap();

        assert_eq!(future.cancel(), CancelOutcome::Signalled);
        let err = future.wait().await.unwrap_err();
        assert!(err.downcast_ref::<Boom>().is_some());
        assert_eq!(future.cancel(), CancelOutcome::AlreadyCompleted);
    }

    #[tokio::test]
    async fn drain_shutdown_runs_everything_queued() {
        let exec = executor(ExecutorConfig::named("drain"));
        let (release, _running) = block_worker(&exec).await;
        let queued: Vec<_> = (0..3)
            .map(|i| exec.try_submit(move || async move { Ok::<_, Never>(i) }).unwrap())
            .collect();

        exec.shutdown(true);
        assert_eq!(exec.state(), ExecutorState::Draining);
        assert_eq!(
            exec.try_submit(|| async { Ok::<_, Never>(9) }).unwrap_err(),
            SubmitError::Stopped
        );

        release.send(()).unwrap();
        assert!(exec.await_shutdown(Duration::from_secs(1)).await);
        assert_eq!(exec.state(), ExecutorState::Stopped);
        for (i, f) in queued.into_iter().enumerate() {
            assert_eq!(f.wait().await.unwrap(), i);
        }
    }

    #[tokio::test]
    async fn non_drain_shutdown_rejects_queued() {
        let exec = executor(ExecutorConfig::named("discard"));
        let (release, running) = block_worker(&exec).await;
        let queued = exec.try_submit(|| async { Ok::<_, Never>(1) }).unwrap();

        exec.shutdown(false);
        exec.shutdown(false);

        assert!(matches!(queued.wait().await, Err(TaskError::ExecutorShutdown)));
        release.send(()).unwrap();
        running.wait().await.unwrap();
        assert!(exec.await_shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn await_shutdown_times_out_while_busy() {
        let exec = executor(ExecutorConfig::named("busy"));
        let (release, _running) = block_worker(&exec).await;

        exec.shutdown(true);
        assert!(!exec.await_shutdown(Duration::from_millis(20)).await);

        release.send(()).unwrap();
        assert!(exec.await_shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn records_operation_outcomes() {
        let sink = Arc::new(MemorySink::new());
        let exec = TaskExecutor::builder(ExecutorConfig::named("records"))
            .with_sink(sink.clone())
            .build()
            .unwrap();

        exec.submit(|| async { Ok::<_, Never>(()) })
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        exec.submit(|| async { Err::<(), _>(Boom("x")) })
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        exec.shutdown(true);
        assert!(exec.await_shutdown(Duration::from_secs(1)).await);

        let outcomes: Vec<_> = sink.operations().into_iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                OperationOutcome::Succeeded,
                OperationOutcome::Failed("boom: x".into()),
            ]
        );
        assert!(sink.events().iter().any(|e| matches!(
            e,
            Event::ExecutorStopped { name, .. } if name == "records"
        )));
    }

    #[tokio::test]
    async fn dropping_executor_drains_queue() {
        let exec = executor(ExecutorConfig::named("dropped"));
        let future = exec
            .submit(|| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, Never>("done")
            })
            .await
            .unwrap();

        drop(exec);
        assert_eq!(future.wait().await.unwrap(), "done");
    }
}
