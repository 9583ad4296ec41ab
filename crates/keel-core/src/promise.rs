//! Promise / TaskFuture - 一度だけ確定する結果セル
//!
//! - `Promise<T>`: 書き込み側（executor の worker が resolve / reject する）
//! - `TaskFuture<T>`: 読み取り側（submitter が get / wait / cancel する）
//!
//! Both handles point at the same cell. The first settlement wins; any later
//! attempt returns `AlreadyCompleted`.

use std::fmt;
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::Notify;

use crate::domain::OperationId;
use crate::error::{AlreadyCompleted, TaskError, WaitError};

/// Cooperative cancellation signal handed to cancellable operations.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// What `TaskFuture::cancel` managed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Never started; removed and rejected with `TaskError::Cancelled`.
    Withdrawn,
    /// Possibly running; the cancel flag was raised.
    Signalled,
    /// Already settled; nothing changed.
    AlreadyCompleted,
}

enum Slot<T> {
    Pending,
    Resolved(T),
    Rejected(TaskError),
}

struct Shared<T> {
    slot: Mutex<Slot<T>>,
    settled: Notify,
    cancel: CancelFlag,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, outcome: Slot<T>) -> Result<(), AlreadyCompleted> {
        {
            let mut slot = self.lock();
            if !matches!(*slot, Slot::Pending) {
                return Err(AlreadyCompleted);
            }
            *slot = outcome;
        }
        self.settled.notify_waiters();
        Ok(())
    }

    fn is_completed(&self) -> bool {
        !matches!(*self.lock(), Slot::Pending)
    }
}

/// Queue-side hook used by `TaskFuture::cancel` to pull a not-yet-started
/// operation out of its executor.
pub(crate) trait Withdraw: Send + Sync {
    fn withdraw(&self, id: OperationId) -> bool;
}

/// Type-erased writer used by the worker, which does not know `T`.
pub(crate) trait Settle: Send + Sync {
    fn reject(&self, error: TaskError) -> Result<(), AlreadyCompleted>;
    fn is_completed(&self) -> bool;
    fn cancel_flag(&self) -> CancelFlag;
}

/// Writer side of a result cell.
pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Promise<T> {
    pub fn resolve(&self, value: T) -> Result<(), AlreadyCompleted> {
        self.shared.settle(Slot::Resolved(value))
    }

    pub fn reject(&self, error: TaskError) -> Result<(), AlreadyCompleted> {
        self.shared.settle(Slot::Rejected(error))
    }

    pub fn is_completed(&self) -> bool {
        self.shared.is_completed()
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.shared.cancel.clone()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("completed", &self.is_completed())
            .finish()
    }
}

impl<T: Send> Settle for Promise<T> {
    fn reject(&self, error: TaskError) -> Result<(), AlreadyCompleted> {
        Promise::reject(self, error)
    }

    fn is_completed(&self) -> bool {
        Promise::is_completed(self)
    }

    fn cancel_flag(&self) -> CancelFlag {
        Promise::cancel_flag(self)
    }
}

/// Reader side of a result cell.
///
/// Cloning gives another reader; every reader observes the same value or
/// error.
pub struct TaskFuture<T> {
    shared: Arc<Shared<T>>,
    id: Option<OperationId>,
    queue: Option<Weak<dyn Withdraw>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            id: self.id,
            queue: self.queue.clone(),
        }
    }
}

impl<T> fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture")
            .field("id", &self.id)
            .field("completed", &self.is_completed())
            .field("cancel_requested", &self.is_cancel_requested())
            .finish()
    }
}

/// Create a standalone promise / future pair.
pub fn channel<T>() -> (Promise<T>, TaskFuture<T>) {
    let shared = Arc::new(Shared {
        slot: Mutex::new(Slot::Pending),
        settled: Notify::new(),
        cancel: CancelFlag::new(),
    });
    let promise = Promise {
        shared: Arc::clone(&shared),
    };
    let future = TaskFuture {
        shared,
        id: None,
        queue: None,
    };
    (promise, future)
}

impl<T> TaskFuture<T> {
    /// Bind this future to the queued operation it represents.
    pub(crate) fn attach(mut self, id: OperationId, queue: Weak<dyn Withdraw>) -> Self {
        self.id = Some(id);
        self.queue = Some(queue);
        self
    }

    /// Id of the operation, when submitted through an executor.
    pub fn id(&self) -> Option<OperationId> {
        self.id
    }

    /// Non-blocking poll.
    pub fn is_completed(&self) -> bool {
        self.shared.is_completed()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Cancel the operation.
    ///
    /// Queued operations are withdrawn and rejected with
    /// `TaskError::Cancelled`. A running operation only gets its cancel flag
    /// raised; whether it stops early is up to the operation.
    pub fn cancel(&self) -> CancelOutcome {
        if self.is_completed() {
            return CancelOutcome::AlreadyCompleted;
        }
        self.shared.cancel.raise();

        let withdrawn = match (self.id, &self.queue) {
            (Some(id), Some(queue)) => queue.upgrade().is_some_and(|q| q.withdraw(id)),
            // Standalone: nothing is executing on our behalf.
            _ => true,
        };
        if !withdrawn {
            return CancelOutcome::Signalled;
        }

        match self.shared.settle(Slot::Rejected(TaskError::Cancelled)) {
            Ok(()) => CancelOutcome::Withdrawn,
            Err(AlreadyCompleted) => CancelOutcome::AlreadyCompleted,
        }
    }
}

impl<T: Clone> TaskFuture<T> {
    /// Terminal value, if settled.
    pub fn try_get(&self) -> Option<Result<T, TaskError>> {
        match &*self.shared.lock() {
            Slot::Pending => None,
            Slot::Resolved(value) => Some(Ok(value.clone())),
            Slot::Rejected(error) => Some(Err(error.clone())),
        }
    }

    /// Wait until settled.
    pub async fn wait(&self) -> Result<T, TaskError> {
        loop {
            let settled = self.shared.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            if let Some(result) = self.try_get() {
                return result;
            }

            settled.await;
        }
    }

    /// Wait at most `timeout`.
    ///
    /// A `WaitError::Timeout` leaves the future untouched; it can still be
    /// settled and read later.
    pub async fn get(&self, timeout: Duration) -> Result<T, WaitError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result.map_err(WaitError::from),
            Err(_elapsed) => Err(WaitError::Timeout(timeout)),
        }
    }
}

impl<T> IntoFuture for TaskFuture<T>
where
    T: Clone + Send + 'static,
{
    type Output = Result<T, TaskError>;
    type IntoFuture = Pin<Box<dyn Future<Output = Self::Output> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}
