//! In-memory FIFO work queue.
//!
//! # フロー
//! 1. `try_push` / `push` で末尾に追加（bounded なら満杯で reject か待機）
//! 2. worker が `pop` で先頭を取得（空なら `Notify` で待機）
//! 3. `close` 後は push を拒否し、残りを取り出し切ったら `pop` が `None`

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

/// Push was refused; the item is handed back.
pub enum PushError<T> {
    /// Bounded queue at capacity.
    Full(T),
    /// Queue was closed.
    Closed(T),
}

impl<T> PushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            PushError::Full(item) | PushError::Closed(item) => item,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, PushError::Full(_))
    }
}

impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PushError::Full(_) => f.write_str("Full(..)"),
            PushError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Thread-safe FIFO with optional capacity.
///
/// Design:
/// - Items leave in exactly the order they entered (no priority, no reordering).
/// - The lock is never held across an `.await`.
/// - `available` wakes consumers (push / close), `space` wakes producers
///   waiting on a full queue (pop / remove / drain / close).
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Notify,
    space: Notify,
    /// 0 = unbounded.
    capacity: usize,
}

impl<T> WorkQueue<T> {
    /// `capacity == 0` means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Notify::new(),
            space: Notify::new(),
            capacity,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    pub fn capacity(&self) -> Option<usize> {
        (self.capacity > 0).then_some(self.capacity)
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Enqueue without waiting.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(PushError::Closed(item));
            }
            if self.capacity > 0 && state.items.len() >= self.capacity {
                return Err(PushError::Full(item));
            }
            state.items.push_back(item);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Enqueue, waiting for space if the queue is bounded and full.
    pub async fn push(&self, item: T) -> Result<(), PushError<T>> {
        let mut item = item;
        loop {
            // Register before checking so a pop between the check and the
            // await is not missed.
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.try_push(item) {
                Err(PushError::Full(back)) => item = back,
                other => return other,
            }

            space.await;
        }
    }

    /// Dequeue the oldest item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.space.notify_one();
        }
        item
    }

    /// Dequeue the oldest item, waiting until one arrives.
    ///
    /// Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let available = self.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.space.notify_one();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }

            available.await;
        }
    }

    /// Refuse further pushes. Items already queued can still be popped.
    ///
    /// Returns `true` for the call that actually closed the queue.
    pub fn close(&self) -> bool {
        let newly_closed = {
            let mut state = self.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        if newly_closed {
            self.available.notify_waiters();
            self.space.notify_waiters();
        }
        newly_closed
    }

    /// Remove every queued item, oldest first.
    pub fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self.lock().items.drain(..).collect();
        if !drained.is_empty() {
            self.space.notify_waiters();
        }
        drained
    }

    /// Remove the first queued item matching `pred`.
    pub fn remove_first<F>(&self, mut pred: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let removed = {
            let mut state = self.lock();
            let pos = state.items.iter().position(|item| pred(item))?;
            state.items.remove(pos)
        };
        if removed.is_some() {
            self.space.notify_one();
        }
        removed
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        // Nothing panics while holding the lock, so a poisoned state is still
        // consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::unbounded()
    }
}
