//! # Cross-Context Queue
//!
//! A FIFO shared between execution contexts, guarded by a single mutex for
//! every operation.
//!
//! The plain operations never wait: callers check [`SyncQueue::is_empty`]
//! or handle [`TransportError::EmptyQueue`]. For consumers that would
//! otherwise spin, two waiting helpers are provided: [`SyncQueue::wait_timeout`]
//! for threads and [`SyncQueue::wait_non_empty`] for async tasks.
//!
//! ## Usage
//! ```rust
//! use tictoc_net::utils::queue::SyncQueue;
//!
//! let queue = SyncQueue::new();
//! assert!(queue.is_empty());
//! queue.push_back(7);
//! assert_eq!(queue.pop_front().ok(), Some(7));
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::{Result, TransportError};

/// Mutex-guarded FIFO with wake-ups for waiting consumers
pub struct SyncQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
    notify: Notify,
}

impl<T> SyncQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            notify: Notify::new(),
        }
    }

    // A panic while holding the lock cannot leave the deque half-updated,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an item and wake one waiter
    pub fn push_back(&self, item: T) {
        let mut items = self.lock();
        items.push_back(item);
        // Signalled under the lock so a waiter cannot miss the push
        self.available.notify_one();
        self.notify.notify_one();
    }

    /// Remove and return the oldest item
    pub fn pop_front(&self) -> Result<T> {
        self.lock().pop_front().ok_or(TransportError::EmptyQueue)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Drop every queued item
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Block the calling thread until the queue is non-empty or `timeout`
    /// elapses. Returns whether an item is available.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut items = self.lock();
        while items.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            items = match self.available.wait_timeout(items, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }

    /// Suspend the calling task until the queue is non-empty
    pub async fn wait_non_empty(&self) {
        loop {
            let notified = self.notify.notified();
            if !self.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

impl<T: Clone> SyncQueue<T> {
    /// Copy of the oldest item
    pub fn front(&self) -> Result<T> {
        self.lock().front().cloned().ok_or(TransportError::EmptyQueue)
    }

    /// Copy of the newest item
    pub fn back(&self) -> Result<T> {
        self.lock().back().cloned().ok_or(TransportError::EmptyQueue)
    }
}

impl<T> Default for SyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SyncQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncQueue")
            .field("len", &self.len())
            .finish()
    }
}
