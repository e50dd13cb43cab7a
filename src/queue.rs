//! Bounded single-producer/single-consumer frame queue.
//!
//! Every consumer role (encode, preview) gets its own `BoundedQueue`. The queue never
//! blocks the producer: a push into a full queue hands the item back as `QueueFull`,
//! and the caller decides what an overflow means for its path.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Capacity used for preview queues unless configured otherwise.
pub const DEFAULT_PREVIEW_CAPACITY: usize = 100;

/// Capacity used for encoder queues unless configured otherwise.
pub const DEFAULT_ENCODE_CAPACITY: usize = 512;

/// Returned by [`BoundedQueue::push`] when the queue is at capacity.
///
/// Carries the rejected item so nothing is dropped silently.
pub struct QueueFull<T>(pub T);

impl<T> QueueFull<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueFull(..)")
    }
}

impl<T> fmt::Display for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue overflow")
    }
}

/// Fixed-capacity FIFO shared between one producer and one consumer.
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items. A zero capacity is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().len() >= self.capacity
    }

    /// Non-blocking push. A full queue returns the item as `QueueFull`.
    pub fn push(&self, item: T) -> Result<(), QueueFull<T>> {
        let mut items = self.lock();
        if items.len() >= self.capacity {
            return Err(QueueFull(item));
        }
        items.push_back(item);
        drop(items);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Non-blocking pop. `None` means the queue was empty.
    pub fn pop_nowait(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Pop, waiting up to `timeout` for an item. `None` means the wait timed out.
    pub fn pop_blocking(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut items = self.lock();
        loop {
            if let Some(item) = items.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .not_empty
                .wait_timeout(items, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            items = guard;
        }
    }

    /// Inspect the oldest item without removing it.
    pub fn peek<R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.lock().front().map(f)
    }

    /// Drop every queued item, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let mut items = self.lock();
        let n = items.len();
        items.clear();
        n
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}
