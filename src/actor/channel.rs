//! A thread-safe FIFO used as the foundation of the actor runtime.
//!
//! The scheduler's ready queue is a `Channel<Arc<Mailbox>>`; worker threads
//! block in [`Channel::pop`] until a mailbox has work or the scheduler shuts
//! the channel down. The channel is also usable on its own as a simple
//! multi-producer, multi-consumer queue.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

struct Inner<T> {
    queue: VecDeque<T>,
    capacity: Option<usize>,
    closed: bool,
}

/// A multi-producer, multi-consumer FIFO with a blocking `pop` and a close
/// signal.
///
/// Items pushed by a single producer are popped in push order. Closing the
/// channel wakes every waiter; outstanding pops drain the remaining items
/// before returning `None`.
pub struct Channel<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> Channel<T> {
    /// Create an unbounded channel.
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    /// Create a channel that holds at most `capacity` items; `push` blocks
    /// while the channel is full.
    pub fn bounded(capacity: usize) -> Self {
        Self::with_capacity(Some(capacity))
    }

    fn with_capacity(capacity: Option<usize>) -> Self {
        Channel {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                capacity,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Append `value` to the queue, blocking while a bounded channel is
    /// full.
    ///
    /// Returns `true` when the push transitioned the queue from empty to
    /// non-empty. A push onto a closed channel discards the value and
    /// returns `false`.
    pub fn push(&self, value: T) -> bool {
        let mut inner = self.inner.lock();
        if let Some(capacity) = inner.capacity {
            while inner.queue.len() >= capacity && !inner.closed {
                self.not_full.wait(&mut inner);
            }
        }
        if inner.closed {
            return false;
        }
        let was_empty = inner.queue.is_empty();
        inner.queue.push_back(value);
        if was_empty {
            self.not_empty.notify_one();
        }
        was_empty
    }

    /// Remove and return the oldest item, blocking until one is available.
    ///
    /// Returns `None` once the channel is closed and drained.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(value) = inner.queue.pop_front() {
                self.not_full.notify_one();
                return Some(value);
            }
            if inner.closed {
                return None;
            }
            self.not_empty.wait(&mut inner);
        }
    }

    /// Remove and return the oldest item without blocking.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let value = inner.queue.pop_front();
        if value.is_some() {
            self.not_full.notify_one();
        }
        value
    }

    /// Close the channel, waking every blocked producer and consumer.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}
