//! Double-ended thread-safe queue.
//!
//! All operations are atomic with respect to each other and safe for any
//! number of concurrent producers and consumers. Blocking pops accept an
//! optional timeout and report closure instead of erroring on empty.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Double-ended blocking queue.
///
/// Popping from an empty queue blocks until an item arrives, the timeout
/// elapses (`Ok(None)`), or the queue is closed (`Err(QueueClosed)`).
pub struct SyncQueue<T> {
    inner: Mutex<Inner<T>>,
    available: Condvar,
}

impl<T> SyncQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    /// Append an item at the back. Fails once the queue is closed.
    pub fn push_back(&self, item: T) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::QueueClosed);
        }
        inner.items.push_back(item);
        self.available.notify_one();
        Ok(())
    }

    /// Insert an item at the front, ahead of everything queued so far.
    pub fn push_front(&self, item: T) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(Error::QueueClosed);
        }
        inner.items.push_front(item);
        self.available.notify_one();
        Ok(())
    }

    /// Remove the front item without blocking.
    pub fn try_pop_front(&self) -> Result<Option<T>> {
        let mut inner = self.inner.lock();
        match inner.items.pop_front() {
            Some(item) => Ok(Some(item)),
            None if inner.closed => Err(Error::QueueClosed),
            None => Ok(None),
        }
    }

    /// Remove the back item without blocking.
    pub fn try_pop_back(&self) -> Result<Option<T>> {
        let mut inner = self.inner.lock();
        match inner.items.pop_back() {
            Some(item) => Ok(Some(item)),
            None if inner.closed => Err(Error::QueueClosed),
            None => Ok(None),
        }
    }

    /// Remove the front item, blocking until one is available or the queue
    /// is closed.
    pub fn pop_front(&self) -> Result<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Ok(item);
            }
            if inner.closed {
                return Err(Error::QueueClosed);
            }
            self.available.wait(&mut inner);
        }
    }

    /// Remove the back item, blocking until one is available or the queue
    /// is closed.
    pub fn pop_back(&self) -> Result<T> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_back() {
                return Ok(item);
            }
            if inner.closed {
                return Err(Error::QueueClosed);
            }
            self.available.wait(&mut inner);
        }
    }

    /// Remove the front item, blocking for at most `timeout`.
    ///
    /// Returns `Ok(None)` on timeout; never errors merely because the
    /// queue is empty.
    pub fn pop_front_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                return Ok(Some(item));
            }
            if inner.closed {
                return Err(Error::QueueClosed);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            if self
                .available
                .wait_for(&mut inner, deadline - now)
                .timed_out()
            {
                // Re-check once: an item may have been pushed right at the
                // deadline boundary.
                continue;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Close the queue. Further pushes are rejected; blocked and future
    /// pops drain remaining items and then report [`Error::QueueClosed`].
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl<T> Default for SyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
