//! Named FIFO hand-off queue.
//!
//! A `Worklist` narrows [`SyncQueue`] to the append-at-back /
//! consume-from-front discipline used to pass items from network reader
//! threads to worker threads. Items within one worklist preserve producer
//! order; there is no ordering guarantee across worklists.

use crate::error::Result;
use crate::sync::SyncQueue;
use std::sync::Arc;
use std::time::Duration;

/// Clonable handle to a shared FIFO work queue.
pub struct Worklist<T> {
    name: Arc<str>,
    queue: Arc<SyncQueue<T>>,
}

impl<T> Clone for Worklist<T> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<T> Worklist<T> {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            queue: Arc::new(SyncQueue::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append an item. Rejected with `QueueClosed` after [`close`](Self::close).
    pub fn push(&self, item: T) -> Result<()> {
        self.queue.push_back(item)
    }

    /// Take the oldest item, blocking until one is available.
    /// Reports `QueueClosed` once the worklist is closed and drained.
    pub fn pop(&self) -> Result<T> {
        self.queue.pop_front()
    }

    /// Take the oldest item, blocking for at most `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        self.queue.pop_front_timeout(timeout)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Close the worklist, unblocking all pending pops.
    pub fn close(&self) {
        self.queue.close();
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::thread;

    #[test]
    fn test_fifo_discipline() {
        let wl = Worklist::new("test");
        wl.push("a").unwrap();
        wl.push("b").unwrap();
        wl.push("c").unwrap();
        assert_eq!(wl.pop().unwrap(), "a");
        assert_eq!(wl.pop().unwrap(), "b");
        assert_eq!(wl.pop().unwrap(), "c");
    }

    #[test]
    fn test_close_unblocks_pending_pop() {
        let wl: Worklist<u8> = Worklist::new("test");
        let wl2 = wl.clone();
        let waiter = thread::spawn(move || wl2.pop());
        thread::sleep(Duration::from_millis(20));
        wl.close();
        assert!(matches!(waiter.join().unwrap(), Err(Error::QueueClosed)));
        assert!(matches!(wl.push(1), Err(Error::QueueClosed)));
    }

    #[test]
    fn test_handoff_between_threads() {
        let wl = Worklist::new("handoff");
        let producer = wl.clone();
        let t = thread::spawn(move || {
            for i in 0..10 {
                producer.push(i).unwrap();
            }
        });
        let mut got = Vec::new();
        for _ in 0..10 {
            got.push(wl.pop().unwrap());
        }
        t.join().unwrap();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
    }
}
