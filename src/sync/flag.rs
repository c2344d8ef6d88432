//! Waitable boolean condition.
//!
//! A `Flag` can be raised, lowered, and waited on by any number of
//! threads. Raising a flag releases every waiter at once. Used for
//! shutdown propagation so that no blocking wait in the system depends
//! on thread-kill.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct FlagInner {
    raised: Mutex<bool>,
    changed: Condvar,
}

/// Shared waitable boolean. Clones observe the same state.
#[derive(Clone)]
pub struct Flag {
    inner: Arc<FlagInner>,
}

impl Flag {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FlagInner {
                raised: Mutex::new(false),
                changed: Condvar::new(),
            }),
        }
    }

    /// Raise the flag, releasing all current waiters.
    pub fn set(&self) {
        let mut raised = self.inner.raised.lock();
        *raised = true;
        self.inner.changed.notify_all();
    }

    /// Lower the flag.
    pub fn clear(&self) {
        let mut raised = self.inner.raised.lock();
        *raised = false;
        self.inner.changed.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.inner.raised.lock()
    }

    /// Block until the flag is raised. Returns immediately if it already is.
    pub fn wait(&self) {
        let mut raised = self.inner.raised.lock();
        while !*raised {
            self.inner.changed.wait(&mut raised);
        }
    }

    /// Block until the flag is raised or `timeout` elapses.
    ///
    /// Returns `true` if the flag was raised, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut raised = self.inner.raised.lock();
        while !*raised {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.inner.changed.wait_for(&mut raised, deadline - now);
        }
        true
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}
