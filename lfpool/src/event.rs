//! Auto-reset event used to wake the reclaim worker
//!
//! This always uses the real `std` primitives. Timed waits are not something
//! loom can model, and the worker is never run inside a loom model.

use std::{
    fmt::{self, Debug},
    sync::{Condvar, Mutex},
    time::{Duration, Instant},
};

/// Why [Event::wait] returned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

/// A flag that wakes up one waiter and then clears itself
///
/// Signals are not counted: signaling an already signaled event does nothing.
pub struct Event {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let signaled = self.signaled.lock().map(|x| *x).ok();
        f.debug_struct("Event")
            .field("@addr", &(self as *const _))
            .field("signaled", &signaled)
            .finish()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl Event {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cond.notify_one();
    }

    /// Block until signaled or until `timeout` has passed,
    /// consuming the signal in the first case
    ///
    /// A timeout too large to represent as a deadline waits for a signal only.
    pub fn wait(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now().checked_add(timeout);
        let mut signaled = self.signaled.lock().unwrap();
        loop {
            if *signaled {
                *signaled = false;
                return WaitOutcome::Signaled;
            }
            // spurious wakeups just go around again
            signaled = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return WaitOutcome::TimedOut;
                    }
                    self.cond.wait_timeout(signaled, deadline - now).unwrap().0
                }
                None => self.cond.wait(signaled).unwrap(),
            };
        }
    }
}
