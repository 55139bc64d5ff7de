//! Counting semaphore with a broadcast wakeup.
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct Counts {
    permits: u64,
    broadcasts: u64,
}

/// Counting semaphore built on a `parking_lot` mutex and condition variable.
///
/// `signal` stores a permit for exactly one waiter. `signal_all` wakes every thread currently
/// waiting without storing a permit, so a thread that starts waiting afterwards misses it.
/// Callers of `signal_all` therefore wait with a timeout and recheck their own condition.
#[derive(Default)]
pub(crate) struct Semaphore {
    counts: Mutex<Counts>,
    changed: Condvar,
}

impl Semaphore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Release one permit and wake one waiter.
    pub(crate) fn signal(&self) {
        let mut counts = self.counts.lock();
        let Some(permits) = counts.permits.checked_add(1) else {
            panic!("semaphore permit count overflowed");
        };
        counts.permits = permits;
        self.changed.notify_one();
    }

    /// Wake every current waiter.
    pub(crate) fn signal_all(&self) {
        let mut counts = self.counts.lock();
        counts.broadcasts = counts.broadcasts.wrapping_add(1);
        self.changed.notify_all();
    }

    /// Block until a permit is available and take it.
    pub(crate) fn wait(&self) {
        let mut counts = self.counts.lock();
        while counts.permits == 0 {
            self.changed.wait(&mut counts);
        }
        counts.permits -= 1;
    }

    /// Wait for a permit or a broadcast. Returns `false` on timeout.
    pub(crate) fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut counts = self.counts.lock();
        if counts.permits > 0 {
            counts.permits -= 1;
            return true;
        }
        let epoch = counts.broadcasts;
        let timed_out = self
            .changed
            .wait_while_for(&mut counts, |c| c.permits == 0 && c.broadcasts == epoch, timeout)
            .timed_out();
        if counts.permits > 0 {
            counts.permits -= 1;
            return true;
        }
        !timed_out
    }
}
