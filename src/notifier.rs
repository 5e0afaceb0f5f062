//! A small atomic-value-plus-condvar primitive used for every wait/wake pair
//! in this crate: the registration handshake, the `running` word on a
//! [`crate::record::RequestRecord`], and the global completion wait word.
//!
//! Modeled after the `Notification` helper frawk uses to hand off completion
//! between writer threads (`runtime/writers.rs`): a plain `Mutex<()>` +
//! `Condvar` pair backing an `AtomicI32` so readers can take the fast,
//! lock-free path and only fall back to the mutex to actually block.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Condvar, Mutex};

pub struct Notifier {
    value: AtomicI32,
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl Notifier {
    pub fn new(initial: i32) -> Self {
        Notifier {
            value: AtomicI32::new(initial),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    pub fn load(&self) -> i32 {
        self.value.load(Ordering::Acquire)
    }

    /// Set the value without waking anyone; used to arm a wait word before
    /// blocking on it.
    pub fn store(&self, new: i32) {
        self.value.store(new, Ordering::Release);
    }

    /// Store `new` and wake waiters iff the previous value differs from
    /// `new`. Returns the previous value.
    pub fn swap_and_wake(&self, new: i32) -> i32 {
        let previous = self.value.swap(new, Ordering::AcqRel);
        if previous != new {
            let _guard = self.mutex.lock().unwrap();
            self.condvar.notify_all();
        }
        previous
    }

    /// Atomically set `new` if the current value equals `expected`. On
    /// success, does *not* wake waiters (the caller is the one about to
    /// start waiting on a different transition, e.g. cancel-pending).
    pub fn compare_exchange(&self, expected: i32, new: i32) -> Result<i32, i32> {
        self.value
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
    }

    /// Block until the value is no longer `stale`.
    pub fn wait_while(&self, stale: i32) -> i32 {
        let mut current = self.load();
        if current != stale {
            return current;
        }
        let mut guard = self.mutex.lock().unwrap();
        loop {
            current = self.load();
            if current != stale {
                return current;
            }
            guard = self.condvar.wait(guard).unwrap();
        }
    }
}
