//! Synchronization primitives for the state-set scheduler.
//!
//! The original engine ran each state set as a cooperative fiber inside a
//! single scheduler thread and relied on its host's fiber-aware `Cond` /
//! `Latch` primitives (blocking one fiber does not block the others).
//! This runtime replaces that with preemptive OS threads (§5), one per
//! state set, so `Cond` and `Latch` here keep the same shape — a condition
//! variable with a timed wait, and an RAII mutual-exclusion lock — but are
//! backed by [`std::sync::Condvar`]/[`std::sync::Mutex`] instead of a
//! fiber-scheduler's native primitives.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A binary condition variable, analogous to `epicsEvent`/`fiber::Cond`.
///
/// `signal()` wakes a fiber blocked in `wait()`/`wait_timeout()`. Signals
/// that arrive with nobody waiting are remembered (the flag is sticky)
/// so a `set()` that races ahead of `waitAny()` is not lost — this is what
/// lets the event-flag set in [`crate::event`] guarantee a state that is
/// already satisfied when it enters its wait never blocks.
pub struct Cond {
    state: Mutex<bool>,
    cvar: Condvar,
}

impl Cond {
    pub fn new() -> Self {
        Cond {
            state: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    /// Wake one waiter, leaving the flag set for any waiter that has not
    /// yet arrived.
    pub fn signal(&self) {
        let mut flag = self.state.lock().unwrap();
        *flag = true;
        self.cvar.notify_all();
    }

    /// Block until `signal()` is called, or consume a pending signal.
    /// Always returns `true` (parity with `fiber::Cond::wait`, which only
    /// returns `false` on error).
    pub fn wait(&self) -> bool {
        let mut flag = self.state.lock().unwrap();
        while !*flag {
            flag = self.cvar.wait(flag).unwrap();
        }
        *flag = false;
        true
    }

    /// Block until `signal()` is called or `timeout` elapses.
    ///
    /// Returns `true` on signal, `false` on timeout — mirroring
    /// `fiber::Cond::wait_timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut flag = self.state.lock().unwrap();
        loop {
            if *flag {
                *flag = false;
                return true;
            }
            let (guard, result) = self.cvar.wait_timeout(flag, timeout).unwrap();
            flag = guard;
            if result.timed_out() && !*flag {
                return false;
            }
        }
    }
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

/// A mutual-exclusion lock, analogous to `fiber::Latch`/`epicsMutex`.
///
/// Kept as a distinct type from [`std::sync::Mutex`] (rather than aliased
/// away) because the resource table (§5) talks about "channel mutex" /
/// "program mutex" as named roles — giving them a crate type keeps that
/// vocabulary visible in the code that implements it.
pub struct Latch<T> {
    inner: Mutex<T>,
}

impl<T> Latch<T> {
    pub fn new(value: T) -> Self {
        Latch {
            inner: Mutex::new(value),
        }
    }

    /// Lock the latch, blocking until it is available.
    pub fn lock(&self) -> std::sync::MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Try to lock the latch, returning `None` if it is already held.
    pub fn try_lock(&self) -> Option<std::sync::MutexGuard<'_, T>> {
        self.inner.try_lock().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn signal_before_wait_is_not_lost() {
        let cond = Cond::new();
        cond.signal();
        assert!(cond.wait_timeout(Duration::from_millis(50)));
    }

    #[test]
    fn wait_timeout_without_signal_times_out() {
        let cond = Cond::new();
        assert!(!cond.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn signal_wakes_waiting_thread() {
        let cond = Arc::new(Cond::new());
        let waiter = Arc::clone(&cond);
        let handle = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(20));
        cond.signal();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn latch_excludes_concurrent_access() {
        let latch = Arc::new(Latch::new(0usize));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let latch = Arc::clone(&latch);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    *latch.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*latch.lock(), 8000);
    }
}
