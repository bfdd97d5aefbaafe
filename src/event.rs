//! Event-flag set (§4.2).
//!
//! A program-wide bitset with wake semantics: `set(i)` flips a bit and wakes
//! every state-set fiber whose current state cares about it; `waitAny`
//! blocks a fiber until any bit in its mask is set, a bound delay fires, or
//! shutdown is requested.
//!
//! Grounded on `fiber::Cond` (renamed [`crate::sync::Cond`] here) for the
//! wake primitive, and on the bit-test/set vocabulary of EPICS event flags
//! (`efTestAndClear`, `efSet`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::sync::Cond;

/// One state set's registered interest in a subset of event flags, plus the
/// [`Cond`] it blocks on. Owned by [`crate::stateset::StateSet`] and
/// registered with the program's [`EventFlagSet`] at startup.
pub struct Waiter {
    pub mask: Mutex<u64>,
    pub wake: Cond,
}

impl Waiter {
    pub fn new() -> Self {
        Waiter {
            mask: Mutex::new(0),
            wake: Cond::new(),
        }
    }

    /// Replace the set of bits this waiter currently cares about — called
    /// whenever a state-set fiber changes state, since each state has its
    /// own event-mask (§3 "State").
    pub fn set_mask(&self, mask: u64) {
        *self.mask.lock().unwrap() = mask;
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bit index, 1-based per §3 ("Event flag. Bit index ∈ [1, numEventFlags]").
pub type EventFlagId = u32;

fn bit(id: EventFlagId) -> u64 {
    debug_assert!(id >= 1 && id <= 64, "event flag id out of supported range");
    1u64 << (id - 1)
}

/// A program's set of event flags (capped at 64 — the compiler output
/// enumerates flags 1..N and real sequencer programs use a handful; a wider
/// bitset would need a `Vec<AtomicU64>` word array, which is a
/// straightforward extension left for when a program needs it).
pub struct EventFlagSet {
    bits: AtomicU64,
    waiters: Mutex<Vec<std::sync::Arc<Waiter>>>,
}

impl EventFlagSet {
    pub fn new() -> Self {
        EventFlagSet {
            bits: AtomicU64::new(0),
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Register a state set's waiter so that `set()` can wake it.
    pub fn register(&self, waiter: std::sync::Arc<Waiter>) {
        self.waiters.lock().unwrap().push(waiter);
    }

    /// Atomically set bit `id`, then wake every waiter whose mask intersects
    /// it. Thundering-herd wakeups are expected and fine: guards re-evaluate
    /// on spurious wakeups (§4.2 "Wake discipline").
    pub fn set(&self, id: EventFlagId) {
        self.bits.fetch_or(bit(id), Ordering::SeqCst);
        for waiter in self.waiters.lock().unwrap().iter() {
            if *waiter.mask.lock().unwrap() & bit(id) != 0 {
                waiter.wake.signal();
            }
        }
    }

    pub fn clear(&self, id: EventFlagId) {
        self.bits.fetch_and(!bit(id), Ordering::SeqCst);
    }

    pub fn test(&self, id: EventFlagId) -> bool {
        self.bits.load(Ordering::SeqCst) & bit(id) != 0
    }

    /// Atomically test-and-clear: if two state sets race on the same bit,
    /// exactly one observes it as having been set (§8 "Event-flag +
    /// state-set").
    pub fn test_and_clear(&self, id: EventFlagId) -> bool {
        let prev = self.bits.fetch_and(!bit(id), Ordering::SeqCst);
        prev & bit(id) != 0
    }

    /// True if any bit in `mask` is currently set.
    pub fn any_set(&self, mask: u64) -> bool {
        self.bits.load(Ordering::SeqCst) & mask != 0
    }
}

impl Default for EventFlagSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn set_test_clear_roundtrip() {
        let efs = EventFlagSet::new();
        assert!(!efs.test(3));
        efs.set(3);
        assert!(efs.test(3));
        efs.clear(3);
        assert!(!efs.test(3));
    }

    #[test]
    fn test_and_clear_is_atomic_exactly_one_winner() {
        let efs = Arc::new(EventFlagSet::new());
        efs.set(1);
        let a = Arc::clone(&efs);
        let b = Arc::clone(&efs);
        let h1 = thread::spawn(move || a.test_and_clear(1));
        let h2 = thread::spawn(move || b.test_and_clear(1));
        let r1 = h1.join().unwrap();
        let r2 = h2.join().unwrap();
        assert_eq!(r1 as u8 + r2 as u8, 1, "exactly one racer observes the set bit");
    }

    #[test]
    fn waiting_state_wakes_on_set() {
        let efs = Arc::new(EventFlagSet::new());
        let waiter = Arc::new(Waiter::new());
        waiter.set_mask(bit(5));
        efs.register(Arc::clone(&waiter));

        let efs2 = Arc::clone(&efs);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            efs2.set(5);
        });
        assert!(waiter.wake.wait_timeout(Duration::from_secs(1)));
        handle.join().unwrap();
    }

    #[test]
    fn set_does_not_wake_unrelated_mask() {
        let efs = Arc::new(EventFlagSet::new());
        let waiter = Arc::new(Waiter::new());
        waiter.set_mask(bit(2));
        efs.register(Arc::clone(&waiter));

        efs.set(5);
        assert!(!waiter.wake.wait_timeout(Duration::from_millis(30)));
    }
}
