//! Queue-backed channel synchronization (§4.7 "Sync queue").
//!
//! A sync queue pairs one [`crate::queue::RingQueue`] with one event flag:
//! every monitor update on a `syncQ`-bound channel is pushed as a
//! [`Payload`] instead of overwriting the channel's single-value slot, and
//! the paired event flag is set so a state set blocked on it wakes and
//! drains the queue with `pvGetQ`-style polling. Overflow drops the oldest
//! pending value's replacement (the new value) and increments a lost
//! counter, mirroring `seqQueuePut`'s full-queue behavior in the original.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::event::EventFlagId;
use crate::queue::RingQueue;

/// One channel value plus its provider metadata, as carried through a sync
/// queue (§4.7: "value plus status/severity/timestamp").
#[derive(Debug, Clone)]
pub struct Payload {
    pub value: Vec<u8>,
    pub status: i32,
    pub severity: i32,
    pub timestamp: f64,
}

/// A compiler-emitted sync queue (§3 "Sync queue").
pub struct SyncQueue {
    pub event_flag: EventFlagId,
    ring: RingQueue<Payload>,
    lost: AtomicU64,
}

impl SyncQueue {
    pub fn new(capacity: usize, event_flag: EventFlagId) -> Option<Self> {
        Some(SyncQueue {
            event_flag,
            ring: RingQueue::new(capacity)?,
            lost: AtomicU64::new(0),
        })
    }

    /// Push a newly monitored value. Returns `true` if the queue was full
    /// and the value was dropped (the caller is responsible for setting
    /// the paired event flag regardless, since a drained-but-now-empty
    /// queue still means "something happened").
    pub fn push(&self, payload: Payload) -> bool {
        let dropped = self.ring.put(payload);
        if dropped {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }
        dropped
    }

    /// `pvGetQ`: pop the oldest pending value, if any.
    pub fn pop(&self) -> Option<Payload> {
        self.ring.get()
    }

    pub fn lost_count(&self) -> u64 {
        self.lost.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn used(&self) -> usize {
        self.ring.used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u8) -> Payload {
        Payload {
            value: vec![n],
            status: 0,
            severity: 0,
            timestamp: 0.0,
        }
    }

    #[test]
    fn overflow_drops_and_counts() {
        let q = SyncQueue::new(2, 1).unwrap();
        assert!(!q.push(payload(1)));
        assert!(!q.push(payload(2)));
        assert!(q.push(payload(3)));
        assert_eq!(q.lost_count(), 1);
        assert_eq!(q.pop().unwrap().value, vec![1]);
        assert_eq!(q.pop().unwrap().value, vec![2]);
        assert!(q.pop().is_none());
    }

    #[test]
    fn fifo_order_preserved() {
        let q = SyncQueue::new(4, 1).unwrap();
        for n in 0..4 {
            assert!(!q.push(payload(n)));
        }
        for n in 0..4 {
            assert_eq!(q.pop().unwrap().value, vec![n]);
        }
    }
}
