//! Bounded single-producer/single-consumer queue (§4.1).
//!
//! Grounded on the original sequencer's `seqQueueCreate`/`seqQueuePut`/
//! `seqQueueGet` (`test/unit/queueTest.c`) and, for the lock-free index
//! discipline, on the cached-index SPSC ring buffer pattern (producer and
//! consumer each own one atomic index, acquire/release across the pair).
//!
//! One reserved slot distinguishes empty from full: `capacity` usable
//! elements live in `capacity + 1` slots.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A fixed-capacity, fixed-element-size ring buffer safe for exactly one
/// producer fiber and one consumer fiber operating concurrently without
/// locks.
///
/// `T` is typically a small POD payload (a channel value plus status,
/// severity and timestamp — see [`crate::syncqueue::Payload`]).
pub struct RingQueue<T> {
    capacity: usize,
    slots: Box<[UnsafeCell<Option<T>>]>,
    head: AtomicUsize, // consumer-owned; next slot to read
    tail: AtomicUsize, // producer-owned; next slot to write
}

unsafe impl<T: Send> Send for RingQueue<T> {}
unsafe impl<T: Send> Sync for RingQueue<T> {}

impl<T> RingQueue<T> {
    /// Create a queue holding up to `capacity` elements.
    ///
    /// Returns `None` for `capacity == 0`, matching `seqQueueCreate`'s
    /// failure on a zero capacity or zero element size.
    pub fn new(capacity: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }
        let mut slots = Vec::with_capacity(capacity + 1);
        slots.resize_with(capacity + 1, || UnsafeCell::new(None));
        Some(RingQueue {
            capacity,
            slots: slots.into_boxed_slice(),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        })
    }

    fn next(&self, i: usize) -> usize {
        if i + 1 == self.slots.len() {
            0
        } else {
            i + 1
        }
    }

    /// Push a value. Returns `true` (and drops `value` without writing it)
    /// if the queue was full — the producer never blocks on a full queue;
    /// the caller is responsible for counting the drop (§4.1 "Overflow
    /// policy").
    pub fn put(&self, value: T) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let next_tail = self.next(tail);
        // Acquire: synchronizes with the consumer's release of `head` so we
        // see a head that reflects all of its prior reads.
        if next_tail == self.head.load(Ordering::Acquire) {
            return true; // full
        }
        unsafe {
            *self.slots[tail].get() = Some(value);
        }
        // Release: publishes the write above before the consumer can see
        // the new tail.
        self.tail.store(next_tail, Ordering::Release);
        false
    }

    /// Pop a value. Returns `None` (destination unmodified) if the queue
    /// was empty.
    pub fn get(&self) -> Option<T> {
        let head = self.head.load(Ordering::Relaxed);
        // Acquire: synchronizes with the producer's release of `tail`.
        if head == self.tail.load(Ordering::Acquire) {
            return None; // empty
        }
        let value = unsafe { (*self.slots[head].get()).take() };
        self.head.store(self.next(head), Ordering::Release);
        value
    }

    /// Total usable capacity, as passed to [`RingQueue::new`].
    pub fn num_elems(&self) -> usize {
        self.capacity
    }

    /// Best-effort occupied-slot count. May be transiently stale under
    /// concurrent access but never torn.
    pub fn used(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        if tail >= head {
            tail - head
        } else {
            self.slots.len() - head + tail
        }
    }

    pub fn free(&self) -> usize {
        self.capacity - self.used()
    }

    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    pub fn is_full(&self) -> bool {
        self.used() == self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn zero_capacity_fails() {
        assert!(RingQueue::<u64>::new(0).is_none());
    }

    #[test]
    fn sequential_capacity_three() {
        // capacity=3, push 0..4 with no interleaved gets.
        let q = RingQueue::new(3).unwrap();
        assert!(!q.put(0u32));
        assert!(!q.put(1));
        assert!(!q.put(2));
        assert!(q.put(3)); // full: dropped
        assert!(q.put(4)); // full: dropped

        assert_eq!(q.get(), Some(0));
        assert_eq!(q.get(), Some(1));
        assert_eq!(q.get(), Some(2));
        assert_eq!(q.get(), None); // empty
    }

    #[test]
    fn free_used_num_elems_invariant() {
        let q = RingQueue::new(5).unwrap();
        assert_eq!(q.num_elems(), 5);
        assert_eq!(q.free() + q.used(), q.num_elems());
        q.put(1u8);
        q.put(2);
        assert_eq!(q.free() + q.used(), q.num_elems());
        assert_eq!(q.used(), 2);
        assert!(!q.is_empty());
        assert!(!q.is_full());
    }

    #[test]
    fn full_queue_reports_full() {
        let q = RingQueue::new(2).unwrap();
        q.put(1u8);
        q.put(2);
        assert!(q.is_full());
        assert!(q.put(3)); // dropped
        assert!(q.is_full());
    }

    #[test]
    fn concurrent_reader_writer_loses_none_unexpectedly() {
        const WRITES: u64 = 200_000;
        let q = Arc::new(RingQueue::<u64>::new(16).unwrap());

        let writer_q = Arc::clone(&q);
        let writer = thread::spawn(move || {
            let mut lost = 0u64;
            for i in 0..WRITES {
                if writer_q.put(i) {
                    lost += 1;
                }
            }
            lost
        });

        let reader_q = Arc::clone(&q);
        let reader = thread::spawn(move || {
            let mut last: i64 = -1;
            let mut seen = 0u64;
            loop {
                match reader_q.get() {
                    Some(v) => {
                        assert!(v as i64 > last, "{} should be > {}", v, last);
                        last = v as i64;
                        seen += 1;
                        if v == WRITES - 1 {
                            break;
                        }
                    }
                    None => thread::yield_now(),
                }
            }
            seen
        });

        let writer_lost = writer.join().unwrap();
        let reader_seen = reader.join().unwrap();
        assert_eq!(writer_lost, WRITES - reader_seen);
    }
}
