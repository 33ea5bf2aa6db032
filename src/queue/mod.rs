//! Fixed-capacity, wait-free multi-producer multi-consumer ring buffer.
//!
//! This is the per-slot-sequence-number (Vyukov) design:
//! <http://www.1024cores.net/home/lock-free-algorithms/queues/bounded-mpmc-queue>,
//! the same shape the teacher's `plus::mpms_queue` used, generalized here
//! to drop the pollset/readiness coupling — this queue is drained by an
//! explicit `pop_front` call from a protocol thread's own loop, never by
//! a registered fd.
//!
//! Every live connection slot and every inter-thread message passes
//! through an instance of this queue: the per-thread message inbox and
//! the engine-wide connection-slot free-lists are both `Queue<T>`.

use std::cell::UnsafeCell;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::Arc;

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<Option<T>>,
}

unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send> Sync for Slot<T> {}

struct Inner<T> {
    buffer: Vec<Slot<T>>,
    mask: usize,
    enqueue_pos: AtomicUsize,
    dequeue_pos: AtomicUsize,
}

/// A bounded MPMC queue, cheaply `Clone`-able across threads (an `Arc`
/// handle onto the same ring).
pub struct Queue<T: Send> {
    inner: Arc<Inner<T>>,
}

impl<T: Send> Inner<T> {
    fn with_capacity(capacity: usize) -> Inner<T> {
        let capacity = capacity.max(2).next_power_of_two();

        let buffer = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(None),
            })
            .collect::<Vec<_>>();

        Inner {
            buffer,
            mask: capacity - 1,
            enqueue_pos: AtomicUsize::new(0),
            dequeue_pos: AtomicUsize::new(0),
        }
    }

    fn push_back(&self, value: T) -> Result<(), T> {
        let mask = self.mask;
        let mut pos = self.enqueue_pos.load(Relaxed);

        loop {
            let slot = &self.buffer[pos & mask];
            let seq = slot.sequence.load(Acquire);
            let diff = seq as isize - pos as isize;

            if diff == 0 {
                match self.enqueue_pos.compare_exchange_weak(pos, pos + 1, Relaxed, Relaxed) {
                    Ok(_) => {
                        unsafe {
                            *slot.value.get() = Some(value);
                        }
                        slot.sequence.store(pos + 1, Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // Ring is full: the slot this position would land on has
                // not yet been vacated by a consumer.
                return Err(value);
            } else {
                pos = self.enqueue_pos.load(Relaxed);
            }
        }
    }

    fn pop_front(&self) -> Option<T> {
        let mask = self.mask;
        let mut pos = self.dequeue_pos.load(Relaxed);

        loop {
            let slot = &self.buffer[pos & mask];
            let seq = slot.sequence.load(Acquire);
            let diff = seq as isize - (pos + 1) as isize;

            if diff == 0 {
                match self.dequeue_pos.compare_exchange_weak(pos, pos + 1, Relaxed, Relaxed) {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).take() };
                        slot.sequence.store(pos + mask + 1, Release);
                        return value;
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.dequeue_pos.load(Relaxed);
            }
        }
    }

    fn len(&self) -> usize {
        let back = self.dequeue_pos.load(Relaxed);
        let front = self.enqueue_pos.load(Relaxed);
        front.wrapping_sub(back)
    }
}

impl<T: Send> Queue<T> {
    /// Rounds `capacity` up to the next power of two, minimum 2.
    pub fn with_capacity(capacity: usize) -> Queue<T> {
        Queue {
            inner: Arc::new(Inner::with_capacity(capacity)),
        }
    }

    /// Attempts to enqueue `value`. Returns `false` (and hands the value
    /// back via the caller's owned copy path, `Err`) if the queue is
    /// full; callers must treat this as transient, never a permanent
    /// failure of the channel itself.
    pub fn push_back(&self, value: T) -> bool {
        self.inner.push_back(value).is_ok()
    }

    /// As `push_back`, but returns the rejected value on failure.
    pub fn try_push_back(&self, value: T) -> Result<(), T> {
        self.inner.push_back(value)
    }

    pub fn pop_front(&self) -> Option<T> {
        self.inner.pop_front()
    }

    pub fn size(&self) -> usize {
        self.inner.len()
    }

    pub fn empty(&self) -> bool {
        self.size() == 0
    }

    pub fn full(&self) -> bool {
        self.size() >= self.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.inner.mask + 1
    }
}

impl<T: Send> Clone for Queue<T> {
    fn clone(&self) -> Queue<T> {
        Queue {
            inner: self.inner.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Queue;
    use std::sync::mpsc::channel;
    use std::thread;

    #[test]
    fn fifo_single_thread() {
        let q: Queue<i32> = Queue::with_capacity(4);
        assert!(q.empty());
        assert!(q.push_back(1));
        assert!(q.push_back(2));
        assert!(q.push_back(3));
        assert_eq!(q.pop_front(), Some(1));
        assert_eq!(q.pop_front(), Some(2));
        assert_eq!(q.pop_front(), Some(3));
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn saturation_then_drain() {
        // Requested capacity 4 rounds to the next power of two already
        // equal to 4, matching the quantified saturation scenario.
        let q: Queue<i32> = Queue::with_capacity(4);
        assert!(q.push_back(1));
        assert!(q.push_back(2));
        assert!(q.push_back(3));
        assert!(q.push_back(4));
        assert!(q.full());
        assert!(!q.push_back(5));

        assert_eq!(q.pop_front(), Some(1));
        assert!(!q.full());
        assert!(q.push_back(5));
        assert_eq!(q.pop_front(), Some(2));
        assert_eq!(q.pop_front(), Some(3));
        assert_eq!(q.pop_front(), Some(4));
        assert_eq!(q.pop_front(), Some(5));
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn concurrent_push_pop_preserves_multiset() {
        let nthreads = 8;
        let nmsgs = 1000;
        let q: Queue<usize> = Queue::with_capacity(nthreads * nmsgs);

        let mut handles = vec![];
        for t in 0..nthreads {
            let q = q.clone();
            handles.push(thread::spawn(move || {
                for i in 0..nmsgs {
                    while !q.push_back(t * nmsgs + i) {
                        thread::yield_now();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let (tx, rx) = channel();
        let mut handles = vec![];
        for _ in 0..nthreads {
            let q = q.clone();
            let tx = tx.clone();
            handles.push(thread::spawn(move || {
                let mut got = vec![];
                loop {
                    match q.pop_front() {
                        Some(v) => got.push(v),
                        None => {
                            if q.empty() {
                                break;
                            }
                            thread::yield_now();
                        }
                    }
                }
                tx.send(got).unwrap();
            }));
        }
        drop(tx);
        for h in handles {
            h.join().unwrap();
        }

        let mut all: Vec<usize> = rx.iter().flatten().collect();
        all.sort_unstable();
        let mut expected: Vec<usize> = (0..nthreads * nmsgs).collect();
        expected.sort_unstable();
        assert_eq!(all, expected);
    }
}
