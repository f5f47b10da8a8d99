//! Multi-producer multi-consumer bounded ring queue.
//!
//! The same slot-sequence protocol as the MPSC queue, with both ends going
//! through a CAS: the producer that wins counter `t` owns slot `t & mask`
//! until it publishes `t + 1`, the consumer that wins counter `h` owns the
//! slot until it publishes `h + capacity`. Items become visible in counter
//! order and each is consumed exactly once.
//!
//! Unlike the SPSC/MPSC pairs this is a single shareable value: wrap it in an
//! `Arc` (or borrow it from scoped threads) and call everything through `&self`.

use crate::backoff::Backoff;
use crate::counters::wrapping_diff;
use crate::error::{check_copy_bounds, CopyError, PushError};
use crate::invariants::debug_assert_slot_phase;
use crate::mpsc::Inner;
use std::sync::atomic::Ordering;

/// Bounded MPMC queue over sequence-numbered slots.
pub struct MpmcQueue<T> {
    inner: Inner<T>,
}

impl<T> MpmcQueue<T> {
    /// Creates a queue holding up to `capacity` items, rounded up to the next
    /// power of two (minimum 2).
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or exceeds 2^30.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Inner::new(capacity),
        }
    }

    /// Attempts to enqueue. Returns the item back if the queue is full.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        self.inner.try_push(item)
    }

    /// Attempts to dequeue the oldest item.
    pub fn try_pop(&self) -> Option<T> {
        let inner = &self.inner;
        let mut backoff = Backoff::new();
        loop {
            let head = inner.counters.head().load(Ordering::Acquire);
            let slot = &inner.slots[(head & inner.mask) as usize];
            let seq = slot.sequence(Ordering::Acquire);
            debug_assert_slot_phase!(seq, head, inner.mask);
            let dif = wrapping_diff(seq, head.wrapping_add(1));

            if dif == 0 {
                match inner.counters.head().compare_exchange(
                    head,
                    head.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS for counter `head` grants
                        // exclusive ownership of the published slot until the
                        // sequence store hands it back to producers.
                        let item = unsafe { slot.take() };
                        slot.publish(head.wrapping_add(inner.slots.len() as u32));
                        return Some(item);
                    }
                    Err(_) => backoff.snooze(),
                }
            } else if dif < 0 {
                let tail = inner.counters.tail().load(Ordering::Acquire);
                if wrapping_diff(tail, head) <= 0 {
                    return None;
                }
                // A producer claimed this counter but has not finished
                // publishing; its store is imminent.
                backoff.spin();
            } else {
                // Stale head read; another consumer already took this one.
                backoff.spin();
            }
        }
    }

    /// Whether the queue currently holds no items.
    ///
    /// Confirms emptiness against a fresh `tail` read, so a slot that merely
    /// awaits its producer's final store does not read as empty.
    pub fn is_empty(&self) -> bool {
        let inner = &self.inner;
        let mut backoff = Backoff::new();
        loop {
            let head = inner.counters.head().load(Ordering::Acquire);
            let slot = &inner.slots[(head & inner.mask) as usize];
            let seq = slot.sequence(Ordering::Acquire);
            let dif = wrapping_diff(seq, head.wrapping_add(1));
            if dif == 0 {
                return false;
            }
            if dif < 0 {
                let tail = inner.counters.tail().load(Ordering::Acquire);
                if wrapping_diff(tail, head) <= 0 {
                    return true;
                }
            }
            backoff.spin();
        }
    }

    /// Items currently queued; a best-effort snapshot under concurrency.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Dequeues until the queue reads empty.
    ///
    /// Runs concurrently with other operations; items pushed during the drain
    /// may be consumed by it as well.
    pub fn clear(&self) {
        while self.try_pop().is_some() {}
    }

    /// Borrows the oldest item without removing it.
    ///
    /// Requires exclusive access: with other consumers live, the slot under a
    /// shared peek could be recycled mid-read. Under concurrency, take the
    /// item or use [`SegQueue`](crate::SegQueue), whose peek coordinates with
    /// consumers.
    pub fn try_peek(&mut self) -> Option<&T> {
        let head = *self.inner.counters.head_mut();
        let tail = *self.inner.counters.tail_mut();
        if wrapping_diff(tail, head) <= 0 {
            return None;
        }
        let slot = &self.inner.slots[(head & self.inner.mask) as usize];
        debug_assert_eq!(slot.sequence(Ordering::Relaxed), head.wrapping_add(1));
        // SAFETY: published slot; the exclusive borrow keeps it untouched for
        // the reference's lifetime.
        Some(unsafe { &*slot.value_ptr() })
    }

    /// Iterates queued items oldest-first without removing them.
    ///
    /// The exclusive borrow excludes every concurrent operation, which is
    /// what makes borrowing out of a multi-consumer ring sound.
    pub fn iter(&mut self) -> MpmcIter<'_, T> {
        let head = *self.inner.counters.head_mut();
        let tail = *self.inner.counters.tail_mut();
        MpmcIter {
            inner: &self.inner,
            pos: head,
            tail,
        }
    }

    /// Copies queued items into a fresh `Vec`, oldest first.
    pub fn to_vec(&mut self) -> Vec<T>
    where
        T: Clone,
    {
        self.iter().cloned().collect()
    }

    /// Copies queued items into `dst` starting at `offset`.
    pub fn copy_to(&mut self, dst: &mut [T], offset: usize) -> Result<usize, CopyError>
    where
        T: Clone,
    {
        let len = self.len();
        check_copy_bounds(len, offset, dst.len())?;
        for (dst, item) in dst[offset..].iter_mut().zip(self.iter()) {
            *dst = item.clone();
        }
        Ok(len)
    }
}

impl<T> FromIterator<T> for MpmcQueue<T> {
    /// Builds a queue sized to the seed sequence and filled from it in order.
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let items: Vec<T> = iter.into_iter().collect();
        let queue = Self::new(items.len().max(1));
        for item in items {
            let pushed = queue.try_push(item).is_ok();
            debug_assert!(pushed);
        }
        queue
    }
}

/// Borrowing iterator over an exclusively held MPMC queue, oldest first.
pub struct MpmcIter<'a, T> {
    inner: &'a Inner<T>,
    pos: u32,
    tail: u32,
}

impl<'a, T> Iterator for MpmcIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if wrapping_diff(self.tail, self.pos) <= 0 {
            return None;
        }
        let slot = &self.inner.slots[(self.pos & self.inner.mask) as usize];
        // Exclusive access: nothing can be mid-publish, so every counter in
        // [head, tail) is fully published.
        debug_assert_eq!(
            slot.sequence(Ordering::Relaxed),
            self.pos.wrapping_add(1)
        );
        self.pos = self.pos.wrapping_add(1);
        // SAFETY: published slot, and the exclusive borrow on the queue keeps
        // it untouched for 'a.
        Some(unsafe { &*slot.value_ptr() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::thread;

    #[test]
    fn test_fill_then_reject_then_drain() {
        let q = MpmcQueue::new(16);
        for i in 0..16 {
            q.try_push(i).unwrap();
        }
        assert!(q.try_push(16).is_err());
        for i in 0..16 {
            assert_eq!(q.try_pop(), Some(i));
        }
        assert!(q.is_empty());
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn test_capacity_one_alternates() {
        // Capacity 1 rounds to the protocol minimum of 2; alternating
        // push/pop must still hand items over one at a time, in order.
        let q = MpmcQueue::new(1);
        for i in 0..100 {
            q.try_push(i).unwrap();
            assert_eq!(q.try_pop(), Some(i));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_counters_wrap_across_zero() {
        let q = MpmcQueue {
            inner: Inner::with_counters_at(4, u32::MAX - 1),
        };
        for round in 0..4u32 {
            for i in 0..4 {
                q.try_push(round * 4 + i).unwrap();
            }
            assert!(q.is_full());
            for i in 0..4 {
                assert_eq!(q.try_pop(), Some(round * 4 + i));
            }
            assert!(q.is_empty());
        }
    }

    #[test]
    fn test_wrap_across_revolutions() {
        let q = MpmcQueue::new(4);
        for round in 0..64u32 {
            for i in 0..4 {
                q.try_push(round * 4 + i).unwrap();
            }
            for i in 0..4 {
                assert_eq!(q.try_pop(), Some(round * 4 + i));
            }
        }
    }

    #[test]
    fn test_peek_is_stable() {
        let mut q = MpmcQueue::new(4);
        assert_eq!(q.try_peek(), None);
        q.try_push("a").unwrap();
        q.try_push("b").unwrap();
        assert_eq!(q.try_peek(), Some(&"a"));
        assert_eq!(q.len(), 2);
        assert_eq!(q.try_pop(), Some("a"));
        assert_eq!(q.try_peek(), Some(&"b"));
    }

    #[test]
    fn test_iter_preserves_order_and_items() {
        let mut q = MpmcQueue::new(8);
        for i in 0..6 {
            q.try_push(i).unwrap();
        }
        q.try_pop();
        let seen: Vec<i32> = q.iter().copied().collect();
        assert_eq!(seen, [1, 2, 3, 4, 5]);
        assert_eq!(q.len(), 5);
    }

    #[test]
    fn test_from_iter_round_trip() {
        let q: MpmcQueue<u32> = (0..10).collect();
        assert_eq!(q.capacity(), 16);
        for i in 0..10 {
            assert_eq!(q.try_pop(), Some(i));
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_clear_idempotent() {
        let q = MpmcQueue::new(8);
        for i in 0..5 {
            q.try_push(i).unwrap();
        }
        q.clear();
        q.clear();
        assert!(q.is_empty());
        q.try_push(9).unwrap();
        assert_eq!(q.try_pop(), Some(9));
    }

    #[test]
    fn test_concurrent_producers_consumers_exactly_once() {
        const THREADS: usize = 4;
        const PER_THREAD: u64 = 10_000;

        let q = MpmcQueue::new(64);
        let sum = AtomicU64::new(0);
        let received = AtomicU64::new(0);

        thread::scope(|scope| {
            for t in 0..THREADS {
                let q = &q;
                scope.spawn(move || {
                    for i in 0..PER_THREAD {
                        let mut item = t as u64 * PER_THREAD + i;
                        loop {
                            match q.try_push(item) {
                                Ok(()) => break,
                                Err(e) => {
                                    item = e.into_inner();
                                    thread::yield_now();
                                }
                            }
                        }
                    }
                });
            }
            for _ in 0..THREADS {
                let q = &q;
                let sum = &sum;
                let received = &received;
                scope.spawn(move || loop {
                    if received.load(Ordering::SeqCst) >= THREADS as u64 * PER_THREAD {
                        break;
                    }
                    if let Some(v) = q.try_pop() {
                        sum.fetch_add(v, Ordering::SeqCst);
                        received.fetch_add(1, Ordering::SeqCst);
                    } else {
                        thread::yield_now();
                    }
                });
            }
        });

        let n = THREADS as u64 * PER_THREAD;
        assert_eq!(received.load(Ordering::SeqCst), n);
        // Sum of 0..n: every item arrived exactly once.
        assert_eq!(sum.load(Ordering::SeqCst), n * (n - 1) / 2);
    }

    #[test]
    fn test_per_producer_fifo_permutation() {
        const PRODUCERS: usize = 3;
        const CONSUMERS: usize = 2;
        const PER_PRODUCER: u64 = 2_000;

        let q = MpmcQueue::<(usize, u64)>::new(32);
        let received = AtomicU64::new(0);

        thread::scope(|scope| {
            for id in 0..PRODUCERS {
                let q = &q;
                scope.spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let mut item = (id, i);
                        loop {
                            match q.try_push(item) {
                                Ok(()) => break,
                                Err(e) => {
                                    item = e.into_inner();
                                    thread::yield_now();
                                }
                            }
                        }
                    }
                });
            }
            for _ in 0..CONSUMERS {
                let q = &q;
                let received = &received;
                scope.spawn(move || {
                    // Each consumer wins head counters in increasing order, so
                    // its view of any single producer must be increasing too.
                    let mut last_seen = [-1i64; PRODUCERS];
                    while received.load(Ordering::SeqCst) < PRODUCERS as u64 * PER_PRODUCER {
                        if let Some((id, v)) = q.try_pop() {
                            assert!(v as i64 > last_seen[id], "producer {id} reordered");
                            last_seen[id] = v as i64;
                            received.fetch_add(1, Ordering::SeqCst);
                        } else {
                            thread::yield_now();
                        }
                    }
                });
            }
        });
        assert_eq!(received.load(Ordering::SeqCst), PRODUCERS as u64 * PER_PRODUCER);
    }
}
