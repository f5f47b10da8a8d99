//! Multi-producer single-consumer bounded ring queue.
//!
//! Producers serialize through a CAS on `tail`; the producer that wins counter
//! `t` owns slot `t & mask` until it publishes the slot's sequence number.
//! The single consumer advances `head` with a plain release store, so the
//! consume path is CAS-free.
//!
//! Construction returns a cloneable producer handle and a unique consumer
//! handle.

use crate::backoff::Backoff;
use crate::counters::{wrapping_diff, HeadTail};
use crate::error::{check_copy_bounds, CopyError, PushError};
use crate::invariants::{debug_assert_occupancy, debug_assert_slot_phase};
use crate::slot::{slot_ring, Slot};
use std::sync::atomic::Ordering;
use std::sync::Arc;

// =============================================================================
// PROTOCOL
// =============================================================================
//
// Enqueue (any producer):
//   1. tail = Tail.load(Acquire); seq = slot[tail & mask].seq (Acquire)
//   2. dif = seq - tail (wrapping, signed)
//   3. dif == 0  -> CAS Tail: tail -> tail + 1. Win: write value, release
//                   seq = tail + 1. Lose: another producer claimed the
//                   counter; back off and retry.
//      dif <  0  -> the slot still holds last revolution's value: full.
//      dif >  0  -> stale tail read; back off and retry.
//
// Dequeue (the consumer):
//   1. head = Head.load(Acquire); seq = slot[head & mask].seq (Acquire)
//   2. seq == head + 1 -> release Head = head + 1, move the value out,
//                         release seq = head + capacity.
//      otherwise       -> empty (a reserved-but-unpublished slot also reads
//                         as empty; the producer has not finished).
//
// Storing Head before reading the value is safe here because producers gate
// exclusively on slot sequences, never on Head; nothing can overwrite the
// slot until the final release of `seq = head + capacity`.
// =============================================================================

pub(crate) struct Inner<T> {
    pub(crate) counters: HeadTail,
    pub(crate) slots: Box<[Slot<T>]>,
    pub(crate) mask: u32,
}

// Safety: slot cells are handed between threads by the sequence protocol;
// every value write is released by a sequence store before any other thread's
// acquire load can route it to the cell.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity >= 1, "capacity must be at least 1");
        assert!(
            capacity <= 1 << 30,
            "capacity must leave headroom in a 32-bit counter"
        );
        // The sequence encoding needs at least two slots: with a single slot
        // the "filled" marker of counter t collides with the "empty again"
        // marker of counter t + 1.
        let capacity = capacity.next_power_of_two().max(2);
        Self {
            counters: HeadTail::new(),
            slots: slot_ring(capacity),
            mask: capacity as u32 - 1,
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        let tail = self.counters.tail().load(Ordering::Acquire);
        let head = self.counters.head().load(Ordering::Acquire);
        wrapping_diff(tail, head).clamp(0, self.slots.len() as i32) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        let head = self.counters.head().load(Ordering::Acquire);
        let seq = self.slots[(head & self.mask) as usize].sequence(Ordering::Acquire);
        if wrapping_diff(seq, head.wrapping_add(1)) == 0 {
            return false;
        }
        let tail = self.counters.tail().load(Ordering::Acquire);
        wrapping_diff(tail, head) <= 0
    }

    pub(crate) fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        let mut backoff = Backoff::new();
        loop {
            let tail = self.counters.tail().load(Ordering::Acquire);
            let slot = &self.slots[(tail & self.mask) as usize];
            let seq = slot.sequence(Ordering::Acquire);
            debug_assert_slot_phase!(seq, tail, self.mask);
            let dif = wrapping_diff(seq, tail);

            if dif == 0 {
                match self.counters.tail().compare_exchange(
                    tail,
                    tail.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        // SAFETY: winning the CAS for counter `tail` grants
                        // exclusive ownership of this slot until the publish.
                        unsafe { slot.write(item) };
                        slot.publish(tail.wrapping_add(1));
                        return Ok(());
                    }
                    Err(_) => backoff.snooze(),
                }
            } else if dif < 0 {
                return Err(PushError(item));
            } else {
                // Raced with a faster producer; our tail read is stale.
                backoff.spin();
            }
        }
    }

    /// Single-consumer dequeue. Caller must be the unique consumer.
    pub(crate) fn try_pop_single(&self) -> Option<T> {
        let head = self.counters.head().load(Ordering::Acquire);
        let slot = &self.slots[(head & self.mask) as usize];
        let seq = slot.sequence(Ordering::Acquire);
        debug_assert_slot_phase!(seq, head, self.mask);
        if wrapping_diff(seq, head.wrapping_add(1)) != 0 {
            return None;
        }
        self.counters
            .head()
            .store(head.wrapping_add(1), Ordering::Release);
        // SAFETY: the slot is published for counter `head` and only this
        // consumer dequeues; producers wait for the sequence store below.
        let item = unsafe { slot.take() };
        slot.publish(head.wrapping_add(self.slots.len() as u32));
        Some(item)
    }
}

#[cfg(test)]
impl<T> Inner<T> {
    /// Starts the ring with both counters at `start`, re-seeding every slot
    /// sequence to match, so tests can cross the counter-zero boundary in a
    /// few operations instead of four billion.
    pub(crate) fn with_counters_at(capacity: usize, start: u32) -> Self {
        let inner = Self::new(capacity);
        inner.counters.head().store(start, Ordering::Relaxed);
        inner.counters.tail().store(start, Ordering::Relaxed);
        for k in 0..inner.slots.len() as u32 {
            let counter = start.wrapping_add(k);
            inner.slots[(counter & inner.mask) as usize].force_sequence(counter);
        }
        inner
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let mask = self.mask;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.holds_value(i as u32, mask) {
                // SAFETY: the sequence phase says a published, untaken value
                // is present, and we hold exclusive access.
                unsafe { slot.drop_in_place() };
            }
        }
    }
}

/// Creates a bounded MPSC queue, returning the two ends.
///
/// The capacity is rounded up to the next power of two (minimum 2).
///
/// # Panics
///
/// Panics if `capacity` is zero or exceeds 2^30.
pub fn bounded<T>(capacity: usize) -> (MpscProducer<T>, MpscConsumer<T>) {
    let inner = Arc::new(Inner::new(capacity));
    (
        MpscProducer {
            inner: Arc::clone(&inner),
        },
        MpscConsumer { inner },
    )
}

/// Creates an MPSC queue sized to a seed sequence and filled from it in order.
pub fn seeded<T, I>(items: I) -> (MpscProducer<T>, MpscConsumer<T>)
where
    I: IntoIterator<Item = T>,
{
    let items: Vec<T> = items.into_iter().collect();
    let (producer, consumer) = bounded(items.len().max(1));
    for item in items {
        let pushed = producer.try_push(item).is_ok();
        debug_assert!(pushed);
    }
    (producer, consumer)
}

/// The write end of an MPSC queue. Clone one per producer thread.
pub struct MpscProducer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for MpscProducer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> MpscProducer<T> {
    /// Attempts to enqueue. Returns the item back if the queue is full.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        self.inner.try_push(item)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

/// The read end of an MPSC queue. Not `Clone`: exactly one consumer exists.
pub struct MpscConsumer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> MpscConsumer<T> {
    /// Attempts to dequeue the oldest published item.
    pub fn try_pop(&mut self) -> Option<T> {
        self.inner.try_pop_single()
    }

    /// Borrows the oldest published item without removing it.
    ///
    /// The borrow excludes `try_pop`, so the slot cannot be recycled while
    /// the reference is alive.
    pub fn try_peek(&self) -> Option<&T> {
        let inner = &*self.inner;
        let head = inner.counters.head().load(Ordering::Acquire);
        let slot = &inner.slots[(head & inner.mask) as usize];
        let seq = slot.sequence(Ordering::Acquire);
        if wrapping_diff(seq, head.wrapping_add(1)) != 0 {
            return None;
        }
        // SAFETY: published slot; head cannot advance while `self` is
        // shared-borrowed, and producers wait for the dequeue's sequence
        // store before reusing the slot.
        Some(unsafe { &*slot.value_ptr() })
    }

    /// Iterates queued items oldest-first without removing them.
    ///
    /// If a producer has claimed a counter but not yet published it, the
    /// iterator spins briefly until the slot appears; claims are published in
    /// a handful of instructions.
    pub fn iter(&self) -> MpscIter<'_, T> {
        let head = self.inner.counters.head().load(Ordering::Acquire);
        let tail = self.inner.counters.tail().load(Ordering::Acquire);
        debug_assert_occupancy!(head, tail, self.inner.capacity());
        MpscIter {
            inner: &self.inner,
            pos: head,
            tail,
        }
    }

    /// Copies queued items into a fresh `Vec`, oldest first.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.iter().cloned().collect()
    }

    /// Copies queued items into `dst` starting at `offset`.
    pub fn copy_to(&self, dst: &mut [T], offset: usize) -> Result<usize, CopyError>
    where
        T: Clone,
    {
        let snapshot: Vec<T> = self.to_vec();
        check_copy_bounds(snapshot.len(), offset, dst.len())?;
        let copied = snapshot.len();
        for (dst, item) in dst[offset..].iter_mut().zip(snapshot) {
            *dst = item;
        }
        Ok(copied)
    }

    /// Dequeues until the queue reads empty.
    ///
    /// Concurrent producers can keep the loop fed; the call returns as soon
    /// as an empty state is observed.
    pub fn clear(&mut self) {
        while self.try_pop().is_some() {}
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }
}

/// Borrowing iterator over an MPSC queue, oldest first.
pub struct MpscIter<'a, T> {
    inner: &'a Inner<T>,
    pos: u32,
    tail: u32,
}

impl<'a, T> Iterator for MpscIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if wrapping_diff(self.tail, self.pos) <= 0 {
            return None;
        }
        let slot = &self.inner.slots[(self.pos & self.inner.mask) as usize];
        let mut backoff = Backoff::new();
        // Wait out a producer that claimed this counter but has not yet
        // published; the consumer borrow guarantees nothing is dequeued.
        while wrapping_diff(slot.sequence(Ordering::Acquire), self.pos.wrapping_add(1)) != 0 {
            backoff.snooze();
        }
        self.pos = self.pos.wrapping_add(1);
        // SAFETY: published slot inside [head, tail); the consumer borrow
        // keeps head from moving past it.
        Some(unsafe { &*slot.value_ptr() })
    }
}
