//! Unbounded (or capped) MPMC queue over linked ring segments.
//!
//! The fast path is the bounded MPMC slot-sequence protocol, run inside the
//! current head/tail segment. Segments are linked in allocation order;
//! consumers never leave a segment until it is frozen and drained, which is
//! what carries per-producer FIFO across segment boundaries. A single short
//! mutex guards only the slow paths: replacing a full tail segment, advancing
//! past a drained head segment, clearing, and snapshot preparation.
//!
//! Retired segments are reclaimed with epoch-based deferral: a consumer that
//! advances `head` hands the drained segment to the collector, and the
//! allocation is freed once every thread pinned before the hand-off has moved
//! on.

use crate::backoff::Backoff;
use crate::config::{INITIAL_SEGMENT_LEN, MAX_SEGMENT_LEN};
use crate::counters::{wrapping_diff, HeadTail};
use crate::error::{check_copy_bounds, CopyError, PushError};
use crate::invariants::debug_assert_slot_phase;
use crate::metrics::{SegMetrics, SegMetricsSnapshot};
use crate::slot::{slot_ring, Slot};
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

// =============================================================================
// SEGMENT STATES
// =============================================================================
//
// Active     the tail segment; producers and consumers run the plain ring
//            protocol.
// Frozen     `tail` has been bumped by the segment capacity (the freeze
//            offset), so any producer probing a slot computes
//            `seq - tail <= -capacity` and reports the segment closed instead
//            of full. Producers that had already claimed a counter still
//            finish publishing. Consumers drain normally.
// Preserved  a snapshot or peek is (or was) observing the segment. Consumers
//            that win a counter re-check the flag after their CAS and divert
//            through the cross-segment mutex, so an observer holding that
//            mutex can clone slots without a racing dequeue invalidating
//            them. The next segment allocated after a preserved tail drops
//            back to the initial length.
//
// The preserve handshake needs SeqCst on four accesses: the observer's flag
// store and head read, and the consumer's head CAS and flag load. In the
// SeqCst total order, a consumer CAS that the observer's head read missed
// must come after the flag store, so that consumer sees the flag and blocks.
// =============================================================================

struct Segment<T> {
    slots: Box<[Slot<T>]>,
    mask: u32,
    counters: HeadTail,
    frozen: AtomicBool,
    preserved: AtomicBool,
    next: Atomic<Segment<T>>,
}

enum SegPop<T> {
    Item(T),
    Empty,
}

impl<T> Segment<T> {
    fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        debug_assert!((2..=MAX_SEGMENT_LEN).contains(&capacity));
        Self {
            slots: slot_ring(capacity),
            mask: capacity as u32 - 1,
            counters: HeadTail::new(),
            frozen: AtomicBool::new(false),
            preserved: AtomicBool::new(false),
            next: Atomic::null(),
        }
    }

    #[inline]
    fn capacity(&self) -> u32 {
        self.mask + 1
    }

    /// The tail counter with the freeze offset backed out.
    ///
    /// The flag is read first: once it is observed set, the offset add that
    /// preceded the flag store is visible too. The reverse race (offset
    /// already added, flag not yet seen) transiently overcounts, which only
    /// sends callers around their retry loop once more.
    #[inline]
    fn logical_tail(&self) -> u32 {
        if self.frozen.load(Ordering::Acquire) {
            self.counters
                .tail()
                .load(Ordering::Acquire)
                .wrapping_sub(self.capacity())
        } else {
            self.counters.tail().load(Ordering::Acquire)
        }
    }

    /// Closes the segment for producers. Caller must hold the cross-segment
    /// lock; the flag makes the operation idempotent there.
    fn freeze(&self) {
        if !self.frozen.load(Ordering::Relaxed) {
            // Offset first, flag second: observers that see the flag always
            // see the bumped tail.
            self.counters
                .tail()
                .fetch_add(self.capacity(), Ordering::SeqCst);
            self.frozen.store(true, Ordering::Release);
        }
    }

    fn try_push(&self, item: T) -> Result<(), T> {
        let mut backoff = Backoff::new();
        loop {
            let tail = self.counters.tail().load(Ordering::Acquire);
            let slot = &self.slots[(tail & self.mask) as usize];
            let seq = slot.sequence(Ordering::Acquire);
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
                        // exclusive slot ownership until the publish below.
                        unsafe { slot.write(item) };
                        slot.publish(tail.wrapping_add(1));
                        return Ok(());
                    }
                    Err(_) => backoff.snooze(),
                }
            } else if dif < 0 {
                // Full, or frozen (dif <= -capacity once the offset lands).
                // Either way this segment takes no more items.
                return Err(item);
            } else {
                backoff.spin();
            }
        }
    }

    /// Dequeue, diverting through `cross` while the segment is preserved.
    fn try_pop(&self, cross: &Mutex<()>) -> SegPop<T> {
        let mut backoff = Backoff::new();
        loop {
            let head = self.counters.head().load(Ordering::Acquire);
            let slot = &self.slots[(head & self.mask) as usize];
            let seq = slot.sequence(Ordering::Acquire);
            debug_assert_slot_phase!(seq, head, self.mask);
            let dif = wrapping_diff(seq, head.wrapping_add(1));

            if dif == 0 {
                match self.counters.head().compare_exchange(
                    head,
                    head.wrapping_add(1),
                    Ordering::SeqCst,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        if self.preserved.load(Ordering::SeqCst) {
                            // An observer may be cloning this very slot; wait
                            // for it to finish before taking the value out.
                            let _observation_done = cross.lock();
                        }
                        // SAFETY: winning the CAS for counter `head` grants
                        // exclusive ownership of the published slot.
                        let item = unsafe { slot.take() };
                        slot.publish(head.wrapping_add(self.capacity()));
                        return SegPop::Item(item);
                    }
                    Err(_) => backoff.snooze(),
                }
            } else if dif < 0 {
                let tail = self.logical_tail();
                if wrapping_diff(tail, head) <= 0 {
                    return SegPop::Empty;
                }
                // Claimed but not yet published; the producer's store is
                // imminent.
                backoff.spin();
            } else {
                backoff.spin();
            }
        }
    }
}

impl<T> Drop for Segment<T> {
    fn drop(&mut self) {
        let mask = self.mask;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.holds_value(i as u32, mask) {
                // SAFETY: sequence phase says a published, untaken value is
                // here; reclamation gave us exclusive access.
                unsafe { slot.drop_in_place() };
            }
        }
    }
}

/// Unbounded MPMC queue of linked ring segments, optionally capped to a fixed
/// capacity.
///
/// All operations take `&self`; share the queue by reference or `Arc`.
pub struct SegQueue<T> {
    head: Atomic<Segment<T>>,
    tail: Atomic<Segment<T>>,
    cross: Mutex<()>,
    /// `Some(bound)` for fixed-size queues; the bound is the rounded first
    /// segment length.
    fixed_capacity: Option<usize>,
    metrics: SegMetrics,
}

// Safety: slot hand-over is the ring protocol; segment hand-over is the
// epoch-protected pointer protocol plus the cross-segment mutex.
unsafe impl<T: Send> Send for SegQueue<T> {}
unsafe impl<T: Send> Sync for SegQueue<T> {}

impl<T> SegQueue<T> {
    fn with_first_segment(segment_len: usize, fixed: bool) -> Self {
        let metrics = SegMetrics::new();
        metrics.add_segment_allocated();
        // SAFETY: no other thread can observe the queue during construction.
        let first = Owned::new(Segment::new(segment_len))
            .into_shared(unsafe { epoch::unprotected() });
        Self {
            head: Atomic::from(first),
            tail: Atomic::from(first),
            cross: Mutex::new(()),
            fixed_capacity: fixed.then_some(segment_len),
            metrics,
        }
    }

    /// Creates a growable queue with the default first segment.
    pub fn new() -> Self {
        Self::with_first_segment(INITIAL_SEGMENT_LEN, false)
    }

    /// Creates a growable queue whose first segment holds `initial_capacity`
    /// items, rounded up to a power of two.
    ///
    /// # Panics
    ///
    /// Panics if `initial_capacity` is zero or exceeds the maximum segment
    /// length.
    pub fn with_capacity(initial_capacity: usize) -> Self {
        Self::with_first_segment(Self::round_segment_len(initial_capacity), false)
    }

    /// Creates a fixed-size queue holding at most `capacity` items, rounded
    /// up to a power of two.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero or exceeds the maximum segment length.
    pub fn fixed(capacity: usize) -> Self {
        Self::with_first_segment(Self::round_segment_len(capacity), true)
    }

    fn round_segment_len(capacity: usize) -> usize {
        assert!(capacity >= 1, "capacity must be at least 1");
        assert!(
            capacity <= MAX_SEGMENT_LEN,
            "capacity must not exceed {MAX_SEGMENT_LEN}"
        );
        capacity.next_power_of_two().max(2)
    }

    /// Whether the queue was constructed with a fixed capacity.
    pub fn is_fixed(&self) -> bool {
        self.fixed_capacity.is_some()
    }

    /// The fixed bound, or `None` for a growable queue.
    pub fn capacity(&self) -> Option<usize> {
        self.fixed_capacity
    }

    /// Structural counters (segments allocated/retired, snapshots).
    pub fn metrics(&self) -> SegMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Enqueues, growing as needed.
    ///
    /// # Panics
    ///
    /// Panics with "queue is full" on a fixed-size queue at its bound; use
    /// [`try_push`](Self::try_push) to get the item back instead.
    pub fn push(&self, item: T) {
        if self.try_push(item).is_err() {
            panic!("queue is full");
        }
    }

    /// Attempts to enqueue. Only a fixed-size queue at its bound fails.
    pub fn try_push(&self, item: T) -> Result<(), PushError<T>> {
        let guard = epoch::pin();
        let mut item = item;
        loop {
            let tail_shared = self.tail.load(Ordering::Acquire, &guard);
            // SAFETY: the tail pointer is valid while we are pinned.
            let tail_seg = unsafe { tail_shared.deref() };
            match tail_seg.try_push(item) {
                Ok(()) => return Ok(()),
                Err(rejected) => item = rejected,
            }

            // The segment is full or frozen: replace it under the lock.
            let _lock = self.cross.lock();
            if self.tail.load(Ordering::Acquire, &guard) != tail_shared {
                continue; // someone else already replaced it
            }
            if let Some(bound) = self.fixed_capacity {
                if self.len_with_lock_held(&guard) >= bound {
                    return Err(PushError(item));
                }
                // Not actually full (a pop slipped in): retry the same
                // segment, which reuses the vacated slot.
                continue;
            }
            tail_seg.freeze();
            let next_len = if tail_seg.preserved.load(Ordering::Relaxed) {
                INITIAL_SEGMENT_LEN
            } else {
                (tail_seg.capacity() as usize * 2).min(MAX_SEGMENT_LEN)
            };
            let new_seg = Owned::new(Segment::new(next_len)).into_shared(&guard);
            self.metrics.add_segment_allocated();
            tail_seg.next.store(new_seg, Ordering::Release);
            self.tail.store(new_seg, Ordering::Release);
        }
    }

    /// Attempts to dequeue the oldest item.
    pub fn try_pop(&self) -> Option<T> {
        let guard = epoch::pin();
        loop {
            let head_shared = self.head.load(Ordering::Acquire, &guard);
            // SAFETY: the head pointer is valid while we are pinned.
            let head_seg = unsafe { head_shared.deref() };
            match head_seg.try_pop(&self.cross) {
                SegPop::Item(item) => return Some(item),
                SegPop::Empty => {
                    let next = head_seg.next.load(Ordering::Acquire, &guard);
                    if next.is_null() {
                        return None;
                    }
                    // Drained, frozen head segment with a successor: retire
                    // it and move on.
                    let _lock = self.cross.lock();
                    if self.head.load(Ordering::Acquire, &guard) == head_shared {
                        self.head.store(next, Ordering::Release);
                        self.metrics.add_segment_retired();
                        // SAFETY: unlinked under the lock; late dequeuers
                        // still inside stay pinned, which defers the free.
                        unsafe { guard.defer_destroy(head_shared) };
                    }
                }
            }
        }
    }

    /// Clones the oldest item without removing it.
    ///
    /// Marks the observed segment preserved, which makes its remaining
    /// dequeues briefly coordinate with observers; on a growable queue the
    /// next allocation after an observed tail drops back to the initial
    /// segment length.
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let guard = epoch::pin();
        let lock = self.cross.lock();
        let result = self.peek_with_lock_held(&guard);
        drop(lock);
        result
    }

    fn peek_with_lock_held(&self, guard: &Guard) -> Option<T>
    where
        T: Clone,
    {
        let mut cur = self.head.load(Ordering::Acquire, guard);
        loop {
            // SAFETY: reachable segments stay valid while pinned.
            let seg = unsafe { cur.deref() };
            seg.preserved.store(true, Ordering::SeqCst);
            let head = seg.counters.head().load(Ordering::SeqCst);
            let tail = seg.logical_tail();
            if wrapping_diff(tail, head) > 0 {
                let slot = &seg.slots[(head & seg.mask) as usize];
                let mut backoff = Backoff::new();
                while wrapping_diff(slot.sequence(Ordering::Acquire), head.wrapping_add(1)) != 0 {
                    backoff.snooze();
                }
                // SAFETY: published slot; dequeues divert through the lock we
                // hold, and producers never rewrite a published slot.
                return Some(unsafe { slot.peek() });
            }
            let next = seg.next.load(Ordering::Acquire, guard);
            if next.is_null() {
                return None;
            }
            cur = next;
        }
    }

    /// Items currently queued; a best-effort snapshot under concurrency.
    ///
    /// Lock-free while the queue spans at most two segments, falling back to
    /// the cross-segment lock beyond that. Sums are accumulated in 64 bits.
    pub fn len(&self) -> usize {
        let guard = epoch::pin();
        let mut backoff = Backoff::new();
        loop {
            let head_shared = self.head.load(Ordering::Acquire, &guard);
            let tail_shared = self.tail.load(Ordering::Acquire, &guard);
            // SAFETY: reachable segments stay valid while pinned.
            let head_seg = unsafe { head_shared.deref() };

            if head_shared == tail_shared {
                let h = head_seg.counters.head().load(Ordering::Acquire);
                let t = head_seg.logical_tail();
                if self.head.load(Ordering::Acquire, &guard) == head_shared
                    && self.tail.load(Ordering::Acquire, &guard) == tail_shared
                    && h == head_seg.counters.head().load(Ordering::Acquire)
                    && t == head_seg.logical_tail()
                {
                    return wrapping_diff(t, h).max(0) as usize;
                }
            } else if head_seg.next.load(Ordering::Acquire, &guard) == tail_shared {
                // SAFETY: as above.
                let tail_seg = unsafe { tail_shared.deref() };
                let hh = head_seg.counters.head().load(Ordering::Acquire);
                let ht = head_seg.logical_tail();
                let th = tail_seg.counters.head().load(Ordering::Acquire);
                let tt = tail_seg.logical_tail();
                if self.head.load(Ordering::Acquire, &guard) == head_shared
                    && self.tail.load(Ordering::Acquire, &guard) == tail_shared
                    && hh == head_seg.counters.head().load(Ordering::Acquire)
                    && th == tail_seg.counters.head().load(Ordering::Acquire)
                {
                    let first = i64::from(wrapping_diff(ht, hh).max(0));
                    let second = i64::from(wrapping_diff(tt, th).max(0));
                    return (first + second) as usize;
                }
            } else {
                let _lock = self.cross.lock();
                return self.len_with_lock_held(&guard);
            }
            backoff.spin();
        }
    }

    /// Sum of per-segment occupancy. Caller holds the cross-segment lock, so
    /// the segment list is stable; counters may still tick.
    fn len_with_lock_held(&self, guard: &Guard) -> usize {
        let tail_shared = self.tail.load(Ordering::Acquire, guard);
        let mut sum: i64 = 0;
        let mut cur = self.head.load(Ordering::Acquire, guard);
        loop {
            // SAFETY: the lock pins the segment list; we are also pinned.
            let seg = unsafe { cur.deref() };
            let h = seg.counters.head().load(Ordering::Acquire);
            let t = seg.logical_tail();
            sum += i64::from(wrapping_diff(t, h).max(0));
            if cur == tail_shared {
                break;
            }
            cur = seg.next.load(Ordering::Acquire, guard);
        }
        sum as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards every queued item and starts over with a fresh segment.
    ///
    /// Producers that had already claimed a slot complete into the detached
    /// segments, which are then reclaimed with everything still inside.
    pub fn clear(&self) {
        let guard = epoch::pin();
        let _lock = self.cross.lock();
        let head_shared = self.head.load(Ordering::Acquire, &guard);
        let tail_shared = self.tail.load(Ordering::Acquire, &guard);
        // SAFETY: valid while pinned.
        unsafe { tail_shared.deref() }.freeze();

        let new_len = self.fixed_capacity.unwrap_or(INITIAL_SEGMENT_LEN);
        let new_seg = Owned::new(Segment::new(new_len)).into_shared(&guard);
        self.metrics.add_segment_allocated();
        self.head.store(new_seg, Ordering::Release);
        self.tail.store(new_seg, Ordering::Release);

        let mut cur = head_shared;
        loop {
            // SAFETY: the detached chain stays valid while pinned; each
            // segment is freed once concurrent operations unpin.
            let seg = unsafe { cur.deref() };
            let next = seg.next.load(Ordering::Acquire, &guard);
            self.metrics.add_segment_retired();
            unsafe { guard.defer_destroy(cur) };
            if cur == tail_shared {
                break;
            }
            cur = next;
        }
    }

    /// Snapshot of the queue contents in dequeue order.
    ///
    /// Marks every segment preserved and, on a growable queue, freezes the
    /// tail; producers that had already claimed counters are waited out, so
    /// the snapshot is exactly the queue contents at its linearization point.
    pub fn to_vec(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.snapshot()
    }

    /// Iterates a snapshot of the queue in dequeue order.
    pub fn iter(&self) -> SegIter<T>
    where
        T: Clone,
    {
        SegIter {
            items: self.snapshot().into_iter(),
        }
    }

    /// Copies a snapshot into `dst` starting at `offset`.
    pub fn copy_to(&self, dst: &mut [T], offset: usize) -> Result<usize, CopyError>
    where
        T: Clone,
    {
        let snapshot = self.snapshot();
        check_copy_bounds(snapshot.len(), offset, dst.len())?;
        let copied = snapshot.len();
        for (dst, item) in dst[offset..].iter_mut().zip(snapshot) {
            *dst = item;
        }
        Ok(copied)
    }

    fn snapshot(&self) -> Vec<T>
    where
        T: Clone,
    {
        let guard = epoch::pin();
        let _lock = self.cross.lock();
        let head_shared = self.head.load(Ordering::Acquire, &guard);
        let tail_shared = self.tail.load(Ordering::Acquire, &guard);

        // Pass one: preserve every reachable segment so dequeues coordinate
        // with us, and close the growable tail so the range is final.
        let mut cur = head_shared;
        loop {
            // SAFETY: reachable segments stay valid while pinned.
            let seg = unsafe { cur.deref() };
            seg.preserved.store(true, Ordering::SeqCst);
            if cur == tail_shared {
                if self.fixed_capacity.is_none() {
                    seg.freeze();
                }
                break;
            }
            cur = seg.next.load(Ordering::Acquire, &guard);
        }

        // Pass two: walk the recorded ranges, waiting out claimed-but-
        // unpublished slots, cloning each value in counter order.
        let mut out = Vec::new();
        let mut cur = head_shared;
        loop {
            // SAFETY: as above.
            let seg = unsafe { cur.deref() };
            let head = seg.counters.head().load(Ordering::SeqCst);
            let tail = seg.logical_tail();
            let mut pos = head;
            while wrapping_diff(tail, pos) > 0 {
                let slot = &seg.slots[(pos & seg.mask) as usize];
                let mut backoff = Backoff::new();
                while wrapping_diff(slot.sequence(Ordering::Acquire), pos.wrapping_add(1)) != 0 {
                    backoff.snooze();
                }
                // SAFETY: published slot; dequeues in the recorded range
                // divert through the lock we hold, and producers never
                // rewrite a published slot.
                out.push(unsafe { slot.peek() });
                pos = pos.wrapping_add(1);
            }
            if cur == tail_shared {
                break;
            }
            cur = seg.next.load(Ordering::Acquire, &guard);
        }

        // A fixed-size queue keeps its one segment forever; lift the
        // preserve diversion once the observation is over.
        if self.fixed_capacity.is_some() {
            // SAFETY: the single segment is valid while pinned.
            unsafe { head_shared.deref() }.preserved.store(false, Ordering::SeqCst);
        }

        self.metrics.add_snapshot();
        out
    }
}

impl<T> Default for SegQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FromIterator<T> for SegQueue<T> {
    /// Builds a growable queue seeded from the sequence in order.
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        let queue = Self::new();
        for item in iter {
            queue.push(item);
        }
        queue
    }
}

impl<T> Extend<T> for SegQueue<T> {
    fn extend<I: IntoIterator<Item = T>>(&mut self, iter: I) {
        for item in iter {
            self.push(item);
        }
    }
}

impl<T> Drop for SegQueue<T> {
    fn drop(&mut self) {
        // SAFETY: exclusive access; no other thread can be pinned inside.
        unsafe {
            let guard = epoch::unprotected();
            let mut cur = self.head.load(Ordering::Relaxed, guard);
            while !cur.is_null() {
                let next = cur.deref().next.load(Ordering::Relaxed, guard);
                drop(cur.into_owned());
                cur = next;
            }
        }
    }
}

/// Snapshot iterator over a segmented queue, oldest first.
pub struct SegIter<T> {
    items: std::vec::IntoIter<T>,
}

impl<T> Iterator for SegIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.items.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}

impl<T> ExactSizeIterator for SegIter<T> {}
