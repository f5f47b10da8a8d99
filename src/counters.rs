use crate::pad::CachePadded;
use std::sync::atomic::AtomicU32;

/// Interprets the distance between two wrapping 32-bit counters as a signed
/// quantity.
///
/// Every full/empty decision in the ring queues is made on this difference of
/// the raw monotonic counters, never on masked indices, so the structures stay
/// correct across counter wrap as long as no more than one revolution of
/// items is in flight.
#[inline]
pub(crate) fn wrapping_diff(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

/// The head/tail counter pair shared by the ring queues.
///
/// `head` is advanced by consumers, `tail` by producers. Each counter sits in
/// its own 128-byte cell: the two sides hammer their own counter on every
/// operation, and sharing a line would turn that into constant cross-core
/// invalidation traffic.
#[derive(Debug, Default)]
pub(crate) struct HeadTail {
    head: CachePadded<AtomicU32>,
    tail: CachePadded<AtomicU32>,
}

impl HeadTail {
    pub(crate) const fn new() -> Self {
        Self {
            head: CachePadded::new(AtomicU32::new(0)),
            tail: CachePadded::new(AtomicU32::new(0)),
        }
    }

    #[inline]
    pub(crate) fn head(&self) -> &AtomicU32 {
        &self.head
    }

    #[inline]
    pub(crate) fn tail(&self) -> &AtomicU32 {
        &self.tail
    }

    /// Mutable access for paths holding `&mut self` (drop, clear).
    #[inline]
    pub(crate) fn head_mut(&mut self) -> &mut u32 {
        self.head.get_mut()
    }

    #[inline]
    pub(crate) fn tail_mut(&mut self) -> &mut u32 {
        self.tail.get_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering::Relaxed;

    #[test]
    fn test_wrapping_diff_across_zero() {
        assert_eq!(wrapping_diff(5, 3), 2);
        assert_eq!(wrapping_diff(3, 5), -2);
        // Counter wrapped: tail just crossed zero, head has not yet.
        assert_eq!(wrapping_diff(1, u32::MAX), 2);
        assert_eq!(wrapping_diff(u32::MAX, 1), -2);
    }

    #[test]
    fn test_counters_are_line_separated() {
        let ht = HeadTail::new();
        ht.tail().store(9, Relaxed);
        assert_eq!(ht.head().load(Relaxed), 0);
        let head = ht.head() as *const _ as usize;
        let tail = ht.tail() as *const _ as usize;
        assert!(tail.abs_diff(head) >= 128);
    }
}
