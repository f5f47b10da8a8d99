use std::num::NonZeroUsize;
use std::thread;

/// Length of the first segment of a growable [`SegQueue`](crate::SegQueue),
/// and of every segment allocated right after a snapshot.
pub const INITIAL_SEGMENT_LEN: usize = 32;

/// Largest segment a growable queue will allocate. Growth doubles the segment
/// length until it reaches this bound.
pub const MAX_SEGMENT_LEN: usize = 1 << 20;

/// Default bucket count of a [`StripedSet`](crate::StripedSet).
pub const DEFAULT_SET_CAPACITY: usize = 31;

/// Upper bound on the stripe-lock array of a set. The lock array can double
/// during growth but never past this.
pub const MAX_STRIPES: usize = 1024;

/// Largest bucket array a set will allocate. Mirrors the array-size ceiling of
/// 32-bit-indexed tables; once reached, the resize budget is pinned to the
/// maximum so no further growth is requested.
pub const MAX_BUCKET_COUNT: usize = 0x7FEF_FFFF;

/// Construction parameters for a [`StripedSet`](crate::StripedSet).
///
/// `capacity` is the initial bucket count, `concurrency` the number of stripe
/// locks (rounded up to a power of two, at most [`MAX_STRIPES`]), and
/// `grow_locks` controls whether resizes may also double the lock array.
#[derive(Debug, Clone, Copy)]
pub struct SetConfig {
    pub capacity: usize,
    pub concurrency: usize,
    pub grow_locks: bool,
}

impl SetConfig {
    /// # Panics
    ///
    /// Panics if `capacity` or `concurrency` is zero, or if `concurrency`
    /// exceeds [`MAX_STRIPES`].
    pub fn new(capacity: usize, concurrency: usize, grow_locks: bool) -> Self {
        assert!(capacity > 0, "capacity must be at least 1");
        assert!(
            concurrency > 0 && concurrency <= MAX_STRIPES,
            "concurrency must be between 1 and {MAX_STRIPES}"
        );
        Self {
            capacity,
            concurrency,
            grow_locks,
        }
    }

    pub(crate) fn stripes(&self) -> usize {
        self.concurrency.next_power_of_two().min(MAX_STRIPES)
    }
}

impl Default for SetConfig {
    /// Default capacity with one stripe per logical processor and a growable
    /// lock array.
    fn default() -> Self {
        let cpus = thread::available_parallelism().map_or(4, NonZeroUsize::get);
        Self::new(DEFAULT_SET_CAPACITY, cpus.min(MAX_STRIPES), true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stripes_round_to_power_of_two() {
        assert_eq!(SetConfig::new(31, 6, true).stripes(), 8);
        assert_eq!(SetConfig::new(31, 1, false).stripes(), 1);
        assert_eq!(SetConfig::new(31, 1024, true).stripes(), 1024);
    }

    #[test]
    #[should_panic(expected = "capacity must be at least 1")]
    fn test_zero_capacity_rejected() {
        let _ = SetConfig::new(0, 4, true);
    }

    #[test]
    #[should_panic(expected = "concurrency must be between")]
    fn test_oversized_concurrency_rejected() {
        let _ = SetConfig::new(31, MAX_STRIPES + 1, true);
    }
}
