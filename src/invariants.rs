//! Debug-build assertion macros for the ring and table invariants.
//!
//! Active only under `debug_assertions`, so release builds pay nothing. The
//! queues call these at the points where a violated invariant would otherwise
//! surface far away from its cause (a torn counter shows up as a bad dequeue
//! hundreds of operations later).

/// Assert that the occupancy implied by a counter pair stays within capacity.
///
/// Holds at every instant: `0 <= tail - head <= capacity`, computed on the
/// wrapping signed difference.
macro_rules! debug_assert_occupancy {
    ($head:expr, $tail:expr, $capacity:expr) => {
        debug_assert!(
            {
                let dif = crate::counters::wrapping_diff($tail, $head);
                dif >= 0 && dif as usize <= $capacity
            },
            "occupancy out of bounds: head {} tail {} capacity {}",
            $head,
            $tail,
            $capacity
        )
    };
}

/// Assert that a wrapping counter only moves forward.
macro_rules! debug_assert_monotonic {
    ($name:literal, $old:expr, $new:expr) => {
        debug_assert!(
            crate::counters::wrapping_diff($new, $old) >= 0,
            "{} moved backwards: {} -> {}",
            $name,
            $old,
            $new
        )
    };
}

/// Assert that a slot's sequence number is in one of its two legal phases.
///
/// For slot `index` of a ring with `mask = capacity - 1`, the sequence is
/// always congruent to `index` (empty) or `index + 1` (filled) modulo the
/// capacity.
macro_rules! debug_assert_slot_phase {
    ($seq:expr, $index:expr, $mask:expr) => {
        debug_assert!(
            {
                let phase = $seq & $mask;
                phase == $index & $mask || phase == ($index).wrapping_add(1) & $mask
            },
            "slot {} has sequence {} outside both phases",
            $index & $mask,
            $seq
        )
    };
}

/// Assert that a stripe index is derivable from its bucket index.
macro_rules! debug_assert_stripe {
    ($bucket:expr, $stripe:expr, $stripes:expr) => {
        debug_assert!(
            $stripe == $bucket & ($stripes - 1),
            "bucket {} mapped to stripe {} of {}",
            $bucket,
            $stripe,
            $stripes
        )
    };
}

pub(crate) use debug_assert_monotonic;
pub(crate) use debug_assert_occupancy;
pub(crate) use debug_assert_slot_phase;
pub(crate) use debug_assert_stripe;
