use std::sync::atomic::{AtomicU64, Ordering};

/// Structural counters of a [`SegQueue`](crate::SegQueue).
///
/// Purely statistical: all counters use `Relaxed` ordering, no control flow
/// depends on them, and eventual visibility is acceptable.
#[derive(Debug, Default)]
pub struct SegMetrics {
    segments_allocated: AtomicU64,
    segments_retired: AtomicU64,
    snapshots: AtomicU64,
}

impl SegMetrics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add_segment_allocated(&self) {
        self.segments_allocated.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_segment_retired(&self) {
        self.segments_retired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_snapshot(&self) {
        self.snapshots.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SegMetricsSnapshot {
        SegMetricsSnapshot {
            segments_allocated: self.segments_allocated.load(Ordering::Relaxed),
            segments_retired: self.segments_retired.load(Ordering::Relaxed),
            snapshots: self.snapshots.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`SegMetrics`] values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegMetricsSnapshot {
    /// Segments ever allocated, the initial one included.
    pub segments_allocated: u64,
    /// Segments drained and handed to deferred reclamation.
    pub segments_retired: u64,
    /// Snapshot observations (peeks, iteration, `to_vec`).
    pub snapshots: u64,
}

/// Structural counters of a [`StripedSet`](crate::StripedSet).
#[derive(Debug, Default)]
pub struct SetMetrics {
    resizes: AtomicU64,
    budget_doublings: AtomicU64,
}

impl SetMetrics {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add_resize(&self) {
        self.resizes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn add_budget_doubling(&self) {
        self.budget_doublings.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SetMetricsSnapshot {
        SetMetricsSnapshot {
            resizes: self.resizes.load(Ordering::Relaxed),
            budget_doublings: self.budget_doublings.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`SetMetrics`] values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetMetricsSnapshot {
    /// Bucket-array rehashes.
    pub resizes: u64,
    /// Times a sparse table doubled its budget instead of growing.
    pub budget_doublings: u64,
}
