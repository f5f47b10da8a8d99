use std::fmt;
use thiserror::Error;

/// Error returned by `try_push` when the queue cannot accept an item.
///
/// Carries the rejected item back to the caller so nothing is dropped on a
/// transient failure. For the bounded queues this means "full"; for a
/// fixed-size [`SegQueue`](crate::SegQueue) it means the configured bound has
/// been reached.
#[derive(Error)]
#[error("queue is full")]
pub struct PushError<T>(pub T);

impl<T> PushError<T> {
    /// Consumes the error, yielding the item that could not be enqueued.
    pub fn into_inner(self) -> T {
        self.0
    }
}

// T is deliberately not printed: item types are rarely Debug, and the payload
// is not what failed.
impl<T> fmt::Debug for PushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("PushError(..)")
    }
}

/// Error returned by `copy_to` when the destination cannot hold the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("destination too small: {needed} items do not fit at offset {offset} of a slice of {len}")]
pub struct CopyError {
    /// Items the snapshot would have copied.
    pub needed: usize,
    /// Offset the caller asked to start at.
    pub offset: usize,
    /// Length of the destination slice.
    pub len: usize,
}

pub(crate) fn check_copy_bounds(needed: usize, offset: usize, len: usize) -> Result<(), CopyError> {
    if offset > len || len - offset < needed {
        return Err(CopyError { needed, offset, len });
    }
    Ok(())
}
