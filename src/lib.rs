//! corral - Lock-Free Concurrent Queues and a Striped Set
//!
//! A small family of coordination collections for producer/consumer work:
//!
//! - [`spsc`] - single-producer single-consumer bounded queue, no CAS at all
//! - [`mpsc`] - multi-producer single-consumer bounded ring, CAS on tail only
//! - [`MpmcQueue`] - multi-producer multi-consumer bounded ring, CAS on both
//!   ends over per-slot sequence numbers
//! - [`SegQueue`] - unbounded (or capped) MPMC queue of linked ring segments
//! - [`StripedSet`] - concurrent unordered set with lock-free lookups and
//!   striped write locks
//!
//! # Design
//!
//! Nothing blocks on the fast path. Bounded operations either succeed, report
//! full/empty, or spin briefly while a peer finishes publishing a slot. The
//! head and tail counters live on separate 128-byte cache lines, and every
//! hand-over is an acquire/release pair on a slot sequence number or counter.
//!
//! FIFO order is kept per producer; across producers, items surface in the
//! order their counters were claimed. `len` under concurrency is a
//! best-effort snapshot.
//!
//! # Example
//!
//! ```
//! use corral::SegQueue;
//!
//! let queue = SegQueue::new();
//! std::thread::scope(|scope| {
//!     scope.spawn(|| {
//!         for i in 0..100 {
//!             queue.push(i);
//!         }
//!     });
//!     scope.spawn(|| {
//!         let mut received = 0;
//!         while received < 100 {
//!             if queue.try_pop().is_some() {
//!                 received += 1;
//!             }
//!         }
//!     });
//! });
//! assert!(queue.is_empty());
//! ```

mod backoff;
mod config;
mod counters;
mod error;
mod invariants;
mod metrics;
mod mpmc;
pub mod mpsc;
mod pad;
mod seg;
mod set;
mod slot;
pub mod spsc;

pub use backoff::Backoff;
pub use config::{
    SetConfig, DEFAULT_SET_CAPACITY, INITIAL_SEGMENT_LEN, MAX_BUCKET_COUNT, MAX_SEGMENT_LEN,
    MAX_STRIPES,
};
pub use error::{CopyError, PushError};
pub use metrics::{SegMetrics, SegMetricsSnapshot, SetMetrics, SetMetricsSnapshot};
pub use mpmc::{MpmcIter, MpmcQueue};
pub use mpsc::{MpscConsumer, MpscIter, MpscProducer};
pub use seg::{SegIter, SegQueue};
pub use set::{SetIter, StripedSet};
pub use spsc::{SpscConsumer, SpscIter, SpscProducer};
