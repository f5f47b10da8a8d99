//! Property tests: the queues against a FIFO reference model, the set against
//! a hash-set reference model, plus the structural laws (occupancy bound,
//! round trip, idempotent clear).

use corral::{mpsc, spsc, MpmcQueue, SegQueue, StripedSet};
use proptest::prelude::*;
use std::collections::{HashSet, VecDeque};

#[derive(Debug, Clone)]
enum QueueOp {
    Push(u16),
    Pop,
}

fn queue_ops() -> impl Strategy<Value = Vec<QueueOp>> {
    prop::collection::vec(
        prop_oneof![
            (0u16..1000).prop_map(QueueOp::Push),
            Just(QueueOp::Pop),
        ],
        1..200,
    )
}

proptest! {
    /// A bounded MPMC queue agrees with a capacity-limited VecDeque under any
    /// sequential mix of pushes and pops, and never exceeds its capacity.
    #[test]
    fn prop_mpmc_matches_fifo_model(ops in queue_ops(), capacity in 1usize..32) {
        let queue = MpmcQueue::new(capacity);
        let real_capacity = queue.capacity();
        let mut model = VecDeque::new();

        for op in ops {
            match op {
                QueueOp::Push(v) => {
                    let accepted = queue.try_push(v).is_ok();
                    prop_assert_eq!(accepted, model.len() < real_capacity);
                    if accepted {
                        model.push_back(v);
                    }
                }
                QueueOp::Pop => {
                    prop_assert_eq!(queue.try_pop(), model.pop_front());
                }
            }
            prop_assert!(queue.len() <= real_capacity);
            prop_assert_eq!(queue.len(), model.len());
        }

        // Drain: whatever the model says is left comes out in order.
        while let Some(expected) = model.pop_front() {
            prop_assert_eq!(queue.try_pop(), Some(expected));
        }
        prop_assert_eq!(queue.try_pop(), None);
    }

    /// The SPSC pair agrees with the same model.
    #[test]
    fn prop_spsc_matches_fifo_model(ops in queue_ops(), capacity in 1usize..32) {
        let (mut tx, mut rx) = spsc::bounded(capacity);
        let mut model = VecDeque::new();

        for op in ops {
            match op {
                QueueOp::Push(v) => {
                    let accepted = tx.try_push(v).is_ok();
                    prop_assert_eq!(accepted, model.len() < capacity);
                    if accepted {
                        model.push_back(v);
                    }
                }
                QueueOp::Pop => {
                    prop_assert_eq!(rx.try_pop(), model.pop_front());
                }
            }
            prop_assert_eq!(rx.len(), model.len());
        }
    }

    /// The MPSC pair agrees with the model; peek always mirrors the front.
    #[test]
    fn prop_mpsc_matches_fifo_model(ops in queue_ops(), capacity in 1usize..32) {
        let (tx, mut rx) = mpsc::bounded(capacity);
        let real_capacity = tx.capacity();
        let mut model = VecDeque::new();

        for op in ops {
            match op {
                QueueOp::Push(v) => {
                    let accepted = tx.try_push(v).is_ok();
                    prop_assert_eq!(accepted, model.len() < real_capacity);
                    if accepted {
                        model.push_back(v);
                    }
                }
                QueueOp::Pop => {
                    prop_assert_eq!(rx.try_pop(), model.pop_front());
                }
            }
            prop_assert_eq!(rx.try_peek(), model.front());
        }
    }

    /// A growable segmented queue accepts everything and preserves order
    /// across any number of segment transitions.
    #[test]
    fn prop_segmented_matches_unbounded_model(ops in queue_ops()) {
        let queue = SegQueue::new();
        let mut model = VecDeque::new();

        for op in ops {
            match op {
                QueueOp::Push(v) => {
                    queue.push(v);
                    model.push_back(v);
                }
                QueueOp::Pop => {
                    prop_assert_eq!(queue.try_pop(), model.pop_front());
                }
            }
            prop_assert_eq!(queue.len(), model.len());
        }
        prop_assert_eq!(queue.to_vec(), Vec::from(model));
    }

    /// A fixed segmented queue enforces exactly its rounded bound.
    #[test]
    fn prop_segmented_fixed_bound(ops in queue_ops(), capacity in 1usize..64) {
        let queue = SegQueue::fixed(capacity);
        let bound = queue.capacity().unwrap();
        let mut model = VecDeque::new();

        for op in ops {
            match op {
                QueueOp::Push(v) => {
                    let accepted = queue.try_push(v).is_ok();
                    prop_assert_eq!(accepted, model.len() < bound);
                    if accepted {
                        model.push_back(v);
                    }
                }
                QueueOp::Pop => {
                    prop_assert_eq!(queue.try_pop(), model.pop_front());
                }
            }
            prop_assert!(queue.len() <= bound);
        }
    }

    /// Round trip: seeding a queue with K items then draining yields the seed.
    #[test]
    fn prop_seed_round_trip(seed in prop::collection::vec(any::<u32>(), 0..64)) {
        let queue: SegQueue<u32> = seed.iter().copied().collect();
        let drained: Vec<u32> = std::iter::from_fn(|| queue.try_pop()).collect();
        prop_assert_eq!(drained, seed);
    }

    /// Clearing twice leaves every collection empty and usable.
    #[test]
    fn prop_clear_idempotent(seed in prop::collection::vec(any::<u16>(), 0..64)) {
        let queue: SegQueue<u16> = seed.iter().copied().collect();
        queue.clear();
        queue.clear();
        prop_assert!(queue.is_empty());
        queue.push(1);
        prop_assert_eq!(queue.try_pop(), Some(1));

        let set: StripedSet<u16> = seed.iter().copied().collect();
        set.clear();
        set.clear();
        prop_assert!(set.is_empty());
        prop_assert!(set.insert(1));
    }

    /// The set agrees with std's HashSet under any sequential mix of inserts,
    /// removes and lookups.
    #[test]
    fn prop_set_matches_hash_model(
        ops in prop::collection::vec((0u8..3, 0u16..50), 1..300)
    ) {
        let set = StripedSet::new();
        let mut model: HashSet<u16> = HashSet::new();

        for (op, key) in ops {
            match op {
                0 => prop_assert_eq!(set.insert(key), model.insert(key)),
                1 => prop_assert_eq!(set.remove(&key), model.remove(&key)),
                _ => prop_assert_eq!(set.contains(&key), model.contains(&key)),
            }
            prop_assert_eq!(set.len(), model.len());
        }

        let mut drained = set.to_vec();
        drained.sort_unstable();
        let mut expected: Vec<u16> = model.into_iter().collect();
        expected.sort_unstable();
        prop_assert_eq!(drained, expected);
    }
}
