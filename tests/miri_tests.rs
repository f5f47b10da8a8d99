//! Miri-compatible exercises of every unsafe path.
//!
//! Run with: `cargo +nightly miri test --test miri_tests`
//!
//! Small capacities keep the interpreter fast while still covering slot
//! hand-over, wrap-around, segment growth and retirement, table resizing,
//! and drop of in-flight values.

use corral::{mpsc, spsc, MpmcQueue, SegQueue, SetConfig, StripedSet};
use std::sync::atomic::{AtomicUsize, Ordering};

#[test]
fn miri_spsc_wrap_and_drop() {
    let (mut tx, mut rx) = spsc::bounded(2);
    for round in 0..3 {
        tx.try_push(format!("a{round}")).unwrap();
        tx.try_push(format!("b{round}")).unwrap();
        assert_eq!(rx.try_pop().as_deref(), Some(format!("a{round}").as_str()));
        assert_eq!(rx.try_pop().as_deref(), Some(format!("b{round}").as_str()));
    }
    tx.try_push("left inside".to_owned()).unwrap();
    // Dropped with a value still queued.
}

#[test]
fn miri_spsc_peek_and_iter() {
    let (mut tx, rx) = spsc::bounded(4);
    tx.try_push(1).unwrap();
    tx.try_push(2).unwrap();
    assert_eq!(rx.try_peek(), Some(&1));
    let all: Vec<i32> = rx.iter().copied().collect();
    assert_eq!(all, [1, 2]);
}

#[test]
fn miri_mpsc_wrap_and_clear() {
    let (tx, mut rx) = mpsc::bounded(2);
    for round in 0..3u32 {
        tx.try_push(round).unwrap();
        tx.try_push(round + 100).unwrap();
        assert_eq!(rx.try_pop(), Some(round));
        assert_eq!(rx.try_pop(), Some(round + 100));
    }
    tx.try_push(7).unwrap();
    rx.clear();
    assert!(rx.is_empty());
}

#[test]
fn miri_mpmc_full_cycle_with_strings() {
    let q = MpmcQueue::new(2);
    for round in 0..3 {
        q.try_push(format!("x{round}")).unwrap();
        q.try_push(format!("y{round}")).unwrap();
        assert!(q.try_push("overflow".to_owned()).is_err());
        assert_eq!(q.try_pop().as_deref(), Some(format!("x{round}").as_str()));
        assert_eq!(q.try_pop().as_deref(), Some(format!("y{round}").as_str()));
    }
    q.try_push("kept".to_owned()).unwrap();
    // Dropped with a value still queued.
}

#[test]
fn miri_mpmc_drop_tracking() {
    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct Tracked;
    impl Drop for Tracked {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    DROPS.store(0, Ordering::SeqCst);
    {
        let q = MpmcQueue::new(4);
        for _ in 0..3 {
            q.try_push(Tracked).unwrap();
        }
        drop(q.try_pop());
    }
    assert_eq!(DROPS.load(Ordering::SeqCst), 3);
}

#[test]
fn miri_segmented_growth_snapshot_clear() {
    let q = SegQueue::with_capacity(2);
    for i in 0..10 {
        q.push(i.to_string());
    }
    let snap = q.to_vec();
    assert_eq!(snap.len(), 10);
    assert_eq!(snap[0], "0");

    for i in 0..5 {
        assert_eq!(q.try_pop().as_deref(), Some(i.to_string().as_str()));
    }
    q.clear();
    assert!(q.is_empty());
    q.push("again".to_owned());
    assert_eq!(q.try_pop().as_deref(), Some("again"));
}

#[test]
fn miri_segmented_peek_across_segments() {
    let q = SegQueue::with_capacity(2);
    for i in 0..6 {
        q.push(i);
    }
    assert_eq!(q.try_pop(), Some(0));
    assert_eq!(q.try_pop(), Some(1));
    assert_eq!(q.try_peek(), Some(2));
    assert_eq!(q.len(), 4);
}

#[test]
fn miri_set_resize_and_reclaim() {
    let set = StripedSet::with_config(SetConfig::new(2, 1, true));
    for i in 0..40 {
        assert!(set.insert(i.to_string()));
    }
    for i in 0..40 {
        assert!(set.contains(&i.to_string()));
    }
    for i in (0..40).step_by(2) {
        assert!(set.remove(&i.to_string()));
    }
    assert_eq!(set.len(), 20);

    let collected: Vec<String> = set.iter().collect();
    assert_eq!(collected.len(), 20);

    set.clear();
    assert!(set.is_empty());
    // Dropped after chains were built, unlinked and replaced.
}
