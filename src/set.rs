//! Striped-lock concurrent hash set with lock-free membership tests.
//!
//! Buckets are singly-linked chains of immutable nodes. Writers take the one
//! stripe lock covering their bucket; readers take nothing and walk chains
//! through acquire loads. Resizing replaces the whole bucket array under every
//! stripe lock and publishes the new tables with a release store, so a reader
//! either sees the old generation or the new one, never a mix.
//!
//! Unlinked nodes and replaced tables are handed to epoch-based reclamation:
//! a reader that entered before the unlink keeps the memory alive until it
//! leaves.
//!
//! Keys must be `Clone` because a resize re-nodes every element into fresh
//! allocations while pinned readers may still be walking the old chains.

use crate::config::{SetConfig, MAX_BUCKET_COUNT, MAX_STRIPES};
use crate::error::{check_copy_bounds, CopyError};
use crate::invariants::debug_assert_stripe;
use crate::metrics::{SetMetrics, SetMetricsSnapshot};
use crate::pad::CachePadded;
use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use parking_lot::{Mutex, MutexGuard};
use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Node<K> {
    hash: u64,
    key: K,
    next: Atomic<Node<K>>,
}

/// One generation of the table: bucket heads, stripe locks, per-stripe
/// element counts and the resize budget.
struct Tables<K> {
    buckets: Box<[Atomic<Node<K>>]>,
    locks: Arc<[Mutex<()>]>,
    counts: Box<[CachePadded<AtomicUsize>]>,
    /// Elements per stripe that trigger a resize request. Doubled in place
    /// when the table turns out to be sparse.
    budget: AtomicUsize,
}

impl<K> Tables<K> {
    fn empty(bucket_count: usize, locks: Arc<[Mutex<()>]>) -> Self {
        let stripes = locks.len();
        Self {
            buckets: (0..bucket_count).map(|_| Atomic::null()).collect(),
            locks,
            counts: (0..stripes)
                .map(|_| CachePadded::new(AtomicUsize::new(0)))
                .collect(),
            budget: AtomicUsize::new((bucket_count / stripes).max(1)),
        }
    }
}

impl<K> Drop for Tables<K> {
    fn drop(&mut self) {
        // SAFETY: a generation is only dropped after reclamation proves no
        // reader can still reach its chains.
        unsafe {
            let guard = epoch::unprotected();
            for bucket in self.buckets.iter() {
                let mut cur = bucket.load(Ordering::Relaxed, guard);
                while !cur.is_null() {
                    let next = cur.deref().next.load(Ordering::Relaxed, guard);
                    drop(cur.into_owned());
                    cur = next;
                }
            }
        }
    }
}

/// Picks a bucket for a hash. On 64-bit targets this is Lemire's fast range
/// reduction (a multiply and a shift); 32-bit targets fall back to a plain
/// modulo.
#[inline]
fn bucket_index(hash: u64, bucket_count: usize) -> usize {
    #[cfg(target_pointer_width = "64")]
    {
        ((u128::from(hash) * bucket_count as u128) >> 64) as usize
    }
    #[cfg(not(target_pointer_width = "64"))]
    {
        (hash % bucket_count as u64) as usize
    }
}

/// Stripe-lock index for a bucket. The stripe count is a power of two.
#[inline]
fn stripe_index(bucket: usize, stripes: usize) -> usize {
    bucket & (stripes - 1)
}

/// Concurrent unordered set over striped locking.
///
/// `contains` is lock-free; `insert`/`remove` take one stripe lock; `len`,
/// `is_empty` (slow path), `clear`, `to_vec` and `copy_to` take every stripe
/// lock.
pub struct StripedSet<K, S = RandomState> {
    tables: Atomic<Tables<K>>,
    hasher: S,
    grow_locks: bool,
    metrics: SetMetrics,
}

impl<K> StripedSet<K, RandomState> {
    /// Creates a set with the default capacity and one stripe per logical
    /// processor.
    pub fn new() -> Self {
        Self::with_config(SetConfig::default())
    }

    /// Creates a set from explicit construction parameters.
    pub fn with_config(config: SetConfig) -> Self {
        Self::with_config_and_hasher(config, RandomState::new())
    }
}

impl<K, S: BuildHasher> StripedSet<K, S> {
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_config_and_hasher(SetConfig::default(), hasher)
    }

    pub fn with_config_and_hasher(config: SetConfig, hasher: S) -> Self {
        let locks: Arc<[Mutex<()>]> = (0..config.stripes()).map(|_| Mutex::new(())).collect();
        Self {
            tables: Atomic::new(Tables::empty(config.capacity, locks)),
            hasher,
            grow_locks: config.grow_locks,
            metrics: SetMetrics::new(),
        }
    }

    /// Structural counters (resizes, budget doublings).
    pub fn metrics(&self) -> SetMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Acquires every stripe lock of the current generation, retrying if a
    /// resize swapped the tables while we queued. Guards are returned in
    /// ascending order; the caller drops them in reverse.
    fn lock_all<'g>(
        &self,
        guard: &'g Guard,
    ) -> (Shared<'g, Tables<K>>, Vec<MutexGuard<'g, ()>>) {
        loop {
            let tables_shared = self.tables.load(Ordering::Acquire, guard);
            // SAFETY: the generation stays alive while pinned.
            let tables = unsafe { tables_shared.deref() };
            let guards: Vec<MutexGuard<'g, ()>> = tables.locks.iter().map(|m| m.lock()).collect();
            if self.tables.load(Ordering::Acquire, guard) == tables_shared {
                return (tables_shared, guards);
            }
            // A resize won the race; its generation owns fresh state.
            drop_in_reverse(guards);
        }
    }
}

fn drop_in_reverse(mut guards: Vec<MutexGuard<'_, ()>>) {
    while guards.pop().is_some() {}
}

impl<K, S> StripedSet<K, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    /// Adds a key. Returns `false` if it was already present.
    pub fn insert(&self, key: K) -> bool {
        let hash = self.hasher.hash_one(&key);
        let guard = epoch::pin();
        loop {
            let tables_shared = self.tables.load(Ordering::Acquire, &guard);
            // SAFETY: the generation stays alive while pinned.
            let tables = unsafe { tables_shared.deref() };
            let bucket = bucket_index(hash, tables.buckets.len());
            let stripe = stripe_index(bucket, tables.locks.len());
            debug_assert_stripe!(bucket, stripe, tables.locks.len());

            let stripe_lock = tables.locks[stripe].lock();
            if self.tables.load(Ordering::Acquire, &guard) != tables_shared {
                drop(stripe_lock);
                continue; // resized under us; redo against the new generation
            }

            let head = tables.buckets[bucket].load(Ordering::Acquire, &guard);
            let mut cur = head;
            while !cur.is_null() {
                // SAFETY: chain nodes stay alive while pinned.
                let node = unsafe { cur.deref() };
                if node.hash == hash && node.key == key {
                    return false;
                }
                cur = node.next.load(Ordering::Acquire, &guard);
            }

            // Head insertion: readers observe the new link only after the
            // release store, at which point the node fields are visible.
            let new = Owned::new(Node {
                hash,
                key,
                next: Atomic::from(head),
            })
            .into_shared(&guard);
            tables.buckets[bucket].store(new, Ordering::Release);
            let count = tables.counts[stripe].fetch_add(1, Ordering::Relaxed) + 1;
            let over_budget = count > tables.budget.load(Ordering::Relaxed);
            drop(stripe_lock);

            if over_budget {
                // Growing acquires locks[0] first, so it must start after
                // this stripe lock is released.
                self.grow(tables_shared, &guard);
            }
            return true;
        }
    }

    /// Removes a key. Returns `false` if it was not present.
    pub fn remove(&self, key: &K) -> bool {
        let hash = self.hasher.hash_one(key);
        let guard = epoch::pin();
        loop {
            let tables_shared = self.tables.load(Ordering::Acquire, &guard);
            // SAFETY: the generation stays alive while pinned.
            let tables = unsafe { tables_shared.deref() };
            let bucket = bucket_index(hash, tables.buckets.len());
            let stripe = stripe_index(bucket, tables.locks.len());

            let stripe_lock = tables.locks[stripe].lock();
            if self.tables.load(Ordering::Acquire, &guard) != tables_shared {
                drop(stripe_lock);
                continue;
            }

            let mut link = &tables.buckets[bucket];
            let mut cur = link.load(Ordering::Acquire, &guard);
            while !cur.is_null() {
                // SAFETY: chain nodes stay alive while pinned.
                let node = unsafe { cur.deref() };
                if node.hash == hash && &node.key == key {
                    let next = node.next.load(Ordering::Acquire, &guard);
                    // Unlink, then let readers already past the link drain
                    // out before the node is freed.
                    link.store(next, Ordering::Release);
                    tables.counts[stripe].fetch_sub(1, Ordering::Relaxed);
                    // SAFETY: the node is unreachable from the bucket now.
                    unsafe { guard.defer_destroy(cur) };
                    return true;
                }
                link = &node.next;
                cur = link.load(Ordering::Acquire, &guard);
            }
            return false;
        }
    }

    /// Lock-free membership test.
    pub fn contains(&self, key: &K) -> bool {
        let hash = self.hasher.hash_one(key);
        let guard = epoch::pin();
        let tables_shared = self.tables.load(Ordering::Acquire, &guard);
        // SAFETY: the generation stays alive while pinned.
        let tables = unsafe { tables_shared.deref() };
        let bucket = bucket_index(hash, tables.buckets.len());
        let mut cur = tables.buckets[bucket].load(Ordering::Acquire, &guard);
        while !cur.is_null() {
            // SAFETY: chain nodes stay alive while pinned.
            let node = unsafe { cur.deref() };
            if node.hash == hash && &node.key == key {
                return true;
            }
            cur = node.next.load(Ordering::Acquire, &guard);
        }
        false
    }

    /// Checks membership and inserts on a miss.
    ///
    /// Returns `true` if the key was already present (nothing inserted),
    /// `false` if this call added it. Either way the key is in the set
    /// afterwards.
    pub fn contains_or_insert(&self, key: K) -> bool {
        if self.contains(&key) {
            return true;
        }
        !self.insert(key)
    }

    /// Rehashes into a larger table, or doubles the budget if the table is
    /// sparse. `observed` is the generation whose budget overflowed.
    fn grow(&self, observed: Shared<'_, Tables<K>>, guard: &Guard) {
        // SAFETY: the observed generation stays alive while pinned.
        let tables = unsafe { observed.deref() };

        let lock0 = tables.locks[0].lock();
        if self.tables.load(Ordering::Acquire, guard) != observed {
            return; // another resize already replaced this generation
        }

        // If less than a quarter of the buckets are occupied on average, the
        // budget tripped on skew, not on load. Back off by doubling it.
        let total: usize = tables.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum();
        if total < tables.buckets.len() / 4 {
            let budget = tables.budget.load(Ordering::Relaxed);
            tables
                .budget
                .store(budget.saturating_mul(2), Ordering::Relaxed);
            self.metrics.add_budget_doubling();
            return;
        }

        // Roughly double the bucket count, skipping multiples of small
        // primes so the distribution survives poor hashes.
        let mut new_len = tables.buckets.len().saturating_mul(2).saturating_add(1);
        while new_len % 3 == 0 || new_len % 5 == 0 || new_len % 7 == 0 {
            new_len += 2;
        }
        let overflow = new_len > MAX_BUCKET_COUNT;
        if overflow {
            new_len = MAX_BUCKET_COUNT;
        }

        let new_locks: Arc<[Mutex<()>]> =
            if self.grow_locks && tables.locks.len() < MAX_STRIPES {
                (0..tables.locks.len() * 2).map(|_| Mutex::new(())).collect()
            } else {
                Arc::clone(&tables.locks)
            };

        // Exclude every writer before touching the chains; locks[0] is
        // already ours.
        let rest: Vec<MutexGuard<'_, ()>> =
            tables.locks[1..].iter().map(|m| m.lock()).collect();

        let new_buckets: Box<[Atomic<Node<K>>]> = (0..new_len).map(|_| Atomic::null()).collect();
        let mut new_counts = vec![0usize; new_locks.len()];
        for bucket in tables.buckets.iter() {
            let mut cur = bucket.load(Ordering::Relaxed, guard);
            while !cur.is_null() {
                // SAFETY: all writers excluded; nodes alive while pinned.
                let node = unsafe { cur.deref() };
                let idx = bucket_index(node.hash, new_len);
                let head = new_buckets[idx].load(Ordering::Relaxed, guard);
                // Fresh nodes, same keys: pinned readers may still be walking
                // the old chains, so those nodes cannot be relinked.
                let renoded = Owned::new(Node {
                    hash: node.hash,
                    key: node.key.clone(),
                    next: Atomic::from(head),
                })
                .into_shared(guard);
                new_buckets[idx].store(renoded, Ordering::Relaxed);
                new_counts[stripe_index(idx, new_locks.len())] += 1;
                cur = node.next.load(Ordering::Relaxed, guard);
            }
        }

        let budget = if overflow {
            usize::MAX
        } else {
            (new_len / new_locks.len()).max(1)
        };
        let new_tables = Owned::new(Tables {
            buckets: new_buckets,
            locks: new_locks,
            counts: new_counts
                .into_iter()
                .map(|c| CachePadded::new(AtomicUsize::new(c)))
                .collect(),
            budget: AtomicUsize::new(budget),
        })
        .into_shared(guard);

        let old = self.tables.swap(new_tables, Ordering::AcqRel, guard);
        debug_assert_eq!(old, observed);
        // SAFETY: the old generation is unreachable once the swap is visible;
        // pinned readers keep it alive until they leave.
        unsafe { guard.defer_destroy(old) };
        self.metrics.add_resize();

        drop_in_reverse(rest);
        drop(lock0);
    }
}

impl<K, S: BuildHasher> StripedSet<K, S> {
    /// Number of elements. Takes every stripe lock for an exact answer.
    pub fn len(&self) -> usize {
        let guard = epoch::pin();
        let (tables_shared, guards) = self.lock_all(&guard);
        // SAFETY: the generation stays alive while pinned.
        let tables = unsafe { tables_shared.deref() };
        let total = tables.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum();
        drop_in_reverse(guards);
        total
    }

    /// Whether the set is empty.
    ///
    /// Fast path: any non-zero stripe count answers `false` without locking.
    /// An all-zero observation can be stale, so it is confirmed under every
    /// stripe lock.
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        let tables_shared = self.tables.load(Ordering::Acquire, &guard);
        // SAFETY: the generation stays alive while pinned.
        let tables = unsafe { tables_shared.deref() };
        if tables.counts.iter().any(|c| c.load(Ordering::Relaxed) != 0) {
            return false;
        }
        self.len() == 0
    }

    /// Removes every element, resetting to the default capacity. The stripe
    /// locks are kept.
    pub fn clear(&self) {
        let guard = epoch::pin();
        let (tables_shared, guards) = self.lock_all(&guard);
        // SAFETY: the generation stays alive while pinned.
        let tables = unsafe { tables_shared.deref() };
        let fresh = Owned::new(Tables::empty(
            crate::config::DEFAULT_SET_CAPACITY,
            Arc::clone(&tables.locks),
        ))
        .into_shared(&guard);
        let old = self.tables.swap(fresh, Ordering::AcqRel, &guard);
        // SAFETY: unreachable after the swap; pinned readers defer the free.
        unsafe { guard.defer_destroy(old) };
        drop_in_reverse(guards);
    }
}

impl<K, S> StripedSet<K, S>
where
    K: Clone,
    S: BuildHasher,
{
    /// Copies every element into a `Vec` under every stripe lock.
    pub fn to_vec(&self) -> Vec<K> {
        let guard = epoch::pin();
        let (tables_shared, guards) = self.lock_all(&guard);
        // SAFETY: the generation stays alive while pinned.
        let tables = unsafe { tables_shared.deref() };
        let mut out = Vec::new();
        for bucket in tables.buckets.iter() {
            let mut cur = bucket.load(Ordering::Relaxed, &guard);
            while !cur.is_null() {
                // SAFETY: writers excluded; nodes alive while pinned.
                let node = unsafe { cur.deref() };
                out.push(node.key.clone());
                cur = node.next.load(Ordering::Relaxed, &guard);
            }
        }
        drop_in_reverse(guards);
        out
    }

    /// Copies every element into `dst` starting at `offset`.
    pub fn copy_to(&self, dst: &mut [K], offset: usize) -> Result<usize, CopyError> {
        let snapshot = self.to_vec();
        check_copy_bounds(snapshot.len(), offset, dst.len())?;
        let copied = snapshot.len();
        for (dst, key) in dst[offset..].iter_mut().zip(snapshot) {
            *dst = key;
        }
        Ok(copied)
    }

    /// Lock-free iterator over the elements.
    ///
    /// Not a snapshot: the walk runs against the live table it started on and
    /// may or may not observe concurrent inserts and removes.
    pub fn iter(&self) -> SetIter<'_, K, S> {
        let guard = epoch::pin();
        let tables = self.tables.load(Ordering::Acquire, &guard).as_raw();
        SetIter {
            _set: self,
            guard,
            tables,
            bucket: 0,
            cur: std::ptr::null(),
            started: false,
        }
    }
}

impl<K> Default for StripedSet<K, RandomState> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Hash + Eq + Clone> FromIterator<K> for StripedSet<K, RandomState> {
    fn from_iter<I: IntoIterator<Item = K>>(iter: I) -> Self {
        let set = Self::new();
        for key in iter {
            set.insert(key);
        }
        set
    }
}

impl<K, S> Extend<K> for StripedSet<K, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher,
{
    fn extend<I: IntoIterator<Item = K>>(&mut self, iter: I) {
        for key in iter {
            self.insert(key);
        }
    }
}

impl<K, S> Drop for StripedSet<K, S> {
    fn drop(&mut self) {
        // SAFETY: exclusive access; the current generation is dropped in
        // place, chains included.
        unsafe {
            let guard = epoch::unprotected();
            let tables = self.tables.load(Ordering::Relaxed, guard);
            if !tables.is_null() {
                drop(tables.into_owned());
            }
        }
    }
}

/// Lock-free running iterator over a [`StripedSet`]. Yields cloned keys.
///
/// Holds an epoch guard for its whole lifetime, which delays reclamation of
/// removed nodes; drop it promptly on hot paths.
pub struct SetIter<'a, K, S> {
    _set: &'a StripedSet<K, S>,
    guard: Guard,
    tables: *const Tables<K>,
    bucket: usize,
    cur: *const Node<K>,
    started: bool,
}

impl<K: Clone, S> Iterator for SetIter<'_, K, S> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        // SAFETY: the guard held since construction keeps the captured
        // generation and every node reachable from it alive, even if
        // concurrently unlinked or superseded by a resize.
        unsafe {
            let tables = &*self.tables;
            loop {
                if !self.started {
                    if self.bucket >= tables.buckets.len() {
                        return None;
                    }
                    self.cur = tables.buckets[self.bucket]
                        .load(Ordering::Acquire, &self.guard)
                        .as_raw();
                    self.started = true;
                }
                if self.cur.is_null() {
                    self.bucket += 1;
                    self.started = false;
                    continue;
                }
                let node = &*self.cur;
                self.cur = node.next.load(Ordering::Acquire, &self.guard).as_raw();
                return Some(node.key.clone());
            }
        }
    }
}
