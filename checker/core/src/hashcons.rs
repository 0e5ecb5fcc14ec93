// Copyright (c) Checker Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hash-consing tables for the immutable IR.
//!
//! Analyses must be deterministic: running on the same input has to produce
//! the same result, byte for byte. Heap addresses are fungible across runs,
//! so nothing may ever depend on pointer values. Identity therefore comes
//! from 32-bit content hashes combined from children and primitive fields,
//! with a total `compare` per node kind breaking hash collisions.
//!
//! Interned values are shared immutable handles. Two handles from the same
//! table are equal iff they point at the same allocation; the tables
//! guarantee that equal content maps to the same allocation. Caches hold
//! handles with a named source tag; in debug builds every acquire is
//! recorded with a monotonically increasing stamp so reference leaks can be
//! chased with a breakpoint on the stamp reported at teardown.

use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    ops::Deref,
    sync::Arc,
    sync::Weak,
};

use parking_lot::Mutex;

/// One step of the ELF hash, used to fold a value into a running hash.
/// Depends only on content, so hashes are stable across runs.
pub fn hash_combine(hash: u32, value: u32) -> u32 {
    let mut h = hash.wrapping_shl(4).wrapping_add(value);
    let high = h & 0xf000_0000;
    if high != 0 {
        h ^= high >> 24;
        h &= !high;
    }
    h
}

/// Fold a byte string into a running hash.
pub fn hash_bytes(mut hash: u32, bytes: &[u8]) -> u32 {
    for b in bytes {
        hash = hash_combine(hash, *b as u32);
    }
    hash
}

/// Contract for values stored in an [`Interner`]. `compare` is only called
/// on values with identical `content_hash`, must be deterministic, and must
/// not consult addresses.
pub trait InternKey: Sized + 'static {
    fn content_hash(&self) -> u32;
    fn compare(&self, other: &Self) -> Ordering;
}

struct Node<T> {
    hash: u32,
    data: T,
}

/// Shared handle to an interned value. Equality is allocation identity,
/// which the owning interner makes equivalent to content equality.
pub struct Interned<T: InternKey>(Arc<Node<T>>);

impl<T: InternKey> Interned<T> {
    /// The content hash computed when the value was interned.
    pub fn hash(&self) -> u32 {
        self.0.hash
    }

    /// Acquire an additional handle for a named holder. In debug builds the
    /// acquisition is recorded in the reference ledger.
    pub fn acquire(&self, source: &'static str) -> Interned<T> {
        refs::record(Arc::as_ptr(&self.0) as usize, source);
        Interned(self.0.clone())
    }

    /// Release a handle previously obtained through [`Interned::acquire`]
    /// with the same source. Releasing a source that was never recorded
    /// aborts in debug builds, with the node's reference history.
    pub fn release(self, source: &'static str) {
        refs::forget(Arc::as_ptr(&self.0) as usize, source);
    }

    fn address(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl<T: InternKey> Clone for Interned<T> {
    fn clone(&self) -> Self {
        Interned(self.0.clone())
    }
}

impl<T: InternKey> Deref for Interned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0.data
    }
}

impl<T: InternKey> PartialEq for Interned<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T: InternKey> Eq for Interned<T> {}

impl<T: InternKey> Hash for Interned<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.0.hash);
    }
}

impl<T: InternKey> PartialOrd for Interned<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: InternKey> Ord for Interned<T> {
    /// Deterministic order: hash first, content compare on collision.
    fn cmp(&self, other: &Self) -> Ordering {
        if Arc::ptr_eq(&self.0, &other.0) {
            return Ordering::Equal;
        }
        self.0
            .hash
            .cmp(&other.0.hash)
            .then_with(|| self.0.data.compare(&other.0.data))
    }
}

impl<T: InternKey + fmt::Display> fmt::Display for Interned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.data.fmt(f)
    }
}

impl<T: InternKey + fmt::Debug> fmt::Debug for Interned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.data.fmt(f)
    }
}

struct TableState<T> {
    buckets: Vec<Vec<Weak<Node<T>>>>,
    entry_count: usize,
    min_buckets: usize,
    /// When false, dead entries are left in place so a leak scan can iterate
    /// the table without concurrent unlinking. Flipped off at teardown.
    delete_unused: bool,
}

/// Interning table for one IR node kind. Buckets are allocated on the first
/// lookup and resized as the entry count grows and shrinks.
pub struct Interner<T: InternKey> {
    state: Mutex<TableState<T>>,
}

impl<T: InternKey> Interner<T> {
    pub const fn new(min_buckets: usize) -> Self {
        Interner {
            state: Mutex::new(TableState {
                buckets: Vec::new(),
                entry_count: 0,
                min_buckets,
                delete_unused: true,
            }),
        }
    }

    /// Return the unique representative for `data`. If an equal value is
    /// already present its handle is returned and the candidate dropped,
    /// releasing any child handles the candidate held; otherwise the
    /// candidate is persisted into the table.
    pub fn intern(&self, data: T) -> Interned<T> {
        let hash = data.content_hash();
        let mut state = self.state.lock();

        if state.buckets.is_empty() {
            let min = state.min_buckets;
            state.buckets.resize_with(min, Vec::new);
        }

        let bucket_count = state.buckets.len();
        let index = (hash as usize) % bucket_count;
        let delete_unused = state.delete_unused;

        let mut dropped = 0;
        let mut found = None;
        let bucket = &mut state.buckets[index];
        bucket.retain(|weak| match weak.upgrade() {
            Some(node) => {
                if found.is_none()
                    && node.hash == hash
                    && node.data.compare(&data) == Ordering::Equal
                {
                    found = Some(Interned(node));
                }
                true
            }
            None => {
                if delete_unused {
                    dropped += 1;
                    false
                } else {
                    true
                }
            }
        });
        state.entry_count -= dropped;

        if let Some(existing) = found {
            return existing;
        }

        let node = Arc::new(Node { hash, data });
        state.buckets[index].push(Arc::downgrade(&node));
        state.entry_count += 1;
        self.check_buckets(&mut state);

        let handle = Interned(node);
        refs::record(handle.address(), "intern");
        handle
    }

    /// Number of entries in the table, counting entries whose last handle
    /// has been dropped but which have not been unlinked yet.
    pub fn len(&self) -> usize {
        self.state.lock().entry_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Control whether dead entries are unlinked during lookups. Disabled
    /// before the teardown leak scan so iteration sees a stable table.
    pub fn set_delete_unused(&self, delete_unused: bool) {
        self.state.lock().delete_unused = delete_unused;
    }

    /// Scan for values still alive after the caches released their handles.
    /// Returns the surviving handles; the caller reports them together with
    /// the earliest stamp still recorded for each.
    pub fn live_objects(&self) -> Vec<Interned<T>> {
        let state = self.state.lock();
        state
            .buckets
            .iter()
            .flatten()
            .filter_map(|weak| weak.upgrade().map(Interned))
            .collect()
    }

    /// Drop every entry, live or dead. Used between analyses in tests.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.buckets.clear();
        state.entry_count = 0;
    }

    fn check_buckets(&self, state: &mut TableState<T>) {
        // the entry count has to change by 2x between resizes.
        let buckets = state.buckets.len();
        if buckets > state.min_buckets && buckets > state.entry_count * 4 {
            self.resize(state, buckets / 2);
        } else if buckets < state.entry_count {
            self.resize(state, buckets * 2 + 1);
        }
    }

    fn resize(&self, state: &mut TableState<T>, bucket_count: usize) {
        let bucket_count = bucket_count.max(state.min_buckets);
        let mut buckets: Vec<Vec<Weak<Node<T>>>> = Vec::new();
        buckets.resize_with(bucket_count, Vec::new);

        let mut live = 0;
        for weak in state.buckets.drain(..).flatten() {
            let Some(node) = weak.upgrade() else {
                continue;
            };
            let index = (node.hash as usize) % bucket_count;
            buckets[index].push(weak);
            live += 1;
        }

        state.buckets = buckets;
        state.entry_count = live;
    }
}

/// Leak-scan report for one interning table: surviving node count and the
/// earliest reference stamp among the survivors, when the ledger has one.
pub struct LeakReport {
    pub table: &'static str,
    pub live: usize,
    pub min_stamp: Option<u64>,
}

pub fn scan_leaks<T: InternKey + fmt::Display>(
    table: &'static str,
    interner: &Interner<T>,
) -> LeakReport {
    interner.set_delete_unused(false);
    let survivors = interner.live_objects();
    let mut min_stamp = None;
    for node in &survivors {
        if let Some(stamp) = refs::min_stamp(node.address()) {
            tracing::warn!("leaked {table} node [stamp {stamp}]: {node}");
            min_stamp = Some(min_stamp.map_or(stamp, |m: u64| m.min(stamp)));
        }
    }
    LeakReport {
        table,
        live: survivors.len(),
        min_stamp,
    }
}

/// Debug ledger of named reference sources. Compiled to no-ops in release
/// builds; the stamps it hands out are only meaningful for leak chasing.
pub mod refs {
    use std::sync::atomic::{AtomicU64, Ordering};

    #[cfg(debug_assertions)]
    use std::collections::HashMap;

    #[cfg(debug_assertions)]
    use parking_lot::Mutex;

    static STAMP: AtomicU64 = AtomicU64::new(0);
    static BREAKPOINT: AtomicU64 = AtomicU64::new(0);

    #[cfg(debug_assertions)]
    static LEDGER: Mutex<Option<HashMap<usize, Vec<(&'static str, u64)>>>> = Mutex::new(None);

    /// Configure the stamp to break on, typically from `XGILL_REFERENCE`.
    pub fn set_breakpoint(stamp: Option<u64>) {
        BREAKPOINT.store(stamp.unwrap_or(0), Ordering::Relaxed);
    }

    /// Hook for debuggers; called when the configured stamp is allocated.
    #[inline(never)]
    pub fn breakpoint_hit(stamp: u64) {
        tracing::error!("reference breakpoint hit at stamp {stamp}");
    }

    pub(crate) fn record(address: usize, source: &'static str) -> u64 {
        let stamp = STAMP.fetch_add(1, Ordering::Relaxed) + 1;
        if stamp == BREAKPOINT.load(Ordering::Relaxed) {
            breakpoint_hit(stamp);
        }
        #[cfg(debug_assertions)]
        {
            let mut ledger = LEDGER.lock();
            ledger
                .get_or_insert_with(HashMap::new)
                .entry(address)
                .or_default()
                .push((source, stamp));
        }
        #[cfg(not(debug_assertions))]
        let _ = (address, source);
        stamp
    }

    pub(crate) fn forget(address: usize, source: &'static str) {
        #[cfg(debug_assertions)]
        {
            let mut ledger = LEDGER.lock();
            let entries = ledger
                .get_or_insert_with(HashMap::new)
                .get_mut(&address)
                .and_then(|sources| {
                    // removing a source removes its most recent acquisition.
                    let at = sources.iter().rposition(|(s, _)| *s == source)?;
                    sources.remove(at);
                    Some(())
                });
            if entries.is_none() {
                let history = ledger.get_or_insert_with(HashMap::new).get(&address).cloned();
                panic!("released unrecorded reference source {source:?}, history: {history:?}");
            }
        }
        #[cfg(not(debug_assertions))]
        let _ = (address, source);
    }

    /// Earliest stamp still recorded for a node, if any.
    pub(crate) fn min_stamp(address: usize) -> Option<u64> {
        #[cfg(debug_assertions)]
        {
            let ledger = LEDGER.lock();
            return ledger
                .as_ref()
                .and_then(|map| map.get(&address))
                .and_then(|sources| sources.iter().map(|(_, stamp)| *stamp).min());
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = address;
            None
        }
    }

    /// Reset the ledger between analyses. Test-only affordance.
    pub fn clear() {
        #[cfg(debug_assertions)]
        {
            *LEDGER.lock() = None;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Debug)]
    struct Pair(u32, u32);

    impl InternKey for Pair {
        fn content_hash(&self) -> u32 {
            hash_combine(hash_combine(0, self.0), self.1)
        }

        fn compare(&self, other: &Self) -> Ordering {
            self.0.cmp(&other.0).then(self.1.cmp(&other.1))
        }
    }

    impl fmt::Display for Pair {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "({}, {})", self.0, self.1)
        }
    }

    #[test]
    fn test_intern_injective() {
        let table: Interner<Pair> = Interner::new(3);
        let a = table.intern(Pair(1, 2));
        let b = table.intern(Pair(1, 2));
        let c = table.intern(Pair(2, 1));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_hash_compare_consistent() {
        let a = Pair(7, 9);
        let b = Pair(7, 9);
        assert_eq!(a.compare(&b), Ordering::Equal);
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_resize_keeps_entries() {
        let table: Interner<Pair> = Interner::new(3);
        let handles: Vec<_> = (0..100).map(|i| table.intern(Pair(i, i + 1))).collect();
        // all entries survive the grow resizes and still dedup.
        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(*handle, table.intern(Pair(i as u32, i as u32 + 1)));
        }
        assert_eq!(table.len(), 100);
    }

    #[test]
    fn test_dead_entries_collected() {
        let table: Interner<Pair> = Interner::new(3);
        for i in 0..50 {
            let _ = table.intern(Pair(i, i));
        }
        let keep = table.intern(Pair(1000, 1000));
        // dropped handles are unlinked as their buckets are revisited.
        for i in 0..50 {
            let _ = table.intern(Pair(i, i));
        }
        assert!(table.len() <= 101);
        assert_eq!(keep, table.intern(Pair(1000, 1000)));
    }

    #[test]
    fn test_leak_scan_reports_survivor() {
        let table: Interner<Pair> = Interner::new(3);
        let held = table.intern(Pair(3, 4)).acquire("test_holder");
        let _ = table.intern(Pair(5, 6));
        let report = scan_leaks("pair", &table);
        assert_eq!(report.table, "pair");
        assert!(report.live >= 1);
        held.release("test_holder");
    }

    #[test]
    fn test_deterministic_order() {
        let table: Interner<Pair> = Interner::new(3);
        let mut handles: Vec<_> = (0..20).map(|i| table.intern(Pair(i % 5, i / 5))).collect();
        handles.sort();
        let mut expected: Vec<_> = handles.clone();
        expected.sort_by(|a, b| {
            a.hash()
                .cmp(&b.hash())
                .then_with(|| (**a).0.cmp(&(**b).0))
                .then_with(|| (**a).1.cmp(&(**b).1))
        });
        assert_eq!(handles, expected);
    }
}
