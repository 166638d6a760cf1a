use std::borrow::Borrow;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};
use parking_lot::RwLock;

use crate::node::BucketEntry;

/// Outcome of [`Bucket::upsert`].
pub(crate) enum Upsert<'g, V> {
    /// A new node was linked into the chain.
    Inserted,
    /// An existing node's value was swapped out; the old value is returned.
    Replaced(&'g V),
}

/// A contiguous sublist of the map's sorted chain.
///
/// The bucket owns the entries between its start fence and the next fence.
/// Lookups and upserts run under the shared lock and synchronize through
/// CAS on the chain pointers; removal and structural reshaping (split,
/// merge) take the exclusive lock.
pub(crate) struct Bucket<K, V> {
    lock: RwLock<()>,
    count: AtomicUsize,
    /// The start fence; its hash is the lower bound of this bucket's range.
    fence: Atomic<BucketEntry<K, V>>,
}

impl<K, V> Bucket<K, V> {
    pub(crate) fn new(count: usize, hash: u64) -> Self {
        Bucket {
            lock: RwLock::new(()),
            count: AtomicUsize::new(count),
            fence: Atomic::new(BucketEntry::fence(hash)),
        }
    }

    /// Number of key/value nodes currently owned by this bucket.
    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// The start fence entry.
    pub(crate) fn start<'g>(&self, guard: &'g Guard) -> Shared<'g, BucketEntry<K, V>> {
        self.fence.load(Ordering::SeqCst, guard)
    }

    /// Walks to the last entry whose hash is strictly below `hash`.
    ///
    /// Returns that entry, its successor (the first entry with hash `>=
    /// hash`), and the number of nodes passed along the way. The walk always
    /// terminates: every chain ends in the terminal fence, whose hash is
    /// `u64::MAX`.
    fn pivot<'g>(
        &self,
        hash: u64,
        guard: &'g Guard,
    ) -> (
        Shared<'g, BucketEntry<K, V>>,
        Shared<'g, BucketEntry<K, V>>,
        usize,
    ) {
        let mut prev = self.start(guard);
        // safety: every entry here was reached from the start fence under
        // `guard`. entries are unlinked only under the exclusive bucket lock
        // and their destruction is deferred past all pinned guards, so the
        // chain we observe is made of live allocations.
        let mut at = unsafe { prev.deref() }.next().load(Ordering::SeqCst, guard);
        let mut passed = 0;
        while hash > unsafe { at.deref() }.hash() {
            prev = at;
            at = unsafe { at.deref() }.next().load(Ordering::SeqCst, guard);
            passed += 1;
        }
        (prev, at, passed)
    }

    /// Locates the position of `(hash, key)`.
    ///
    /// Returns `(prev, at, found)`. When `found`, `at` is the node holding an
    /// equal key. Otherwise `at` is the entry before which a new node must be
    /// linked; equal-hash ties land after every existing equal-hash entry.
    fn search<'g, Q>(
        &self,
        hash: u64,
        key: &Q,
        guard: &'g Guard,
    ) -> (
        Shared<'g, BucketEntry<K, V>>,
        Shared<'g, BucketEntry<K, V>>,
        bool,
    )
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let (mut prev, mut at, _) = self.pivot(hash, guard);
        loop {
            // safety: as in `pivot`
            let entry = unsafe { at.deref() };
            if entry.hash() != hash || entry.is_fence() {
                return (prev, at, false);
            }
            match entry.as_node() {
                Some(node) if node.key.borrow() == key => return (prev, at, true),
                _ => {}
            }
            prev = at;
            at = entry.next().load(Ordering::SeqCst, guard);
        }
    }

    /// Looks up `key`, stopping at the first fence or a strictly greater
    /// hash.
    pub(crate) fn get<'g, Q>(&self, key: &Q, hash: u64, guard: &'g Guard) -> Option<&'g V>
    where
        K: Borrow<Q> + 'g,
        Q: ?Sized + Eq,
    {
        self.get_key_value(key, hash, guard).map(|(_, v)| v)
    }

    /// Like [`Bucket::get`], but also returns the stored key.
    pub(crate) fn get_key_value<'g, Q>(
        &self,
        key: &Q,
        hash: u64,
        guard: &'g Guard,
    ) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let _read = self.lock.read();
        // safety: as in `pivot`
        let mut at = unsafe { self.start(guard).deref() }
            .next()
            .load(Ordering::SeqCst, guard);
        loop {
            let entry = unsafe { at.deref() };
            match entry.as_node() {
                // a fence means we exhausted this bucket
                None => return None,
                Some(node) if node.hash > hash => return None,
                Some(node) if node.hash == hash && node.key.borrow() == key => {
                    let value = node.value.load(Ordering::SeqCst, guard);
                    // safety: we loaded `value` under `guard`; a concurrent
                    // replacement defers destruction past the guard
                    return Some((&node.key, unsafe { value.deref() }));
                }
                Some(_) => {}
            }
            at = entry.next().load(Ordering::SeqCst, guard);
        }
    }

    /// Inserts `(key, value)` or replaces the value of an existing equal key.
    ///
    /// Runs under the shared lock: writers synchronize with each other purely
    /// through CAS, either on the predecessor's next pointer (insert) or on
    /// the node's value pointer (replace). A losing CAS re-runs the search
    /// against the fresh chain state.
    pub(crate) fn upsert<'g>(&self, hash: u64, key: K, value: V, guard: &'g Guard) -> Upsert<'g, V>
    where
        K: Eq,
    {
        let value = Owned::new(value).into_shared(guard);
        let node = Owned::new(BucketEntry::node(hash, key, Atomic::from(value))).into_shared(guard);
        // safety: the node is ours alone until the CAS below publishes it
        let key: &K = match unsafe { node.deref() } {
            BucketEntry::Node(n) => &n.key,
            BucketEntry::Fence(_) => unreachable!("freshly allocated entry is a node"),
        };

        let _read = self.lock.read();
        loop {
            let (prev, at, found) = self.search(hash, key, guard);
            if found {
                // safety: as in `pivot`
                let existing = match unsafe { at.deref() } {
                    BucketEntry::Node(n) => n,
                    BucketEntry::Fence(_) => unreachable!("search cannot match a fence"),
                };
                let current = existing.value.load(Ordering::SeqCst, guard);
                match existing.value.compare_exchange(
                    current,
                    value,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                ) {
                    Ok(_) => {
                        // the spare node shell was never published, so it can be
                        // freed directly; dropping its embedded `Atomic` does not
                        // free the value we just installed.
                        // safety: no other thread has seen `node`
                        drop(unsafe { node.into_owned() });
                        // safety: `current` is unreachable once swapped out; readers
                        // that already loaded it are pinned to earlier epochs
                        unsafe { guard.defer_destroy(current) };
                        return Upsert::Replaced(unsafe { current.deref() });
                    }
                    // someone replaced the value first; retry against it
                    Err(_) => continue,
                }
            }

            // a position for a new key: link prev -> node -> at
            // safety: as above, the node is still unpublished
            unsafe { node.deref() }.next().store(at, Ordering::SeqCst);
            // safety: as in `pivot`
            match unsafe { prev.deref() }.next().compare_exchange(
                at,
                node,
                Ordering::SeqCst,
                Ordering::SeqCst,
                guard,
            ) {
                Ok(_) => {
                    self.count.fetch_add(1, Ordering::SeqCst);
                    return Upsert::Inserted;
                }
                // a concurrent insert won the slot; retry from a fresh search
                Err(_) => continue,
            }
        }
    }

    /// Unlinks the node matching `(hash, key)` under the exclusive lock.
    ///
    /// A single CAS cannot atomically constrain both `prev -> node` and
    /// `node -> next`, so removal excludes all other writers instead.
    pub(crate) fn remove<'g, Q>(&self, key: &Q, hash: u64, guard: &'g Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let _write = self.lock.write();
        let (prev, at, found) = self.search(hash, key, guard);
        if !found {
            return None;
        }
        // safety: as in `pivot`
        let node = match unsafe { at.deref() } {
            BucketEntry::Node(n) => n,
            BucketEntry::Fence(_) => unreachable!("search cannot match a fence"),
        };
        let next = node.next.load(Ordering::SeqCst, guard);
        // safety: as in `pivot`
        unsafe { prev.deref() }.next().store(next, Ordering::SeqCst);
        self.count.fetch_sub(1, Ordering::SeqCst);

        let value = node.value.load(Ordering::SeqCst, guard);
        // safety: the node just left the chain and can no longer be reached;
        // readers that already hold it are pinned, so destruction is deferred
        // past their guards
        unsafe {
            guard.defer_destroy(at);
            guard.defer_destroy(value);
        }
        Some(unsafe { value.deref() })
    }

    /// Splits this bucket at `hash` and returns the new top-half bucket.
    ///
    /// Entries with hash `< hash` stay here; entries with hash `>= hash` move
    /// behind the new bucket's start fence. Cardinalities are reassigned from
    /// the counts observed during the walk.
    pub(crate) fn split(&self, hash: u64, guard: &Guard) -> Owned<Bucket<K, V>> {
        let _write = self.lock.write();
        let (prev, at, passed) = self.pivot(hash, guard);
        let top = Owned::new(Bucket::new(self.len().saturating_sub(passed), hash));
        let fence = top.fence.load(Ordering::SeqCst, guard);
        // safety: the new fence is not visible to anyone else yet, and `prev`/
        // `at` are chain entries as in `pivot`
        unsafe { fence.deref() }.next().store(at, Ordering::SeqCst);
        unsafe { prev.deref() }.next().store(fence, Ordering::SeqCst);
        self.count.store(passed, Ordering::SeqCst);
        top
    }

    /// Merges `other` (the bucket directly after this one) into this bucket.
    ///
    /// The caller serializes merges through the map's exclusive lock; the
    /// locks here are taken in directory order, self before other.
    pub(crate) fn merge(&self, other: &Bucket<K, V>, guard: &Guard) {
        let _self_write = self.lock.write();
        let _other_write = other.lock.write();
        self.count.fetch_add(other.len(), Ordering::SeqCst);

        let last = self.last(guard);
        let other_fence = other.start(guard);
        // safety: as in `pivot`
        let after = unsafe { other_fence.deref() }
            .next()
            .load(Ordering::SeqCst, guard);
        unsafe { last.deref() }.next().store(after, Ordering::SeqCst);
        // the merged-away start fence just left the chain
        // safety: unreachable from the chain; lingering readers are pinned
        unsafe { guard.defer_destroy(other_fence) };
    }

    /// The last node of this bucket's chain (the start fence if empty).
    fn last<'g>(&self, guard: &'g Guard) -> Shared<'g, BucketEntry<K, V>> {
        let mut curr = self.start(guard);
        // safety: as in `pivot`
        let mut next = unsafe { curr.deref() }.next().load(Ordering::SeqCst, guard);
        while !unsafe { next.deref() }.is_fence() {
            curr = next;
            next = unsafe { next.deref() }.next().load(Ordering::SeqCst, guard);
        }
        curr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch::{self as epoch};

    /// Links a fresh terminal fence behind the bucket's start fence.
    fn terminated(bucket: &Bucket<&'static str, usize>, guard: &Guard) {
        let terminal = Owned::new(BucketEntry::fence(u64::MAX)).into_shared(guard);
        unsafe { bucket.start(guard).deref() }
            .next()
            .store(terminal, Ordering::SeqCst);
    }

    /// Frees every entry reachable from `bucket`'s start fence, then the
    /// fence's bucket itself is left for `drop`.
    fn destroy_chain(bucket: &Bucket<&'static str, usize>, guard: &Guard) {
        let mut curr = bucket.start(guard);
        while !curr.is_null() {
            let next = unsafe { curr.deref() }.next().load(Ordering::SeqCst, guard);
            if let Some(node) = unsafe { curr.deref() }.as_node() {
                let value = node.value.load(Ordering::SeqCst, guard);
                drop(unsafe { value.into_owned() });
            }
            drop(unsafe { curr.into_owned() });
            curr = next;
        }
    }

    fn collect(bucket: &Bucket<&'static str, usize>, guard: &Guard) -> Vec<(u64, &'static str)> {
        let mut out = Vec::new();
        let mut at = unsafe { bucket.start(guard).deref() }
            .next()
            .load(Ordering::SeqCst, guard);
        while let Some(node) = unsafe { at.deref() }.as_node() {
            out.push((node.hash, node.key));
            at = node.next.load(Ordering::SeqCst, guard);
        }
        out
    }

    const ENTRIES: &[(u64, &str)] = &[
        (1, "1"),
        (10, "2"),
        (10, "3"),
        (10, "4"),
        (20, "5"),
        (u64::MAX, "6"),
        (u64::MAX, "7"),
    ];

    fn populated(guard: &Guard) -> Bucket<&'static str, usize> {
        let bucket = Bucket::new(0, 0);
        terminated(&bucket, guard);
        for (i, &(hash, key)) in ENTRIES.iter().enumerate() {
            assert!(matches!(
                bucket.upsert(hash, key, i, guard),
                Upsert::Inserted
            ));
        }
        bucket
    }

    #[test]
    fn upsert_get_and_order() {
        let guard = &epoch::pin();
        let bucket = populated(guard);
        assert_eq!(bucket.len(), ENTRIES.len());

        // every inserted key is retrievable
        for (i, &(hash, key)) in ENTRIES.iter().enumerate() {
            assert_eq!(bucket.get(key, hash, guard), Some(&i));
        }
        assert_eq!(bucket.get("missing", 10, guard), None);
        assert_eq!(bucket.get("1", 2, guard), None);

        // the chain is non-decreasing by hash with ties in insertion order
        let chain = collect(&bucket, guard);
        assert_eq!(
            chain,
            ENTRIES.iter().copied().collect::<Vec<_>>(),
            "chain must preserve hash order and insertion-order ties"
        );

        // replacing does not add a node
        assert!(matches!(
            bucket.upsert(10, "3", 33, guard),
            Upsert::Replaced(&2)
        ));
        assert_eq!(bucket.len(), ENTRIES.len());
        assert_eq!(bucket.get("3", 10, guard), Some(&33));

        destroy_chain(&bucket, guard);
    }

    #[test]
    fn search_cursors() {
        let guard = &epoch::pin();
        let bucket = populated(guard);

        // (hash, key, expected prev index into ENTRIES or fence, found)
        let cases: &[(u64, &str, Option<usize>, bool)] = &[
            (0, "0", None, false),
            (1, "1", None, true),
            (1, "collision", Some(0), false),
            (3, "new", Some(0), false),
            (10, "2", Some(0), true),
            (10, "3", Some(1), true),
            (10, "4", Some(2), true),
            (10, "collision", Some(3), false),
            (11, "new", Some(3), false),
            (20, "5", Some(3), true),
            (20, "collision", Some(4), false),
            (27, "new", Some(4), false),
            (u64::MAX, "6", Some(4), true),
            (u64::MAX, "7", Some(5), true),
            (u64::MAX, "new", Some(6), false),
        ];
        for &(hash, key, prev_idx, found) in cases {
            let (prev, _, was_found) = bucket.search(hash, &key, guard);
            assert_eq!(was_found, found, "search({hash}, {key})");
            let prev = unsafe { prev.deref() };
            match prev_idx {
                None => assert!(prev.is_fence()),
                Some(i) => {
                    assert_eq!(prev.hash(), ENTRIES[i].0);
                    assert_eq!(prev.as_node().unwrap().key, ENTRIES[i].1);
                }
            }
        }

        destroy_chain(&bucket, guard);
    }

    #[test]
    fn pivot_counts() {
        let guard = &epoch::pin();
        let bucket = populated(guard);

        let cases: &[(u64, usize)] = &[
            (0, 0),
            (1, 0),
            (3, 1),
            (10, 1),
            (11, 4),
            (20, 4),
            (27, 5),
            (u64::MAX, 5),
        ];
        for &(hash, expected) in cases {
            let (_, _, passed) = bucket.pivot(hash, guard);
            assert_eq!(passed, expected, "pivot({hash})");
        }

        destroy_chain(&bucket, guard);
    }

    #[test]
    fn split_and_merge_roundtrip() {
        let guard = &epoch::pin();
        let bucket = populated(guard);

        let top = bucket.split(11, guard);
        assert_eq!(bucket.len(), 4);
        assert_eq!(top.len(), 3);
        assert_eq!(
            collect(&bucket, guard),
            vec![(1, "1"), (10, "2"), (10, "3"), (10, "4")]
        );
        assert_eq!(
            collect(&top, guard),
            vec![(20, "5"), (u64::MAX, "6"), (u64::MAX, "7")]
        );
        // lookups route through the half that owns the hash range now
        assert_eq!(bucket.get("2", 10, guard), Some(&1));
        assert_eq!(top.get("5", 20, guard), Some(&4));

        bucket.merge(&top, guard);
        assert_eq!(bucket.len(), ENTRIES.len());
        assert_eq!(
            collect(&bucket, guard),
            ENTRIES.iter().copied().collect::<Vec<_>>()
        );

        destroy_chain(&bucket, guard);
    }

    #[test]
    fn remove_unlinks() {
        let guard = &epoch::pin();
        let bucket = populated(guard);

        assert_eq!(bucket.remove(&"3", 10, guard), Some(&2));
        assert_eq!(bucket.len(), ENTRIES.len() - 1);
        assert_eq!(bucket.get("3", 10, guard), None);
        assert_eq!(bucket.remove(&"3", 10, guard), None);
        // neighbors survive
        assert_eq!(bucket.get("2", 10, guard), Some(&1));
        assert_eq!(bucket.get("4", 10, guard), Some(&3));

        destroy_chain(&bucket, guard);
    }
}
