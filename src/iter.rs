use std::sync::atomic::Ordering;

use crossbeam_epoch::{Atomic, Guard, Shared};
use parking_lot::RwLockWriteGuard;

use crate::bucket::Bucket;
use crate::key::Key;
use crate::map::HashMap;
use crate::node::BucketEntry;

/// A cursor over a map's entries, in bucket-then-chain order.
///
/// See [`HashMap::iter`] for details. The cursor owns the map's exclusive
/// lock for as long as it lives, so the entries it yields are exactly the
/// live entries of the map at lock acquisition. Once the cursor has yielded
/// `None` it keeps yielding `None`.
pub struct Iter<'g, K, V> {
    /// Holding this write guard is what makes the walk safe against
    /// concurrent writers; dropping the cursor releases the map.
    directory: RwLockWriteGuard<'g, Vec<Atomic<Bucket<K, V>>>>,
    guard: &'g Guard,
    /// Index of the bucket the cursor is currently inside.
    index: usize,
    /// The entry most recently yielded (initially the first start fence).
    curr: Shared<'g, BucketEntry<K, V>>,
}

impl<'g, K, V> Iter<'g, K, V>
where
    K: 'static + Sync + Send + Key,
    V: 'static + Sync + Send,
{
    pub(crate) fn new(map: &'g HashMap<K, V>, guard: &'g Guard) -> Self {
        let directory = map.directory.write();
        let first = directory[0].load(Ordering::SeqCst, guard);
        // safety: directory slots always hold live buckets
        let curr = unsafe { first.deref() }.start(guard);
        Iter {
            directory,
            guard,
            index: 0,
            curr,
        }
    }
}

impl<K, V> std::fmt::Debug for Iter<'_, K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iter")
            .field("bucket", &self.index)
            .finish()
    }
}

impl<'g, K, V> Iterator for Iter<'g, K, V> {
    type Item = (&'g K, &'g V);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            // safety: chain entries are only freed after all pinned guards
            // drop, and we loaded every pointer under `self.guard`
            let next = unsafe { self.curr.deref() }
                .next()
                .load(Ordering::SeqCst, self.guard);
            let entry = unsafe { next.deref() };
            match entry.as_node() {
                Some(node) => {
                    self.curr = next;
                    let value = node.value.load(Ordering::SeqCst, self.guard);
                    // safety: as above; replaced values are also deferred
                    return Some((&node.key, unsafe { value.deref() }));
                }
                None => {
                    // a fence: either the next bucket starts here, or this
                    // was the last bucket and we leave the cursor in place
                    // so further calls keep returning `None`
                    if self.index + 1 == self.directory.len() {
                        return None;
                    }
                    self.index += 1;
                    self.curr = next;
                }
            }
        }
    }
}

/// An iterator over a map's keys.
///
/// See [`HashMap::keys`] for details; like [`Iter`], it owns the map's
/// exclusive lock.
pub struct Keys<'g, K, V> {
    pub(crate) inner: Iter<'g, K, V>,
}

impl<K, V> std::fmt::Debug for Keys<'_, K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keys").finish_non_exhaustive()
    }
}

impl<'g, K, V> Iterator for Keys<'g, K, V> {
    type Item = &'g K;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, _)| k)
    }
}

/// An iterator over a map's values.
///
/// See [`HashMap::values`] for details; like [`Iter`], it owns the map's
/// exclusive lock.
pub struct Values<'g, K, V> {
    pub(crate) inner: Iter<'g, K, V>,
}

impl<K, V> std::fmt::Debug for Values<'_, K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Values").finish_non_exhaustive()
    }
}

impl<'g, K, V> Iterator for Values<'g, K, V> {
    type Item = &'g V;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(_, v)| v)
    }
}
