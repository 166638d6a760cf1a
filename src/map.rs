use std::borrow::Borrow;
use std::fmt::{self, Debug, Formatter};
use std::iter::FromIterator;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::bucket::{Bucket, Upsert};
use crate::iter::{Iter, Keys, Values};
use crate::key::Key;
use crate::node::BucketEntry;

/// Target average bucket length used by [`HashMap::new`].
const DEFAULT_BUCKET_SIZE: u8 = 24;

/// Smallest accepted target average bucket length; lower settings clamp here.
const MIN_BUCKET_SIZE: u8 = 6;

/// Shrinking never reduces the directory below `2^MIN_DEPTH` buckets.
const MIN_DEPTH: u32 = 4;

/// A concurrent hash map.
///
/// The map is one globally hash-sorted linked list, cut into buckets by
/// fence entries; a directory of `2^B` pointers routes each hash to its
/// bucket. The common write path — inserting or updating one entry — takes
/// no exclusive lock anywhere: it holds the bucket's lock in shared mode and
/// commits by CAS on a chain pointer. Only removal and structural reshaping
/// (splitting or merging buckets as the map grows and shrinks) lock a bucket
/// exclusively, and only iteration locks the whole map.
///
/// Memory reclamation is epoch-based. Operations take a [`Guard`] acquired
/// from [`HashMap::guard`], and references returned by
/// [`get`](HashMap::get), [`insert`](HashMap::insert), and
/// [`remove`](HashMap::remove) stay valid for the guard's lifetime, even if
/// the entry is concurrently removed. Holding a guard for a long time delays
/// reclamation of everything unlinked since it was pinned.
///
/// Keys implement [`Key`], which produces a 64-bit hash keyed by two secret
/// per-map subkeys drawn from the OS CSPRNG at construction.
///
/// # Examples
///
/// ```
/// use lockfree::HashMap;
///
/// let map = HashMap::new();
/// let guard = map.guard();
/// map.insert(1u32, "one", &guard);
/// assert_eq!(map.get(&1u32, &guard), Some(&"one"));
/// assert_eq!(map.len(), 1);
/// ```
pub struct HashMap<K, V> {
    /// The bucket directory; `2^depth` live slots outside of a resize.
    pub(crate) directory: RwLock<Vec<Atomic<Bucket<K, V>>>>,

    /// log2 of the directory length. Written only while the directory is
    /// exclusively locked.
    depth: AtomicU32,

    /// Number of entries in the map.
    count: AtomicUsize,

    /// Hash subkeys. Generated once per map and never shared between maps,
    /// so hash values cannot be predicted across instances.
    k0: u64,
    k1: u64,

    /// Target average bucket length: the map grows once `count >> depth`
    /// exceeds it and shrinks once `count >> depth` falls to a third of it.
    bucket_size: u8,

    /// Collector that all guards used with this map must belong to;
    /// see [`HashMap::guard`].
    collector: epoch::Collector,
}

impl<K, V> Default for HashMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> HashMap<K, V> {
    /// Creates an empty map with the default target bucket length.
    pub fn new() -> Self {
        Self::with_bucket_size(DEFAULT_BUCKET_SIZE)
    }

    /// Creates an empty map that splits buckets once they average
    /// `bucket_size` entries. Values below 6 are clamped to 6.
    ///
    /// Larger values trade longer chain walks for a smaller directory and
    /// fewer splits.
    pub fn with_bucket_size(bucket_size: u8) -> Self {
        let bucket = Bucket::new(0, 0);
        // safety: the map is not shared with anyone during construction
        let guard = unsafe { epoch::unprotected() };
        // the initial chain is the first bucket's start fence followed by
        // the terminal fence
        let terminal = Owned::new(BucketEntry::fence(u64::MAX)).into_shared(guard);
        // safety: the start fence was just allocated by `Bucket::new`
        unsafe { bucket.start(guard).deref() }
            .next()
            .store(terminal, Ordering::SeqCst);

        Self {
            directory: RwLock::new(vec![Atomic::new(bucket)]),
            depth: AtomicU32::new(0),
            count: AtomicUsize::new(0),
            k0: OsRng.next_u64(),
            k1: OsRng.next_u64(),
            bucket_size: bucket_size.max(MIN_BUCKET_SIZE),
            collector: epoch::default_collector().clone(),
        }
    }

    /// Pin a [`Guard`] for use with this map.
    ///
    /// Keep in mind that for as long as you hold onto this guard, you are
    /// preventing the collection of garbage generated by the map.
    pub fn guard(&self) -> epoch::Guard {
        self.collector.register().pin()
    }

    #[inline]
    pub(crate) fn check_guard(&self, guard: &Guard) {
        // guard.collector() is `None` if the guard is unprotected
        if let Some(c) = guard.collector() {
            assert_eq!(c, &self.collector);
        }
    }

    /// Returns the number of entries in the map.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns `true` if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_overflow(&self) -> bool {
        self.count.load(Ordering::SeqCst) >> self.depth.load(Ordering::SeqCst)
            > self.bucket_size as usize
    }

    fn is_underflow(&self) -> bool {
        let depth = self.depth.load(Ordering::SeqCst);
        depth > MIN_DEPTH
            && self.count.load(Ordering::SeqCst) >> depth <= (self.bucket_size / 3) as usize
    }

    #[cfg(test)]
    pub(crate) fn depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }
}

impl<K, V> HashMap<K, V>
where
    K: 'static + Sync + Send + Key,
    V: 'static + Sync + Send,
{
    fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: ?Sized + Key,
    {
        key.sum64(self.k0, self.k1)
    }

    /// Loads the bucket responsible for `hash`.
    ///
    /// The directory's shared lock is held only for the load-and-index step;
    /// the returned reference stays valid for the guard's lifetime because a
    /// bucket is retired only after a shrink has unlinked it from the
    /// directory.
    fn bucket<'g>(&self, hash: u64, guard: &'g Guard) -> &'g Bucket<K, V> {
        let directory = self.directory.read();
        let depth = self.depth.load(Ordering::Relaxed);
        let index = hash.checked_shr(64 - depth).unwrap_or(0) as usize;
        let bucket = directory[index].load(Ordering::SeqCst, guard);
        // safety: loaded under `guard`, and destruction of an unlinked
        // bucket is deferred past every pinned guard
        unsafe { bucket.deref() }
    }

    /// Returns the value mapped to `key`, or `None`.
    ///
    /// The key may be any borrowed form of the map's key type, as long as
    /// [`Key`] and `Eq` on the borrowed form hash and compare identically.
    pub fn get<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Key,
    {
        self.check_guard(guard);
        let hash = self.hash(key);
        self.bucket(hash, guard).get(key, hash, guard)
    }

    /// Returns the key-value pair corresponding to `key`, or `None`.
    ///
    /// The returned key is the one stored in the map, which may matter when
    /// the lookup went through a borrowed form.
    pub fn get_key_value<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<(&'g K, &'g V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Key,
    {
        self.check_guard(guard);
        let hash = self.hash(key);
        self.bucket(hash, guard).get_key_value(key, hash, guard)
    }

    /// Tests if `key` is present in the map.
    pub fn contains_key<Q>(&self, key: &Q, guard: &Guard) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Key,
    {
        self.get(key, guard).is_some()
    }

    /// Maps `key` to `value`, returning the previous value if the key was
    /// already present.
    pub fn insert<'g>(&'g self, key: K, value: V, guard: &'g Guard) -> Option<&'g V> {
        self.check_guard(guard);
        let hash = self.hash(&key);
        let replaced = match self.bucket(hash, guard).upsert(hash, key, value, guard) {
            Upsert::Inserted => {
                self.count.fetch_add(1, Ordering::SeqCst);
                None
            }
            Upsert::Replaced(old) => Some(old),
        };

        if self.is_overflow() {
            self.expand(guard);
        }
        replaced
    }

    /// Removes `key` from the map, returning the value it mapped to.
    pub fn remove<'g, Q>(&'g self, key: &Q, guard: &'g Guard) -> Option<&'g V>
    where
        K: Borrow<Q>,
        Q: ?Sized + Key,
    {
        self.check_guard(guard);
        let hash = self.hash(key);
        let removed = self.bucket(hash, guard).remove(key, hash, guard)?;
        self.count.fetch_sub(1, Ordering::SeqCst);

        if self.is_underflow() {
            self.shrink(guard);
        }
        Some(removed)
    }

    /// Iterates over the map while holding it exclusively.
    ///
    /// The returned cursor owns the map's exclusive lock: every other
    /// operation blocks until it is dropped, and calling any operation on
    /// this map from the same thread while the cursor is alive will
    /// deadlock. Entries are yielded in bucket-then-chain order, which is
    /// not a stable order across maps.
    pub fn iter<'g>(&'g self, guard: &'g Guard) -> Iter<'g, K, V> {
        self.check_guard(guard);
        Iter::new(self, guard)
    }

    /// Iterates over the map's keys under the map's exclusive lock; see
    /// [`HashMap::iter`].
    pub fn keys<'g>(&'g self, guard: &'g Guard) -> Keys<'g, K, V> {
        Keys {
            inner: self.iter(guard),
        }
    }

    /// Iterates over the map's values under the map's exclusive lock; see
    /// [`HashMap::iter`].
    pub fn values<'g>(&'g self, guard: &'g Guard) -> Values<'g, K, V> {
        Values {
            inner: self.iter(guard),
        }
    }

    /// Calls `f` on every entry under the map's exclusive lock, stopping at
    /// the first failure and propagating it. The lock is released on every
    /// exit path.
    pub fn iterate<F, E>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&K, &V) -> Result<(), E>,
    {
        let guard = self.guard();
        let mut iter = self.iter(&guard);
        while let Some((k, v)) = iter.next() {
            f(k, v)?;
        }
        Ok(())
    }

    /// Doubles the directory, splitting every bucket at the midpoint of its
    /// hash range.
    fn expand(&self, guard: &Guard) {
        let mut directory = self.directory.write();
        // re-check: another writer may have expanded while we waited
        if !self.is_overflow() {
            return;
        }

        let depth = self.depth.load(Ordering::SeqCst) + 1;
        self.depth.store(depth, Ordering::SeqCst);

        // split from the top slot down: each old bucket keeps the bottom
        // half of its range at slot 2i and spawns a sibling for the top
        // half at slot 2i + 1
        let old = std::mem::take(&mut *directory);
        let mut grown: Vec<Atomic<Bucket<K, V>>> =
            (0..old.len() * 2).map(|_| Atomic::null()).collect();
        for (i, slot) in old.into_iter().enumerate().rev() {
            let bucket = slot.load(Ordering::SeqCst, guard);
            let pivot = (2 * i as u64 + 1) << (64 - depth);
            // safety: directory slots always hold live buckets
            let top = unsafe { bucket.deref() }.split(pivot, guard);
            grown[2 * i] = Atomic::from(bucket);
            grown[2 * i + 1] = Atomic::from(top);
        }
        *directory = grown;
    }

    /// Merges bucket pairs and halves the directory.
    fn shrink(&self, guard: &Guard) {
        let mut directory = self.directory.write();
        // re-check: another writer may have shrunk while we waited
        if !self.is_underflow() {
            return;
        }

        let old = std::mem::take(&mut *directory);
        let mut shrunk = Vec::with_capacity(old.len() / 2);
        for pair in old.chunks(2) {
            let even = pair[0].load(Ordering::SeqCst, guard);
            let odd = pair[1].load(Ordering::SeqCst, guard);
            // safety: directory slots always hold live buckets
            unsafe { even.deref() }.merge(unsafe { odd.deref() }, guard);
            // the odd bucket has left the directory; readers that still
            // hold it are pinned, so destruction is deferred past them
            unsafe { guard.defer_destroy(odd) };
            shrunk.push(Atomic::from(even));
        }
        *directory = shrunk;
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<K, V> Drop for HashMap<K, V> {
    fn drop(&mut self) {
        // safety: we have &mut self, and every reference handed out was
        // bound to a guard borrowed alongside &self, so nothing can still
        // point into the map
        let guard = unsafe { epoch::unprotected() };
        let directory = self.directory.get_mut();

        // walk the whole chain once, freeing values, nodes, and fences
        let first = directory[0].load(Ordering::Relaxed, guard);
        // safety: directory slots always hold live buckets
        let mut curr = unsafe { first.deref() }.start(guard);
        while !curr.is_null() {
            // safety: the chain is exclusively ours now
            let entry = unsafe { curr.deref() };
            let next = entry.next().load(Ordering::Relaxed, guard);
            if let Some(node) = entry.as_node() {
                let value = node.value.load(Ordering::Relaxed, guard);
                drop(unsafe { value.into_owned() });
            }
            drop(unsafe { curr.into_owned() });
            curr = next;
        }

        for slot in directory.drain(..) {
            // safety: each slot owns its bucket allocation
            drop(unsafe { slot.into_owned() });
        }
    }
}

impl<K, V> Debug for HashMap<K, V>
where
    K: 'static + Sync + Send + Key + Debug,
    V: 'static + Sync + Send + Debug,
{
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let guard = self.guard();
        f.debug_map().entries(self.iter(&guard)).finish()
    }
}

impl<K, V> FromIterator<(K, V)> for HashMap<K, V>
where
    K: 'static + Sync + Send + Key,
    V: 'static + Sync + Send,
{
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let map = Self::new();
        {
            let guard = map.guard();
            for (key, value) in iter {
                map.insert(key, value, &guard);
            }
        }
        map
    }
}

impl<K, V> Extend<(K, V)> for &HashMap<K, V>
where
    K: 'static + Sync + Send + Key,
    V: 'static + Sync + Send,
{
    fn extend<T: IntoIterator<Item = (K, V)>>(&mut self, iter: T) {
        let guard = self.guard();
        for (key, value) in iter {
            self.insert(key, value, &guard);
        }
    }
}
