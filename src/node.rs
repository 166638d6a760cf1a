use crossbeam_epoch::Atomic;

/// An entry in a bucket chain.
///
/// The chain that backs the whole map is one globally hash-sorted singly
/// linked list. Entries come in two flavors: real key/value nodes, and
/// fences that mark where one bucket ends and the next begins. A fence is
/// recognized by its variant alone, so traversal never has to touch a
/// payload to find a bucket boundary.
#[derive(Debug)]
pub(crate) enum BucketEntry<K, V> {
    Node(HashNode<K, V>),
    Fence(Fence<K, V>),
}

/// Key-value entry.
#[derive(Debug)]
pub(crate) struct HashNode<K, V> {
    /// Hash of `key`, fixed for the life of the node.
    pub(crate) hash: u64,
    pub(crate) key: K,
    /// The mapped value. Replaced in place by CAS so updates never relink
    /// the chain.
    pub(crate) value: Atomic<V>,
    pub(crate) next: Atomic<BucketEntry<K, V>>,
}

/// Boundary marker.
///
/// A start fence's hash is the lower bound of its bucket's hash range; the
/// terminal fence carries `u64::MAX` and is the only entry whose `next` is
/// null.
#[derive(Debug)]
pub(crate) struct Fence<K, V> {
    pub(crate) hash: u64,
    pub(crate) next: Atomic<BucketEntry<K, V>>,
}

impl<K, V> BucketEntry<K, V> {
    pub(crate) fn node(hash: u64, key: K, value: Atomic<V>) -> Self {
        BucketEntry::Node(HashNode {
            hash,
            key,
            value,
            next: Atomic::null(),
        })
    }

    pub(crate) fn fence(hash: u64) -> Self {
        BucketEntry::Fence(Fence {
            hash,
            next: Atomic::null(),
        })
    }

    pub(crate) fn hash(&self) -> u64 {
        match self {
            BucketEntry::Node(node) => node.hash,
            BucketEntry::Fence(fence) => fence.hash,
        }
    }

    pub(crate) fn next(&self) -> &Atomic<BucketEntry<K, V>> {
        match self {
            BucketEntry::Node(node) => &node.next,
            BucketEntry::Fence(fence) => &fence.next,
        }
    }

    pub(crate) fn is_fence(&self) -> bool {
        matches!(self, BucketEntry::Fence(_))
    }

    pub(crate) fn as_node(&self) -> Option<&HashNode<K, V>> {
        if let BucketEntry::Node(ref node) = *self {
            Some(node)
        } else {
            None
        }
    }
}
