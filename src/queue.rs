use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Guard, Owned, Shared};

use crate::list::Node;

/// A lock-free FIFO queue.
///
/// The queue keeps a payload-free sentinel at its head; dequeuing CASes the
/// head forward and the unlinked sentinel's successor becomes both the new
/// sentinel and the source of the returned value. Enqueuing CASes the tail
/// node's successor from null to the new node, then advances the tail.
/// Because the tail may lag behind a committed enqueue, both operations help
/// advance it (always by CAS, so the tail only ever moves forward); this is
/// what lets retired sentinels be reclaimed without a tracing collector.
///
/// FIFO order is maintained for each producer's own elements; the
/// interleaving between producers follows the CAS winners.
///
/// # Examples
///
/// ```
/// use lockfree::Queue;
///
/// let queue = Queue::new();
/// let guard = queue.guard();
/// queue.enqueue(1, &guard);
/// queue.enqueue(2, &guard);
/// assert_eq!(queue.dequeue(&guard), Some(&1));
/// assert_eq!(queue.dequeue(&guard), Some(&2));
/// assert_eq!(queue.dequeue(&guard), None);
/// ```
pub struct Queue<T> {
    head: epoch::Atomic<Node<T>>,
    tail: epoch::Atomic<Node<T>>,
    count: AtomicUsize,
    collector: epoch::Collector,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Queue<T> {
    /// Creates an empty queue.
    pub fn new() -> Self {
        // safety: the queue is not shared with anyone during construction
        let guard = unsafe { epoch::unprotected() };
        let sentinel = Owned::new(Node::sentinel()).into_shared(guard);
        Queue {
            head: epoch::Atomic::from(sentinel),
            tail: epoch::Atomic::from(sentinel),
            count: AtomicUsize::new(0),
            collector: epoch::default_collector().clone(),
        }
    }

    /// Pin a [`Guard`] for use with this queue.
    pub fn guard(&self) -> epoch::Guard {
        self.collector.register().pin()
    }

    #[inline]
    fn check_guard(&self, guard: &Guard) {
        // guard.collector() is `None` if the guard is unprotected
        if let Some(c) = guard.collector() {
            assert_eq!(c, &self.collector);
        }
    }

    /// Number of values in the queue.
    ///
    /// The count trails the CAS that commits each enqueue or dequeue, so
    /// under contention it is an approximation of the instantaneous length.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns `true` if the queue holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Queue<T>
where
    T: 'static + Sync + Send,
{
    /// Appends `value` at the back of the queue.
    pub fn enqueue(&self, value: T, guard: &Guard) {
        self.check_guard(guard);
        let node = Owned::new(Node::new(value)).into_shared(guard);
        loop {
            let tail = self.tail.load(Ordering::SeqCst, guard);
            // safety: the tail is never null, and a retired node can only be
            // freed after every guard pinned at its unlink has dropped; the
            // helping CAS below keeps the tail off retired nodes entirely
            let t = unsafe { tail.deref() };
            let next = t.next.load(Ordering::SeqCst, guard);
            if !next.is_null() {
                // the tail lags behind a committed enqueue; help it forward
                // and retry from the new tail
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                );
                continue;
            }
            if t.next
                .compare_exchange(
                    Shared::null(),
                    node,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                )
                .is_ok()
            {
                // best effort: a helper may already have advanced the tail
                let _ = self.tail.compare_exchange(
                    tail,
                    node,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                );
                self.count.fetch_add(1, Ordering::SeqCst);
                return;
            }
        }
    }

    /// Removes the oldest value, or returns `None` if the queue is empty.
    pub fn dequeue<'g>(&self, guard: &'g Guard) -> Option<&'g T> {
        self.check_guard(guard);
        loop {
            let head = self.head.load(Ordering::SeqCst, guard);
            // safety: as in `enqueue`
            let h = unsafe { head.deref() };
            let next = h.next.load(Ordering::SeqCst, guard);
            let tail = self.tail.load(Ordering::SeqCst, guard);
            if head == tail {
                // safety: as in `enqueue`
                unsafe { next.as_ref() }?;
                // the tail lags behind a committed enqueue; push it forward
                // before touching the head, so the head never passes the
                // tail and a retired sentinel is never tail-reachable
                let _ = self.tail.compare_exchange(
                    tail,
                    next,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                    guard,
                );
                continue;
            }
            // the tail is strictly ahead, so the successor exists
            // safety: as in `enqueue`
            let n = unsafe { next.as_ref() }?;
            if self
                .head
                .compare_exchange(head, next, Ordering::SeqCst, Ordering::SeqCst, guard)
                .is_ok()
            {
                self.count.fetch_sub(1, Ordering::SeqCst);
                // safety: the old sentinel is strictly behind both the head
                // and the tail now, so no thread can reach it anymore;
                // lingering readers hold guards, so destruction is deferred
                // past them
                unsafe { guard.defer_destroy(head) };
                // `n` slides into the sentinel slot; its payload is returned
                // here and never read again
                return match n.value {
                    Some(ref value) => Some(value),
                    None => unreachable!("only the head sentinel lacks a value"),
                };
            }
        }
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue").field("len", &self.len()).finish()
    }
}

impl<T> Drop for Queue<T> {
    fn drop(&mut self) {
        // safety: we have &mut self; all returned references were tied to
        // guards borrowed from &self operations
        let guard = unsafe { epoch::unprotected() };
        let mut curr = self.head.load(Ordering::Relaxed, guard);
        while !curr.is_null() {
            // safety: still-linked nodes are owned by the queue alone here
            let next = unsafe { curr.deref() }.next.load(Ordering::Relaxed, guard);
            drop(unsafe { curr.into_owned() });
            curr = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let queue = Queue::new();
        let guard = queue.guard();
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.dequeue(&guard), None);

        let values = ["a", "1", "b", "2", "c", "3", "d", "4"];
        for (i, v) in values.iter().enumerate() {
            queue.enqueue(*v, &guard);
            assert_eq!(queue.len(), i + 1);
        }

        for (i, v) in values.iter().enumerate() {
            assert_eq!(queue.dequeue(&guard), Some(v));
            assert_eq!(queue.len(), values.len() - 1 - i);
        }
        assert_eq!(queue.dequeue(&guard), None);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn drain_and_refill() {
        let queue = Queue::new();
        let guard = queue.guard();
        for round in 0..3 {
            for i in 0..50 {
                queue.enqueue(round * 50 + i, &guard);
            }
            for i in 0..50 {
                assert_eq!(queue.dequeue(&guard), Some(&(round * 50 + i)));
            }
            assert_eq!(queue.dequeue(&guard), None);
        }
    }

    #[test]
    fn drop_frees_remaining_nodes() {
        let queue = Queue::new();
        let guard = queue.guard();
        for i in 0..100 {
            queue.enqueue(i, &guard);
        }
        drop(guard);
        drop(queue);
    }
}
