// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Single-producer/single-consumer append/pop queue.
//!
//! The list always starts at a dummy node: the most recently consumed node
//! plays that role, so neither side ever sees an empty-to-non-empty
//! transition. Consumed nodes are not freed by `pop`; they stay reachable from
//! the lagging `old` cursor until `clean` reclaims them.
//!
//! An `NbQueue` is owned by one thread. `split` turns it into a `Producer`
//! and a `Consumer` that can live on different threads; neither handle is
//! `Clone`, which is what keeps the single-producer/single-consumer contract.
//!
//! `peek` hands out `&T` from a shared node, so the handles that can peek are
//! only `Sync` when `T` is.

use crate::types::SimTime;
use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;

struct Node<T> {
    key: SimTime,
    /// `None` for dummies and for nodes already consumed.
    value: UnsafeCell<Option<T>>,
    next: AtomicPtr<Node<T>>,
}

impl<T> Node<T> {
    fn alloc(key: SimTime, value: Option<T>) -> *mut Node<T> {
        Box::into_raw(Box::new(Node {
            key,
            value: UnsafeCell::new(value),
            next: AtomicPtr::new(ptr::null_mut()),
        }))
    }
}

struct Shared<T> {
    // consumer side
    head: AtomicPtr<Node<T>>,
    old: AtomicPtr<Node<T>>,
    // producer side
    tail: AtomicPtr<Node<T>>,
    epoch: AtomicU32,
}

// Safety: the raw node pointers are only dereferenced under the SPSC
// discipline enforced by the handle types, and values only ever move out of
// the queue by `pop`, so sharing `Shared` between the two sides needs no more
// than `T: Send`. Handing out `&T` is gated by the handles below.
unsafe impl<T: Send> Send for Shared<T> {}
unsafe impl<T: Send> Sync for Shared<T> {}

/// Opts a handle out of the auto `Sync` impl.
type NotSync = PhantomData<Cell<()>>;

impl<T> Shared<T> {
    fn new() -> Self {
        let dummy = Node::alloc(SimTime::NEG_INFINITY, None);
        Self {
            head: AtomicPtr::new(dummy),
            old: AtomicPtr::new(dummy),
            tail: AtomicPtr::new(dummy),
            epoch: AtomicU32::new(0),
        }
    }

    /// Safety: the caller is the only producer.
    unsafe fn append(&self, key: SimTime, value: Option<T>) {
        let node = Node::alloc(key, value);
        let tail = self.tail.load(Ordering::Relaxed);
        (*tail).next.store(node, Ordering::Release);
        self.tail.store(node, Ordering::Relaxed);
    }

    /// Safety: the caller is the only consumer.
    unsafe fn pop(&self) -> Option<(SimTime, T)> {
        loop {
            let head = self.head.load(Ordering::Relaxed);
            let next = (*head).next.load(Ordering::Acquire);
            if next.is_null() {
                return None;
            }
            self.head.store(next, Ordering::Relaxed);
            if let Some(value) = (*(*next).value.get()).take() {
                return Some(((*next).key, value));
            }
        }
    }

    /// Safety: the caller is the only consumer and does not pop while the
    /// returned reference is alive.
    unsafe fn peek(&self) -> Option<(SimTime, &T)> {
        let mut cursor = (*self.head.load(Ordering::Relaxed)).next.load(Ordering::Acquire);
        while !cursor.is_null() {
            if let Some(value) = (*(*cursor).value.get()).as_ref() {
                return Some(((*cursor).key, value));
            }
            cursor = (*cursor).next.load(Ordering::Acquire);
        }
        None
    }

    /// Frees every node from `old` up to, not including, `head`.
    ///
    /// Safety: the caller is the only consumer.
    unsafe fn clean(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let mut cursor = self.old.load(Ordering::Relaxed);
        let mut freed = 0;
        while cursor != head {
            let next = (*cursor).next.load(Ordering::Acquire);
            drop(Box::from_raw(cursor));
            cursor = next;
            freed += 1;
        }
        self.old.store(head, Ordering::Relaxed);
        freed
    }

    /// Detaches everything after the dummy head and resets the queue.
    ///
    /// Safety: the caller is both the only producer and the only consumer.
    unsafe fn detach(&self) -> Option<(*mut Node<T>, *mut Node<T>)> {
        let head = self.head.load(Ordering::Relaxed);
        let first = (*head).next.load(Ordering::Acquire);
        if first.is_null() {
            return None;
        }
        let last = self.tail.load(Ordering::Relaxed);
        (*head).next.store(ptr::null_mut(), Ordering::Relaxed);
        self.tail.store(head, Ordering::Relaxed);
        Some((first, last))
    }

    /// Safety: the caller is the only producer; `first..=last` is a detached chain.
    unsafe fn splice(&self, first: *mut Node<T>, last: *mut Node<T>) {
        let tail = self.tail.load(Ordering::Relaxed);
        (*tail).next.store(first, Ordering::Release);
        self.tail.store(last, Ordering::Relaxed);
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let mut cursor = *self.old.get_mut();
        while !cursor.is_null() {
            // Safety: both handles are gone, every node from `old` on is ours.
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.next.load(Ordering::Relaxed);
        }
    }
}

/// An unsplit queue owned by one thread.
pub struct NbQueue<T> {
    shared: Arc<Shared<T>>,
    _not_sync: NotSync,
}

// Safety: `&NbQueue` only exposes `&T` through `peek`.
unsafe impl<T: Send + Sync> Sync for NbQueue<T> {}

impl<T> NbQueue<T> {
    pub fn new() -> Self {
        Self { shared: Arc::new(Shared::new()), _not_sync: PhantomData }
    }

    pub fn append(&mut self, value: T, key: SimTime) {
        // Safety: `&mut self` makes us the only producer and consumer.
        unsafe { self.shared.append(key, Some(value)) }
    }

    /// Appends a dummy node carrying `key` only. Skipped by `pop` and `peek`.
    pub fn append_marker(&mut self, key: SimTime) {
        unsafe { self.shared.append(key, None) }
    }

    pub fn pop(&mut self) -> Option<(SimTime, T)> {
        unsafe { self.shared.pop() }
    }

    pub fn peek(&self) -> Option<(SimTime, &T)> {
        unsafe { self.shared.peek() }
    }

    pub fn is_empty(&self) -> bool {
        self.peek().is_none()
    }

    pub fn clean(&mut self) -> usize {
        unsafe { self.shared.clean() }
    }

    pub fn epoch(&self) -> u32 {
        self.shared.epoch.load(Ordering::Acquire)
    }

    pub fn set_epoch(&self, epoch: u32) {
        self.shared.epoch.store(epoch, Ordering::Release);
    }

    /// Pops everything, in order, and reclaims the consumed nodes.
    pub fn drain(&mut self) -> Vec<(SimTime, T)> {
        let mut out = Vec::new();
        while let Some(item) = self.pop() {
            out.push(item);
        }
        self.clean();
        out
    }

    pub fn split(self) -> (Producer<T>, Consumer<T>) {
        (Producer { shared: self.shared.clone() }, Consumer { shared: self.shared, _not_sync: PhantomData })
    }
}

impl<T> Default for NbQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for NbQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NbQueue").field("epoch", &self.epoch()).field("empty", &self.is_empty()).finish()
    }
}

/// Appending half of a split queue.
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Producer<T> {
    pub fn append(&mut self, value: T, key: SimTime) {
        unsafe { self.shared.append(key, Some(value)) }
    }

    pub fn append_marker(&mut self, key: SimTime) {
        unsafe { self.shared.append(key, None) }
    }

    /// Splices every pending element of `source` onto this queue's tail and
    /// leaves `source` empty and reusable.
    pub fn merge(&mut self, source: &mut NbQueue<T>) {
        unsafe {
            if let Some((first, last)) = source.shared.detach() {
                self.shared.splice(first, last);
            }
        }
    }

    pub fn epoch(&self) -> u32 {
        self.shared.epoch.load(Ordering::Acquire)
    }

    pub fn set_epoch(&self, epoch: u32) {
        self.shared.epoch.store(epoch, Ordering::Release);
    }
}

/// Popping half of a split queue.
///
/// A consumer of values that cannot be shared is not `Sync` either:
///
/// ```compile_fail
/// use std::cell::Cell;
/// use timewarp_kernel::io::Consumer;
///
/// fn assert_sync<T: Sync>() {}
/// assert_sync::<Consumer<Cell<u32>>>();
/// ```
pub struct Consumer<T> {
    shared: Arc<Shared<T>>,
    _not_sync: NotSync,
}

// Safety: `&Consumer` only exposes `&T` through `peek`.
unsafe impl<T: Send + Sync> Sync for Consumer<T> {}

impl<T> Consumer<T> {
    pub fn pop(&mut self) -> Option<(SimTime, T)> {
        unsafe { self.shared.pop() }
    }

    pub fn peek(&self) -> Option<(SimTime, &T)> {
        unsafe { self.shared.peek() }
    }

    pub fn peek_key(&self) -> Option<SimTime> {
        self.peek().map(|(key, _)| key)
    }

    pub fn clean(&mut self) -> usize {
        unsafe { self.shared.clean() }
    }

    pub fn epoch(&self) -> u32 {
        self.shared.epoch.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn t(v: u32) -> SimTime {
        SimTime::from(v)
    }

    #[test]
    fn test_fifo_order_and_empty_pop() {
        let mut q = NbQueue::new();
        assert!(q.pop().is_none());
        q.append("a", t(1));
        q.append("b", t(2));
        assert_eq!(q.peek().map(|(k, v)| (k, *v)), Some((t(1), "a")));
        assert_eq!(q.pop(), Some((t(1), "a")));
        assert_eq!(q.pop(), Some((t(2), "b")));
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_markers_are_skipped() {
        let mut q = NbQueue::new();
        q.append_marker(t(0));
        q.append(7u32, t(3));
        q.append_marker(SimTime::INFINITY);
        assert_eq!(q.peek().map(|(k, _)| k), Some(t(3)));
        assert_eq!(q.pop(), Some((t(3), 7)));
        assert!(q.pop().is_none());
        assert!(q.is_empty());
    }

    #[test]
    fn test_merge_resets_source() {
        let mut window = NbQueue::new();
        window.append(1u32, t(1));
        window.append(2u32, t(2));

        let (mut producer, mut consumer) = NbQueue::new().split();
        producer.append(0u32, t(0));
        producer.merge(&mut window);

        assert!(window.is_empty());
        window.append(9, t(9));
        assert_eq!(window.pop(), Some((t(9), 9)));

        let got: Vec<u32> = std::iter::from_fn(|| consumer.pop().map(|(_, v)| v)).collect();
        assert_eq!(got, vec![0, 1, 2]);
    }

    #[test]
    fn test_merge_of_empty_source_is_noop() {
        let mut window: NbQueue<u32> = NbQueue::new();
        let (mut producer, mut consumer) = NbQueue::new().split();
        producer.merge(&mut window);
        producer.append(5, t(5));
        assert_eq!(consumer.pop(), Some((t(5), 5)));
    }

    #[test]
    fn test_clean_frees_consumed_nodes_only() {
        let mut q = NbQueue::new();
        for i in 0..5u32 {
            q.append(i, t(i));
        }
        q.pop();
        q.pop();
        // initial dummy plus the first consumed node; the second is the new head
        assert_eq!(q.clean(), 2);
        assert_eq!(q.clean(), 0);
        assert_eq!(q.pop(), Some((t(2), 2)));
    }

    #[test]
    fn test_epoch_tag() {
        let q: NbQueue<u8> = NbQueue::new();
        assert_eq!(q.epoch(), 0);
        q.set_epoch(3);
        let (producer, consumer) = q.split();
        assert_eq!(producer.epoch(), 3);
        assert_eq!(consumer.epoch(), 3);
    }

    #[test]
    fn test_spsc_across_threads() {
        let (mut producer, mut consumer) = NbQueue::new().split();
        let writer = thread::spawn(move || {
            for i in 0..10_000u32 {
                producer.append(i, t(i));
            }
        });
        let mut expected = 0u32;
        while expected < 10_000 {
            if let Some((_, v)) = consumer.pop() {
                assert_eq!(v, expected, "values must come out in append order");
                expected += 1;
                if expected % 1000 == 0 {
                    consumer.clean();
                }
            }
        }
        writer.join().unwrap();
    }

    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}

    #[test]
    fn test_handles_share_only_shareable_values() {
        assert_send::<Consumer<Cell<u32>>>();
        assert_send::<NbQueue<Cell<u32>>>();
        assert_send::<Producer<Cell<u32>>>();
        assert_sync::<Producer<Cell<u32>>>();
        assert_sync::<Consumer<u32>>();
        assert_sync::<NbQueue<u32>>();
    }

    #[test]
    fn test_drop_releases_unpopped_values() {
        let tracker = Arc::new(());
        {
            let mut q = NbQueue::new();
            for i in 0..4u32 {
                q.append(tracker.clone(), t(i));
            }
            q.pop();
        }
        assert_eq!(Arc::strong_count(&tracker), 1);
    }
}
