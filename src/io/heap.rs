// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Binary heap over queues.
//!
//! Entries are queues, keyed by the timestamp at their head. Polling pops from
//! the root queue and re-derives that slot's key from the queue's new head.

use super::queue::Consumer;
use crate::error::{KernelError, Result};
use crate::types::{LpId, SimTime};
use rustc_hash::FxHashMap;

/// A queue the heap can order by its head.
pub trait KeyedQueue {
    type Item;

    fn head_key(&self) -> Option<SimTime>;

    /// The head item, left in place.
    fn peek_item(&self) -> Option<(SimTime, &Self::Item)>;

    fn pop_item(&mut self) -> Option<(SimTime, Self::Item)>;
}

impl<T> KeyedQueue for Consumer<T> {
    type Item = T;

    fn head_key(&self) -> Option<SimTime> {
        self.peek_key()
    }

    fn peek_item(&self) -> Option<(SimTime, &T)> {
        self.peek()
    }

    fn pop_item(&mut self) -> Option<(SimTime, T)> {
        self.pop()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeapOrder {
    Min,
    Max,
}

struct HeapEntry<Q> {
    key: SimTime,
    owner: LpId,
    queue: Q,
}

pub struct IoHeap<Q: KeyedQueue> {
    entries: Vec<HeapEntry<Q>>,
    positions: FxHashMap<LpId, usize>,
    order: HeapOrder,
}

const INITIAL_CAPACITY: usize = 8;

impl<Q: KeyedQueue> IoHeap<Q> {
    pub fn new(order: HeapOrder) -> Self {
        Self { entries: Vec::with_capacity(INITIAL_CAPACITY), positions: FxHashMap::default(), order }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Doubles the backing array.
    pub fn grow(&mut self) -> Result<()> {
        let extra = self.entries.capacity().max(INITIAL_CAPACITY);
        self.entries
            .try_reserve(extra)
            .map_err(|_| KernelError::ResourceExhausted("ordering heap array"))
    }

    pub fn insert(&mut self, owner: LpId, queue: Q) -> Result<()> {
        if self.entries.len() == self.entries.capacity() {
            self.grow()?;
        }
        let key = self.derive_key(&queue);
        let idx = self.entries.len();
        self.entries.push(HeapEntry { key, owner, queue });
        self.positions.insert(owner, idx);
        self.sift_up(idx);
        Ok(())
    }

    /// Key of the root queue. Empty queues key to the identity of the order.
    pub fn peek_key(&self) -> Option<SimTime> {
        self.entries.first().map(|e| e.key)
    }

    /// Head item of the root queue, without consuming it.
    pub fn peek_item(&self) -> Option<(LpId, SimTime, &Q::Item)> {
        let root = self.entries.first()?;
        let (key, item) = root.queue.peek_item()?;
        Some((root.owner, key, item))
    }

    /// Pops one item from the root queue and re-keys the root slot.
    pub fn poll(&mut self) -> Option<(LpId, SimTime, Q::Item)> {
        let root = self.entries.first_mut()?;
        let (key, item) = root.queue.pop_item()?;
        let owner = root.owner;
        let old = root.key;
        let new = match root.queue.head_key() {
            Some(k) => k,
            None => self.empty_key(),
        };
        self.entries[0].key = new;
        self.resettle(0, old, new);
        Some((owner, key, item))
    }

    /// Re-derives the key of `owner`'s queue after it changed outside the heap.
    pub fn update_key(&mut self, owner: LpId) -> bool {
        let Some(&idx) = self.positions.get(&owner) else {
            return false;
        };
        let old = self.entries[idx].key;
        let new = self.derive_key(&self.entries[idx].queue);
        self.entries[idx].key = new;
        self.resettle(idx, old, new);
        true
    }

    pub fn queue_mut(&mut self, owner: LpId) -> Option<&mut Q> {
        let idx = *self.positions.get(&owner)?;
        Some(&mut self.entries[idx].queue)
    }

    pub fn queues_mut(&mut self) -> impl Iterator<Item = &mut Q> {
        self.entries.iter_mut().map(|e| &mut e.queue)
    }

    fn empty_key(&self) -> SimTime {
        match self.order {
            HeapOrder::Min => SimTime::INFINITY,
            HeapOrder::Max => SimTime::NEG_INFINITY,
        }
    }

    fn derive_key(&self, queue: &Q) -> SimTime {
        queue.head_key().unwrap_or_else(|| self.empty_key())
    }

    fn before(&self, a: SimTime, b: SimTime) -> bool {
        match self.order {
            HeapOrder::Min => a < b,
            HeapOrder::Max => a > b,
        }
    }

    fn resettle(&mut self, idx: usize, old: SimTime, new: SimTime) {
        if self.before(new, old) {
            self.sift_up(idx);
        } else {
            self.sift_down(idx);
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.positions.insert(self.entries[a].owner, a);
        self.positions.insert(self.entries[b].owner, b);
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if !self.before(self.entries[idx].key, self.entries[parent].key) {
                break;
            }
            self.swap(idx, parent);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * idx + 1;
            let right = left + 1;
            let mut best = idx;
            if left < len && self.before(self.entries[left].key, self.entries[best].key) {
                best = left;
            }
            if right < len && self.before(self.entries[right].key, self.entries[best].key) {
                best = right;
            }
            if best == idx {
                break;
            }
            self.swap(idx, best);
            idx = best;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::queue::NbQueue;
    use std::collections::VecDeque;

    struct VecQueue(VecDeque<(SimTime, u32)>);

    impl KeyedQueue for VecQueue {
        type Item = u32;

        fn head_key(&self) -> Option<SimTime> {
            self.0.front().map(|(k, _)| *k)
        }

        fn peek_item(&self) -> Option<(SimTime, &u32)> {
            self.0.front().map(|(k, v)| (*k, v))
        }

        fn pop_item(&mut self) -> Option<(SimTime, u32)> {
            self.0.pop_front()
        }
    }

    fn vq(keys: &[u32]) -> VecQueue {
        VecQueue(keys.iter().map(|&k| (SimTime::from(k), k)).collect())
    }

    #[test]
    fn test_poll_merges_queues_in_key_order() {
        let mut heap = IoHeap::new(HeapOrder::Min);
        heap.insert(LpId(0), vq(&[5, 9])).unwrap();
        heap.insert(LpId(1), vq(&[3, 7])).unwrap();
        heap.insert(LpId(2), vq(&[])).unwrap();

        let mut seen = Vec::new();
        while let Some((_, _, v)) = heap.poll() {
            seen.push(v);
        }
        assert_eq!(seen, vec![3, 5, 7, 9]);
        assert_eq!(heap.peek_key(), Some(SimTime::INFINITY));
    }

    #[test]
    fn test_peek_item_leaves_root_in_place() {
        let mut heap = IoHeap::new(HeapOrder::Min);
        heap.insert(LpId(0), vq(&[6])).unwrap();
        heap.insert(LpId(1), vq(&[2, 4])).unwrap();

        assert_eq!(heap.peek_item().map(|(o, k, v)| (o, k, *v)), Some((LpId(1), SimTime::from(2), 2)));
        assert_eq!(heap.peek_item().map(|(_, _, v)| *v), Some(2));
        assert_eq!(heap.poll().map(|(_, _, v)| v), Some(2));
        assert_eq!(heap.peek_item().map(|(o, _, v)| (o, *v)), Some((LpId(1), 4)));
    }

    #[test]
    fn test_max_order() {
        let mut heap = IoHeap::new(HeapOrder::Max);
        heap.insert(LpId(0), vq(&[1])).unwrap();
        heap.insert(LpId(1), vq(&[4])).unwrap();
        assert_eq!(heap.peek_key(), Some(SimTime::from(4)));
    }

    #[test]
    fn test_update_key_after_external_append() {
        let mut heap = IoHeap::new(HeapOrder::Min);
        let (mut p0, c0) = NbQueue::new().split();
        let (mut p1, c1) = NbQueue::new().split();
        heap.insert(LpId(0), c0).unwrap();
        heap.insert(LpId(1), c1).unwrap();
        assert_eq!(heap.peek_key(), Some(SimTime::INFINITY));

        p1.append("late", SimTime::from(8));
        p0.append("early", SimTime::from(2));
        assert!(heap.update_key(LpId(1)));
        assert_eq!(heap.peek_key(), Some(SimTime::from(8)));
        assert!(heap.update_key(LpId(0)));
        assert_eq!(heap.peek_key(), Some(SimTime::from(2)));
        assert!(!heap.update_key(LpId(7)));

        assert_eq!(heap.poll().map(|(o, _, v)| (o, v)), Some((LpId(0), "early")));
        assert_eq!(heap.poll().map(|(o, _, v)| (o, v)), Some((LpId(1), "late")));
    }

    #[test]
    fn test_grows_past_initial_capacity() {
        let mut heap = IoHeap::new(HeapOrder::Min);
        for i in (0..40u32).rev() {
            heap.insert(LpId(i), vq(&[i])).unwrap();
        }
        assert_eq!(heap.len(), 40);
        assert_eq!(heap.peek_key(), Some(SimTime::from(0)));
    }
}
