// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Per-LP event history, ordered by `EventKey`.

use crate::error::{KernelError, Result};
use crate::event::Event;
use crate::types::{EventKey, LpId, SimTime};
use std::collections::BTreeMap;
use std::ops::Bound;

#[derive(Debug)]
pub struct History {
    lp: LpId,
    events: BTreeMap<EventKey, Event>,
}

impl History {
    /// A history holding only the origin event.
    pub fn new(lp: LpId) -> Self {
        let mut events = BTreeMap::new();
        events.insert(EventKey::ORIGIN, Event::origin(lp));
        Self { lp, events }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn insert(&mut self, event: Event) -> Result<()> {
        let key = event.key();
        if key.timestamp <= SimTime::ZERO || key.timestamp.is_infinite() {
            return Err(KernelError::InvalidTimestamp(key.timestamp.as_f64()));
        }
        if self.events.contains_key(&key) {
            return Err(KernelError::DuplicateEvent { lp: self.lp, key });
        }
        self.events.insert(key, event);
        Ok(())
    }

    pub fn get(&self, key: &EventKey) -> Option<&Event> {
        self.events.get(key)
    }

    pub fn get_mut(&mut self, key: &EventKey) -> Option<&mut Event> {
        self.events.get_mut(key)
    }

    pub fn remove(&mut self, key: &EventKey) -> Option<Event> {
        self.events.remove(key)
    }

    pub fn first_key(&self) -> Option<EventKey> {
        self.events.keys().next().copied()
    }

    pub fn last_key(&self) -> Option<EventKey> {
        self.events.keys().next_back().copied()
    }

    pub fn next_after(&self, key: &EventKey) -> Option<&Event> {
        self.events.range((Bound::Excluded(*key), Bound::Unbounded)).next().map(|(_, e)| e)
    }

    pub fn next_key_after(&self, key: &EventKey) -> Option<EventKey> {
        self.next_after(key).map(Event::key)
    }

    /// Events in `(after, upto]`, in order.
    pub fn range(&self, after: EventKey, upto: EventKey) -> impl DoubleEndedIterator<Item = &Event> {
        self.events.range((Bound::Excluded(after), Bound::Included(upto))).map(|(_, e)| e)
    }

    pub fn range_mut(&mut self, after: EventKey, upto: EventKey) -> impl DoubleEndedIterator<Item = &mut Event> {
        self.events.range_mut((Bound::Excluded(after), Bound::Included(upto))).map(|(_, e)| e)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.values()
    }

    /// Removes and returns every event ordered strictly before `key`.
    pub fn split_before(&mut self, key: &EventKey) -> BTreeMap<EventKey, Event> {
        let kept = self.events.split_off(key);
        std::mem::replace(&mut self.events, kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(ts: u32, tb: u32) -> Event {
        Event::new(LpId(0), SimTime::from(ts), tb, 0, vec![])
    }

    #[test]
    fn test_insert_keeps_order() {
        let mut h = History::new(LpId(0));
        h.insert(ev(2, 0)).unwrap();
        h.insert(ev(1, 1)).unwrap();
        h.insert(ev(1, 0)).unwrap();
        let keys: Vec<_> = h.iter().map(|e| (e.timestamp().as_f64(), e.tie_breaker())).collect();
        assert_eq!(keys, vec![(0.0, 0), (1.0, 0), (1.0, 1), (2.0, 0)]);
    }

    #[test]
    fn test_rejects_duplicates_and_origin_time() {
        let mut h = History::new(LpId(0));
        h.insert(ev(1, 0)).unwrap();
        assert!(matches!(h.insert(ev(1, 0)), Err(KernelError::DuplicateEvent { .. })));
        assert!(matches!(h.insert(ev(0, 5)), Err(KernelError::InvalidTimestamp(_))));
    }

    #[test]
    fn test_split_before() {
        let mut h = History::new(LpId(0));
        for ts in 1..=4 {
            h.insert(ev(ts, 0)).unwrap();
        }
        let cut = EventKey::new(SimTime::from(3), 0);
        let removed = h.split_before(&cut);
        assert_eq!(removed.len(), 3);
        assert_eq!(h.first_key(), Some(cut));
        assert_eq!(h.next_key_after(&cut), Some(EventKey::new(SimTime::from(4), 0)));
    }
}
