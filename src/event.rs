// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Event records.
//!
//! An event is the unit of causality: a timestamped message delivered to one
//! LP, ordered within that LP by `(timestamp, tie_breaker)`.
//!
//! # Invariants
//! - The key never changes once the event is in a history.
//! - `epoch` only moves forward, and only when the event is executed again.
//! - The event owns the I/O windows its execution produced.

use crate::epoch::{Epoch, ParentLink};
use crate::io::EventWindows;
use crate::types::{EventKey, LpId, SimTime};
use std::sync::atomic::{AtomicU8, Ordering};

/// Event kind reserved for the origin event of every history.
pub const ORIGIN_KIND: u32 = u32::MAX;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Validity {
    New = 0,
    Extracted = 1,
    Eliminated = 2,
    AntiMessage = 3,
}

impl Validity {
    pub fn is_valid(self) -> bool {
        matches!(self, Validity::New | Validity::Extracted)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Validity::New,
            1 => Validity::Extracted,
            2 => Validity::Eliminated,
            _ => Validity::AntiMessage,
        }
    }
}

#[derive(Debug)]
pub struct Event {
    key: EventKey,
    pub sender: LpId,
    pub receiver: LpId,
    pub kind: u32,
    pub payload: Vec<u8>,
    pub parent: Option<ParentLink>,
    validity: AtomicU8,
    pub(crate) epoch: Epoch,
    /// Frame counter of the LP right after this event was executed.
    pub(crate) frame: u64,
    pub(crate) executed: bool,
    pub(crate) windows: EventWindows,
}

impl Event {
    pub fn new(receiver: LpId, timestamp: SimTime, tie_breaker: u32, kind: u32, payload: Vec<u8>) -> Self {
        Self {
            key: EventKey::new(timestamp, tie_breaker),
            sender: receiver,
            receiver,
            kind,
            payload,
            parent: None,
            validity: AtomicU8::new(Validity::New as u8),
            epoch: Epoch::default(),
            frame: 0,
            executed: false,
            windows: EventWindows::default(),
        }
    }

    pub(crate) fn origin(lp: LpId) -> Self {
        let mut ev = Self::new(lp, SimTime::ZERO, 0, ORIGIN_KIND, Vec::new());
        ev.executed = true;
        ev
    }

    pub fn with_sender(mut self, sender: LpId) -> Self {
        self.sender = sender;
        self
    }

    pub fn with_parent(mut self, parent: ParentLink) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn key(&self) -> EventKey {
        self.key
    }

    pub fn timestamp(&self) -> SimTime {
        self.key.timestamp
    }

    pub fn tie_breaker(&self) -> u32 {
        self.key.tie_breaker
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// True between forward execution and the rollback that undoes it.
    pub fn is_executed(&self) -> bool {
        self.executed
    }

    pub fn validity(&self) -> Validity {
        Validity::from_u8(self.validity.load(Ordering::Acquire))
    }

    pub fn is_valid(&self) -> bool {
        self.validity().is_valid()
    }

    /// Callable through a shared reference, so the antimessage transport can
    /// mark an event while the owning worker holds the history.
    pub fn set_validity(&self, validity: Validity) {
        self.validity.store(validity as u8, Ordering::Release);
    }

    pub fn has_pending_io(&self) -> bool {
        !self.windows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_transitions() {
        let ev = Event::new(LpId(1), SimTime::from(3), 0, 7, vec![1, 2]);
        assert_eq!(ev.validity(), Validity::New);
        assert!(ev.is_valid());

        ev.set_validity(Validity::Extracted);
        assert!(ev.is_valid());

        ev.set_validity(Validity::AntiMessage);
        assert!(!ev.is_valid());
        assert_eq!(ev.validity(), Validity::AntiMessage);
    }

    #[test]
    fn test_origin_event() {
        let ev = Event::origin(LpId(4));
        assert_eq!(ev.key(), EventKey::ORIGIN);
        assert_eq!(ev.kind, ORIGIN_KIND);
        assert_eq!(ev.receiver, LpId(4));
        assert!(ev.is_executed());
    }
}
