// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Causality generations.
//!
//! Every completed rollback bumps the LP epoch by one and records the rollback
//! destination next to it. Buffered state tagged with an older epoch, and
//! children of undone events, are recognised in O(1) from that pair.

use crate::types::{EventKey, LpId, SimTime};
use serde::{Deserialize, Serialize};
use std::hint;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Epoch(pub u32);

impl Epoch {
    pub fn next(self) -> Self {
        Epoch(self.0.wrapping_add(1))
    }
}

/// An epoch together with the destination time of the rollback that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochStamp {
    pub epoch: Epoch,
    pub time: SimTime,
}

impl EpochStamp {
    pub const INITIAL: EpochStamp = EpochStamp { epoch: Epoch(0), time: SimTime::INFINITY };
}

/// Sequence-counter protected `EpochStamp`.
///
/// Writers serialise on a compare-and-swap of the sequence word (odd while a
/// write is in flight); readers retry until they observe the same even value
/// before and after reading both halves.
#[derive(Debug)]
pub struct AtomicEpochStamp {
    seq: AtomicU64,
    epoch: AtomicU32,
    time: AtomicU64,
}

impl AtomicEpochStamp {
    pub fn new(stamp: EpochStamp) -> Self {
        Self {
            seq: AtomicU64::new(0),
            epoch: AtomicU32::new(stamp.epoch.0),
            time: AtomicU64::new(stamp.time.to_bits()),
        }
    }

    pub fn load(&self) -> EpochStamp {
        loop {
            let before = self.seq.load(Ordering::SeqCst);
            if before & 1 == 1 {
                hint::spin_loop();
                continue;
            }
            let epoch = Epoch(self.epoch.load(Ordering::SeqCst));
            let time = SimTime::from_bits(self.time.load(Ordering::SeqCst));
            if self.seq.load(Ordering::SeqCst) == before {
                return EpochStamp { epoch, time };
            }
        }
    }

    pub fn epoch(&self) -> Epoch {
        self.load().epoch
    }

    pub fn store(&self, stamp: EpochStamp) {
        self.update(|_| stamp);
    }

    /// Bumps the epoch and records `destination` in one step. Returns the new stamp.
    pub fn advance(&self, destination: SimTime) -> EpochStamp {
        self.update(|current| EpochStamp { epoch: current.epoch.next(), time: destination })
    }

    fn update(&self, f: impl FnOnce(EpochStamp) -> EpochStamp) -> EpochStamp {
        let seq = loop {
            let seq = self.seq.load(Ordering::SeqCst);
            if seq & 1 == 0
                && self
                    .seq
                    .compare_exchange_weak(seq, seq + 1, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
            {
                break seq;
            }
            hint::spin_loop();
        };
        let current = EpochStamp {
            epoch: Epoch(self.epoch.load(Ordering::SeqCst)),
            time: SimTime::from_bits(self.time.load(Ordering::SeqCst)),
        };
        let next = f(current);
        self.epoch.store(next.epoch.0, Ordering::SeqCst);
        self.time.store(next.time.to_bits(), Ordering::SeqCst);
        self.seq.store(seq + 2, Ordering::SeqCst);
        next
    }
}

impl Default for AtomicEpochStamp {
    fn default() -> Self {
        Self::new(EpochStamp::INITIAL)
    }
}

/// Causal parent of an event, copied by value into the child.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub lp: LpId,
    pub key: EventKey,
    pub epoch: Epoch,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lineage {
    /// The parent still belongs to the live history of its LP.
    Live,
    /// The parent was undone by a rollback.
    Superseded,
    /// Too many generations passed to decide locally.
    Unknown,
}

impl ParentLink {
    pub fn lineage(&self, parent: EpochStamp) -> Lineage {
        if parent.epoch == self.epoch {
            return Lineage::Live;
        }
        if parent.epoch < self.epoch {
            return Lineage::Unknown;
        }
        if self.key.timestamp >= parent.time {
            return Lineage::Superseded;
        }
        if parent.epoch == self.epoch.next() {
            Lineage::Live
        } else {
            Lineage::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn t(v: f64) -> SimTime {
        SimTime::new(v).unwrap()
    }

    #[test]
    fn test_advance_bumps_once_and_records_destination() {
        let stamp = AtomicEpochStamp::default();
        let after = stamp.advance(t(4.0));
        assert_eq!(after.epoch, Epoch(1));
        assert_eq!(after.time, t(4.0));
        assert_eq!(stamp.load(), after);
    }

    #[test]
    fn test_concurrent_advances_are_not_lost() {
        let stamp = Arc::new(AtomicEpochStamp::default());
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let stamp = stamp.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        stamp.advance(SimTime::from(i as u32));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stamp.epoch(), Epoch(1000));
    }

    #[test]
    fn test_lineage_rules() {
        let link = ParentLink { lp: LpId(0), key: EventKey::new(t(5.0), 0), epoch: Epoch(2) };

        let same = EpochStamp { epoch: Epoch(2), time: t(1.0) };
        assert_eq!(link.lineage(same), Lineage::Live);

        let rolled_after = EpochStamp { epoch: Epoch(3), time: t(7.0) };
        assert_eq!(link.lineage(rolled_after), Lineage::Live);

        let rolled_before = EpochStamp { epoch: Epoch(3), time: t(5.0) };
        assert_eq!(link.lineage(rolled_before), Lineage::Superseded);

        let many = EpochStamp { epoch: Epoch(5), time: t(9.0) };
        assert_eq!(link.lineage(many), Lineage::Unknown);
    }
}
