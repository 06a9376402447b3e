// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Silent replay.
//!
//! Re-executes already-settled events against a restored state buffer with
//! outgoing messages and I/O suppressed.

use crate::error::Result;
use crate::history::History;
use crate::model::{ExecContext, IoMode, LpRng, Model};
use crate::types::{EventKey, LpId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How replay treats an event whose key has the target timestamp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Boundary {
    /// Ordinary rollback: stop at the first tie-breaker `>=` the target.
    Exclusive,
    /// Commit-horizon realignment: stop only past the target pair.
    Inclusive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplayTarget {
    pub key: EventKey,
    pub boundary: Boundary,
}

impl ReplayTarget {
    pub fn new(key: EventKey, boundary: Boundary) -> Self {
        Self { key, boundary }
    }

    /// True when replay must stop before executing `key`.
    pub fn stops_at(&self, key: EventKey) -> bool {
        if key.timestamp != self.key.timestamp {
            return key.timestamp > self.key.timestamp;
        }
        match self.boundary {
            Boundary::Exclusive => key.tie_breaker >= self.key.tie_breaker,
            Boundary::Inclusive => key.tie_breaker > self.key.tie_breaker,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    EndOfHistory,
    Boundary,
    /// The next event is eliminated or an anti-message not yet applied.
    InvalidEvent,
    Interrupted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub replayed: u64,
    /// Key of the last event replayed, or the start key if none was.
    pub last: EventKey,
    pub stop: StopReason,
}

/// Asked before every replayed event whether replay should stop early.
pub trait ReplayGuard: Send + Sync {
    fn interrupted(&self, lp: LpId) -> bool;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct Uninterruptible;

impl ReplayGuard for Uninterruptible {
    fn interrupted(&self, _lp: LpId) -> bool {
        false
    }
}

/// Interrupts replay once the flag is raised, e.g. by a thread delivering new
/// events. The flag is cleared when it fires.
#[derive(Clone, Debug, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl ReplayGuard for InterruptFlag {
    fn interrupted(&self, _lp: LpId) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// Replays the events strictly after `start`, in history order, until the
/// target, the end of the history, an invalid event, or an interruption.
#[allow(clippy::too_many_arguments)]
pub fn silent_execution<M: Model>(
    model: &M,
    lp: LpId,
    history: &History,
    state: &mut M::State,
    rng: &mut LpRng,
    start: EventKey,
    target: ReplayTarget,
    guard: &dyn ReplayGuard,
) -> Result<ReplayOutcome> {
    let mut last = start;
    let mut replayed = 0u64;
    let mut discarded = Vec::new();
    let stop = loop {
        let Some(event) = history.next_after(&last) else {
            break StopReason::EndOfHistory;
        };
        if target.stops_at(event.key()) {
            break StopReason::Boundary;
        }
        if !event.is_valid() {
            break StopReason::InvalidEvent;
        }
        if guard.interrupted(lp) {
            break StopReason::Interrupted;
        }
        let mut ctx = ExecContext::new(
            lp,
            event.key(),
            event.kind,
            &event.payload,
            event.epoch(),
            &mut *rng,
            &mut discarded,
            IoMode::Suppressed,
        );
        model.execute(&mut ctx, state)?;
        tracing::trace!("LP {} replayed {}", lp, event.key());
        last = event.key();
        replayed += 1;
    };
    tracing::debug!("LP {} silent replay {} -> {}: {} events ({:?})", lp, start, last, replayed, stop);
    Ok(ReplayOutcome { replayed, last, stop })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SimTime;

    fn k(ts: f64, tb: u32) -> EventKey {
        EventKey::new(SimTime::new(ts).unwrap(), tb)
    }

    #[test]
    fn test_exclusive_boundary() {
        let target = ReplayTarget::new(k(1.0, 1), Boundary::Exclusive);
        assert!(!target.stops_at(k(0.5, 9)));
        assert!(!target.stops_at(k(1.0, 0)));
        assert!(target.stops_at(k(1.0, 1)));
        assert!(target.stops_at(k(2.0, 0)));
    }

    #[test]
    fn test_inclusive_boundary() {
        let target = ReplayTarget::new(k(1.0, 1), Boundary::Inclusive);
        assert!(!target.stops_at(k(1.0, 0)));
        assert!(!target.stops_at(k(1.0, 1)));
        assert!(target.stops_at(k(1.0, 2)));
        assert!(target.stops_at(k(2.0, 0)));
    }

    #[test]
    fn test_infinite_target_never_stops() {
        let target = ReplayTarget::new(EventKey::new(SimTime::INFINITY, 0), Boundary::Exclusive);
        assert!(!target.stops_at(k(1e300, u32::MAX)));
    }

    #[test]
    fn test_interrupt_flag_fires_once() {
        let flag = InterruptFlag::new();
        assert!(!flag.interrupted(LpId(0)));
        flag.raise();
        assert!(flag.is_raised());
        assert!(flag.interrupted(LpId(0)));
        assert!(!flag.interrupted(LpId(0)));
    }
}
