// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Checkpoints, the per-LP checkpoint log and the checkpoint period control.
//!
//! # Invariants
//! - Checkpoints are strictly ordered by the key of the event they follow.
//! - A checkpoint's `lvt` is the timestamp of that event.
//! - Once an LP is registered its log never becomes empty.

use crate::config::CheckpointMode;
use crate::error::{KernelError, Result};
use crate::lp::LpState;
use crate::model::LpRng;
use crate::stats::LpStats;
use crate::types::{EventKey, LpId, SimTime};
use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct CheckpointId(pub u64);

impl CheckpointId {
    pub fn next(self) -> Self {
        CheckpointId(self.0 + 1)
    }
}

#[derive(Debug)]
pub struct Checkpoint<L> {
    id: CheckpointId,
    pub lvt: SimTime,
    /// `None` once the checkpoint has been deleted.
    last_event: Option<EventKey>,
    log: Option<L>,
    pub rng: LpRng,
    pub frames: u64,
    pub tag: LpState,
}

impl<L> Checkpoint<L> {
    pub fn id(&self) -> CheckpointId {
        self.id
    }

    pub fn is_live(&self) -> bool {
        self.last_event.is_some()
    }

    pub fn last_event(&self) -> Result<EventKey> {
        self.last_event.ok_or(KernelError::StaleCheckpoint)
    }

    pub fn log(&self) -> Result<&L> {
        self.log.as_ref().ok_or(KernelError::StaleCheckpoint)
    }

    /// Poisons the checkpoint and hands back its log for deletion.
    pub fn retire(&mut self) -> Option<L> {
        self.last_event = None;
        self.log.take()
    }
}

/// Copyable description of a live checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CheckpointRef {
    pub lp: LpId,
    pub id: CheckpointId,
    pub lvt: SimTime,
    pub last_event: EventKey,
    pub frames: u64,
}

impl CheckpointRef {
    pub fn of<L>(lp: LpId, ckpt: &Checkpoint<L>) -> Result<Self> {
        Ok(Self { lp, id: ckpt.id, lvt: ckpt.lvt, last_event: ckpt.last_event()?, frames: ckpt.frames })
    }
}

#[derive(Debug)]
pub struct CheckpointLog<L> {
    entries: VecDeque<Checkpoint<L>>,
    next_id: CheckpointId,
}

impl<L> Default for CheckpointLog<L> {
    fn default() -> Self {
        Self { entries: VecDeque::new(), next_id: CheckpointId::default() }
    }
}

impl<L> CheckpointLog<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Checkpoint<L>> {
        self.entries.iter()
    }

    pub fn newest(&self) -> Option<&Checkpoint<L>> {
        self.entries.back()
    }

    pub fn oldest(&self) -> Option<&Checkpoint<L>> {
        self.entries.front()
    }

    /// Appends a checkpoint taken right after `last_event`. A checkpoint at
    /// the same event as the newest one replaces it; the displaced log is
    /// returned for deletion.
    pub fn push(&mut self, last_event: EventKey, log: L, rng: LpRng, frames: u64, tag: LpState) -> (CheckpointId, Option<L>) {
        let mut displaced = None;
        if let Some(newest) = self.entries.back_mut() {
            let newest_key = newest.last_event.unwrap_or(EventKey::ORIGIN);
            debug_assert!(newest_key <= last_event, "checkpoint log out of order");
            if newest_key == last_event {
                displaced = newest.retire();
                self.entries.pop_back();
            }
        }
        let id = self.next_id;
        self.next_id = id.next();
        self.entries.push_back(Checkpoint {
            id,
            lvt: last_event.timestamp,
            last_event: Some(last_event),
            log: Some(log),
            rng,
            frames,
            tag,
        });
        (id, displaced)
    }

    pub fn get(&self, id: CheckpointId) -> Result<&Checkpoint<L>> {
        self.entries.iter().find(|c| c.id == id).ok_or(KernelError::StaleCheckpoint)
    }

    /// Newest checkpoint with `lvt <= time`; the first checkpoint when none
    /// qualifies or `time` is the origin.
    pub fn find_at_or_before(&self, time: SimTime) -> Option<&Checkpoint<L>> {
        if time <= SimTime::ZERO {
            return self.entries.front();
        }
        self.entries.iter().rev().find(|c| c.lvt <= time).or_else(|| self.entries.front())
    }

    /// Removes the newest checkpoint, poisons it and returns it with its log.
    pub fn pop_newest(&mut self) -> Option<(Checkpoint<L>, Option<L>)> {
        let mut ckpt = self.entries.pop_back()?;
        let log = ckpt.retire();
        Some((ckpt, log))
    }

    /// Removes the `count` oldest checkpoints and returns their logs.
    pub fn drain_oldest(&mut self, count: usize) -> Vec<L> {
        let count = count.min(self.entries.len());
        self.entries.drain(..count).filter_map(|mut c| c.retire()).collect()
    }

    /// Index of the newest checkpoint whose event is strictly before `horizon`.
    pub fn newest_before(&self, horizon: SimTime) -> Option<usize> {
        self.entries
            .iter()
            .rposition(|c| c.last_event.map_or(false, |k| k.timestamp < horizon))
    }

    pub fn get_index(&self, idx: usize) -> Option<&Checkpoint<L>> {
        self.entries.get(idx)
    }
}

/// Decides when an LP checkpoints.
#[derive(Clone, Debug)]
pub struct CheckpointPolicy {
    pub period: u32,
    /// Events executed since the last checkpoint.
    pub from_last: u32,
    forced: bool,
    decisions: u32,
}

impl CheckpointPolicy {
    pub fn new(period: u32) -> Self {
        Self { period: period.max(1), from_last: 0, forced: false, decisions: 0 }
    }

    pub fn force(&mut self) {
        self.forced = true;
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn on_event(&mut self) {
        self.from_last = self.from_last.saturating_add(1);
    }

    pub fn should_checkpoint(&mut self, mode: CheckpointMode, state: LpState) -> bool {
        if state == LpState::Blocked {
            return false;
        }
        if self.forced {
            self.forced = false;
            self.from_last = 0;
            return true;
        }
        match mode {
            CheckpointMode::AlwaysCopy => {
                self.from_last = 0;
                true
            }
            CheckpointMode::Periodic => {
                if self.from_last >= self.period {
                    self.from_last = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Counts one periodic decision; true when the period is due for recomputation.
    pub fn tick_recalc(&mut self, interval: u32) -> bool {
        self.decisions += 1;
        if self.decisions >= interval {
            self.decisions = 0;
            true
        } else {
            false
        }
    }
}

/// `floor(sqrt(2 * (ckpt_cost / event_cost) * (rollback_length + 1)))`,
/// clamped to `[1, max]`. `None` while the costs are unknown.
pub fn adaptive_period(stats: &LpStats, max: u32) -> Option<u32> {
    let ckpt = stats.avg_checkpoint_cost()?;
    let event = stats.avg_event_cost()?;
    if event <= 0.0 {
        return None;
    }
    let raw = (2.0 * (ckpt / event) * (stats.avg_rollback_length() + 1.0)).sqrt().floor();
    Some((raw as u32).clamp(1, max.max(1)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(ts: u32) -> EventKey {
        EventKey::new(SimTime::from(ts), 0)
    }

    fn log_with(ts: &[u32]) -> CheckpointLog<u32> {
        let mut log = CheckpointLog::new();
        for &t in ts {
            log.push(if t == 0 { EventKey::ORIGIN } else { key(t) }, t, LpRng::new(0, 0), u64::from(t), LpState::Ready);
        }
        log
    }

    #[test]
    fn test_find_at_or_before() {
        let log = log_with(&[0, 3, 7]);
        assert_eq!(log.find_at_or_before(SimTime::from(5)).map(|c| c.lvt), Some(SimTime::from(3)));
        assert_eq!(log.find_at_or_before(SimTime::from(7)).map(|c| c.lvt), Some(SimTime::from(7)));
        assert_eq!(log.find_at_or_before(SimTime::ZERO).map(|c| c.lvt), Some(SimTime::ZERO));
        assert_eq!(log.find_at_or_before(SimTime::INFINITY).map(|c| c.lvt), Some(SimTime::from(7)));
    }

    #[test]
    fn test_deleted_checkpoint_is_poisoned() {
        let mut log = log_with(&[0, 3]);
        let newest_id = log.newest().unwrap().id();
        let (popped, state) = log.pop_newest().unwrap();
        assert_eq!(state, Some(3));
        assert!(!popped.is_live());
        assert!(matches!(popped.last_event(), Err(KernelError::StaleCheckpoint)));
        assert!(matches!(log.get(newest_id), Err(KernelError::StaleCheckpoint)));
    }

    #[test]
    fn test_same_event_replaces_newest() {
        let mut log = log_with(&[0, 3]);
        let (_, displaced) = log.push(key(3), 33, LpRng::new(0, 0), 3, LpState::Ready);
        assert_eq!(displaced, Some(3));
        assert_eq!(log.len(), 2);
        assert_eq!(log.newest().unwrap().log().unwrap(), &33);
    }

    #[test]
    fn test_drain_oldest_and_newest_before() {
        let mut log = log_with(&[0, 4, 8, 12]);
        assert_eq!(log.newest_before(SimTime::from(10)), Some(2));
        assert_eq!(log.newest_before(SimTime::from(8)), Some(1));
        let logs = log.drain_oldest(2);
        assert_eq!(logs, vec![0, 4]);
        assert_eq!(log.oldest().unwrap().lvt, SimTime::from(8));
    }

    #[test]
    fn test_policy_periodic_and_forced() {
        let mut p = CheckpointPolicy::new(3);
        for _ in 0..2 {
            p.on_event();
            assert!(!p.should_checkpoint(CheckpointMode::Periodic, LpState::Ready));
        }
        p.on_event();
        assert!(p.should_checkpoint(CheckpointMode::Periodic, LpState::Ready));
        assert_eq!(p.from_last, 0);

        p.force();
        assert!(p.should_checkpoint(CheckpointMode::Periodic, LpState::Ready));
        assert!(!p.is_forced());

        assert!(!p.should_checkpoint(CheckpointMode::AlwaysCopy, LpState::Blocked));
        assert!(p.should_checkpoint(CheckpointMode::AlwaysCopy, LpState::Ready));
    }

    #[test]
    fn test_adaptive_period_formula() {
        let mut stats = LpStats::default();
        assert_eq!(adaptive_period(&stats, 128), None);
        stats.record_checkpoint(800.0);
        stats.record_event(100.0);
        stats.record_rollback(Some(3));
        // sqrt(2 * 8 * 4) = 8
        assert_eq!(adaptive_period(&stats, 128), Some(8));
        assert_eq!(adaptive_period(&stats, 5), Some(5));

        let mut cheap = LpStats::default();
        cheap.record_checkpoint(1.0);
        cheap.record_event(1000.0);
        assert_eq!(adaptive_period(&cheap, 128), Some(1));
    }
}
