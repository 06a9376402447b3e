// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Per-LP context owned by the kernel arena.

use crate::checkpoint::{CheckpointLog, CheckpointPolicy};
use crate::epoch::{AtomicEpochStamp, EpochStamp};
use crate::history::History;
use crate::io::{IoOp, Producer};
use crate::model::LpRng;
use crate::stats::LpStats;
use crate::types::{EventKey, LpId, SimTime};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LpState {
    Ready,
    /// Terminal for checkpointing.
    Blocked,
    /// A causality violation was detected; `rollback` is expected next.
    RollbackPending,
    SilentExec,
    /// Aligning to a commit horizon; nothing the LP exposes may change.
    OnGvt,
}

/// Where an interrupted replay stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResumeCursor {
    pub last: EventKey,
    pub frames: u64,
    pub from_last_checkpoint: u32,
    pub destination: EventKey,
    pub tag: LpState,
}

pub struct LpContext<St, L> {
    pub(crate) id: LpId,
    pub(crate) state: LpState,
    pub(crate) buffer: St,
    pub(crate) history: History,
    /// Key of the last executed event.
    pub(crate) bound: EventKey,
    pub(crate) checkpoints: CheckpointLog<L>,
    pub(crate) policy: CheckpointPolicy,
    pub(crate) frames: u64,
    pub(crate) epoch: AtomicEpochStamp,
    pub(crate) rng: LpRng,
    pub(crate) stats: LpStats,
    pub(crate) pending: Option<EventKey>,
    pub(crate) resume: Option<ResumeCursor>,
    pub(crate) io_window: Producer<IoOp>,
    pub(crate) collected_upto: EventKey,
    pub(crate) commit_horizon: SimTime,
    pub(crate) since_clean: u32,
    /// State to return to when a commit-horizon realignment ends.
    pub(crate) realign_tag: LpState,
    /// The buffer does not reflect the events up to `bound`.
    pub(crate) misaligned: bool,
}

impl<St, L> LpContext<St, L> {
    pub(crate) fn new(id: LpId, buffer: St, rng: LpRng, period: u32, io_window: Producer<IoOp>) -> Self {
        Self {
            id,
            state: LpState::Ready,
            buffer,
            history: History::new(id),
            bound: EventKey::ORIGIN,
            checkpoints: CheckpointLog::new(),
            policy: CheckpointPolicy::new(period),
            frames: 0,
            epoch: AtomicEpochStamp::new(EpochStamp::INITIAL),
            rng,
            stats: LpStats::default(),
            pending: None,
            resume: None,
            io_window,
            collected_upto: EventKey::ORIGIN,
            commit_horizon: SimTime::NEG_INFINITY,
            since_clean: 0,
            realign_tag: LpState::Ready,
            misaligned: false,
        }
    }

    pub fn id(&self) -> LpId {
        self.id
    }

    pub fn state(&self) -> LpState {
        self.state
    }

    pub fn buffer(&self) -> &St {
        &self.buffer
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn bound(&self) -> EventKey {
        self.bound
    }

    pub fn lvt(&self) -> SimTime {
        self.bound.timestamp
    }

    pub fn checkpoints(&self) -> &CheckpointLog<L> {
        &self.checkpoints
    }

    pub fn period(&self) -> u32 {
        self.policy.period
    }

    pub fn from_last_checkpoint(&self) -> u32 {
        self.policy.from_last
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn epoch(&self) -> EpochStamp {
        self.epoch.load()
    }

    pub fn rng(&self) -> &LpRng {
        &self.rng
    }

    pub fn stats(&self) -> &LpStats {
        &self.stats
    }

    pub fn pending_destination(&self) -> Option<EventKey> {
        self.pending
    }

    pub fn resume_cursor(&self) -> Option<ResumeCursor> {
        self.resume
    }

    pub fn commit_horizon(&self) -> SimTime {
        self.commit_horizon
    }

    /// Whether the state buffer reflects exactly the events up to the bound.
    pub fn is_aligned(&self) -> bool {
        !self.misaligned
    }

    /// First event after the bound that has not been executed forward.
    pub(crate) fn first_unexecuted(&self) -> Option<EventKey> {
        let last = self.history.last_key()?;
        if last <= self.bound {
            return None;
        }
        self.history.range(self.bound, last).find(|e| !e.is_executed()).map(|e| e.key())
    }

    /// Whether `key` lands before the current execution point, counting a
    /// pending rollback destination as already executed territory.
    pub(crate) fn is_straggler(&self, key: EventKey) -> bool {
        key <= self.bound || self.pending.map_or(false, |p| key < p)
    }

    /// Moves the LP to `RollbackPending`, keeping the earliest destination.
    pub(crate) fn mark_rollback(&mut self, key: EventKey) {
        self.pending = Some(self.pending.map_or(key, |p| p.min(key)));
        if self.resume.map_or(false, |c| key <= c.last) {
            tracing::debug!("LP {}: straggler {} behind resume cursor, dropping it", self.id, key);
            self.resume = None;
        }
        self.state = LpState::RollbackPending;
    }
}
