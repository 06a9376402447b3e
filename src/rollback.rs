// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Rollback engine.
//!
//! A rollback restores the newest checkpoint strictly before the destination,
//! silently replays up to the destination and undoes everything after the new
//! execution bound. Only a `RollbackPending` rollback changes what the LP
//! exposes (bound, counters, epoch); an `OnGvt` rollback realigns the state
//! buffer and leaves the rest alone, the LP included: it stays `OnGvt` until
//! `end_gvt_realignment` brings the buffer back to the bound.

use crate::checkpoint::CheckpointId;
use crate::epoch::Epoch;
use crate::error::{KernelError, Result};
use crate::io::ReversibleIo;
use crate::kernel::protocol_violation;
use crate::lp::{LpContext, LpState, ResumeCursor};
use crate::model::Model;
use crate::replay::{self, Boundary, ReplayGuard, ReplayOutcome, ReplayTarget, StopReason, Uninterruptible};
use crate::snapshot::SnapshotStrategy;
use crate::stats::Metric;
use crate::types::{EventKey, SimTime};
use crate::worker::LpWorker;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RollbackReport {
    pub destination: EventKey,
    /// `None` when the rollback resumed an interrupted replay.
    pub checkpoint: Option<CheckpointId>,
    pub checkpoints_discarded: usize,
    pub replayed: u64,
    /// Executed events whose effects were undone.
    pub undone: u64,
    pub stop: StopReason,
    /// False when replay was interrupted and a resume cursor was left behind.
    pub completed: bool,
    pub epoch: Epoch,
}

/// Undoes every executed event after `after` accepted by `filter`, newest
/// first: forward windows are dropped and in-place writes restored.
fn undo_after<St, L>(
    ctx: &mut LpContext<St, L>,
    io: &ReversibleIo,
    after: EventKey,
    filter: impl Fn(EventKey) -> bool,
) -> Result<u64> {
    let Some(last) = ctx.history.last_key() else {
        return Ok(0);
    };
    if last <= after {
        return Ok(0);
    }
    let mut undone = 0;
    for event in ctx.history.range_mut(after, last).rev() {
        if !event.executed || !filter(event.key()) {
            continue;
        }
        event.windows.discard_forward();
        for record in event.windows.take_reverse() {
            io.restore(&record)?;
        }
        event.executed = false;
        undone += 1;
    }
    Ok(undone)
}

impl<M: Model, P: SnapshotStrategy<M::State>> LpWorker<'_, M, P> {
    /// Rolls the LP back so that its state reflects every event before
    /// `(destination, tie_breaker)`. An INFTY destination undoes exactly the
    /// event following the execution bound, if any.
    pub fn rollback(&mut self, destination: SimTime, tie_breaker: u32) -> Result<RollbackReport> {
        let lp = self.ctx.id;
        let env = self.env;
        let ctx = &mut *self.ctx;
        let mode = ctx.state;
        if !matches!(mode, LpState::RollbackPending | LpState::OnGvt) {
            return Err(protocol_violation(lp, mode, "rollback"));
        }
        let realigning = mode == LpState::OnGvt;

        let mut dest = EventKey::new(destination, tie_breaker);
        if destination.is_infinite() {
            if let Some(next) = ctx.history.next_key_after(&ctx.bound) {
                dest = next;
            }
        }
        // replay never runs into events that were not executed forward
        if realigning {
            dest = dest.min(ctx.bound);
        } else if let Some(frontier) = ctx.first_unexecuted() {
            dest = dest.min(frontier);
        }
        ctx.resume = None;
        let boundary = if realigning { Boundary::Inclusive } else { Boundary::Exclusive };
        let target = ReplayTarget::new(dest, boundary);

        // Checkpoint scan, newest first.
        let mut discarded = 0;
        let ckpt = if !realigning {
            loop {
                let newest = ctx.checkpoints.newest().ok_or(KernelError::EmptyCheckpointLog(lp))?;
                let key = newest.last_event()?;
                let usable = newest.lvt < dest.timestamp && ctx.history.get(&key).map_or(false, |e| e.is_valid());
                if usable {
                    break;
                }
                if ctx.checkpoints.len() == 1 {
                    tracing::error!("LP {}: rollback to {} discarded every checkpoint", lp, dest);
                    return Err(KernelError::NoValidCheckpoint(lp));
                }
                if let Some((_, Some(log))) = ctx.checkpoints.pop_newest() {
                    env.snapshots.delete(log);
                }
                discarded += 1;
            }
            ctx.checkpoints.newest().ok_or(KernelError::EmptyCheckpointLog(lp))?
        } else {
            let history = &ctx.history;
            ctx.checkpoints
                .iter()
                .rev()
                .find(|c| {
                    c.last_event()
                        .map_or(false, |k| !target.stops_at(k) && history.get(&k).map_or(false, |e| e.is_valid()))
                })
                .ok_or_else(|| {
                    tracing::error!("LP {}: no checkpoint at or before {}", lp, dest);
                    KernelError::NoValidCheckpoint(lp)
                })?
        };

        let ckpt_id = ckpt.id();
        let start = ckpt.last_event()?;
        let ckpt_frames = ckpt.frames;
        let tag = ckpt.tag;
        let restored = env.snapshots.restore(ckpt.log()?)?;
        ctx.buffer = restored;
        ctx.rng = ckpt.rng;
        if realigning {
            ctx.misaligned = true;
        }

        // a realignment always runs to its target
        let guard: &dyn ReplayGuard = if realigning { &Uninterruptible } else { env.rollback_guard() };
        ctx.state = LpState::SilentExec;
        let outcome =
            replay::silent_execution(env.model, lp, &ctx.history, &mut ctx.buffer, &mut ctx.rng, start, target, guard);
        ctx.state = mode;
        let outcome = outcome?;
        ctx.stats.events_replayed += outcome.replayed;
        env.stats.post(lp, Metric::SilentEvents, outcome.replayed as f64);

        if realigning {
            if outcome.stop == StopReason::Interrupted {
                tracing::error!("LP {}: realignment replay to {} was interrupted", lp, dest);
                return Err(KernelError::RealignmentFailed(lp));
            }
            ctx.misaligned = outcome.last != ctx.bound;
            tracing::debug!("LP {} realigned to {} ({} replayed)", lp, outcome.last, outcome.replayed);
            return Ok(RollbackReport {
                destination: dest,
                checkpoint: Some(ckpt_id),
                checkpoints_discarded: 0,
                replayed: outcome.replayed,
                undone: 0,
                stop: outcome.stop,
                completed: true,
                epoch: ctx.epoch.epoch(),
            });
        }

        let cursor = ResumeCursor {
            last: outcome.last,
            frames: ckpt_frames + outcome.replayed,
            from_last_checkpoint: u32::try_from(outcome.replayed).unwrap_or(u32::MAX),
            destination: dest,
            tag,
        };
        let mut report = self.settle(cursor, outcome)?;
        report.checkpoint = Some(ckpt_id);
        report.checkpoints_discarded = discarded;
        Ok(report)
    }

    /// Resumes an interrupted replay from where it stopped. Without a resume
    /// cursor this is a full rollback to the pending destination.
    pub fn rollback_forward(&mut self) -> Result<RollbackReport> {
        let lp = self.ctx.id;
        let env = self.env;
        let ctx = &mut *self.ctx;
        if ctx.state != LpState::RollbackPending {
            return Err(protocol_violation(lp, ctx.state, "rollback_forward"));
        }
        let Some(cursor) = ctx.resume.take() else {
            let dest = ctx.pending.unwrap_or_else(|| EventKey::new(SimTime::INFINITY, 0));
            return self.rollback(dest.timestamp, dest.tie_breaker);
        };
        let dest = ctx.pending.map_or(cursor.destination, |p| p.min(cursor.destination));
        let target = ReplayTarget::new(dest, Boundary::Exclusive);

        ctx.state = LpState::SilentExec;
        let outcome = replay::silent_execution(
            env.model,
            lp,
            &ctx.history,
            &mut ctx.buffer,
            &mut ctx.rng,
            cursor.last,
            target,
            env.rollback_guard(),
        );
        ctx.state = LpState::RollbackPending;
        let outcome = outcome?;
        ctx.stats.events_replayed += outcome.replayed;
        ctx.stats.resumed_rollbacks += 1;
        env.stats.post(lp, Metric::SilentEvents, outcome.replayed as f64);
        tracing::debug!("LP {} resumed replay from {} ({} replayed)", lp, cursor.last, outcome.replayed);

        let cursor = ResumeCursor {
            last: outcome.last,
            frames: cursor.frames + outcome.replayed,
            from_last_checkpoint: cursor
                .from_last_checkpoint
                .saturating_add(u32::try_from(outcome.replayed).unwrap_or(u32::MAX)),
            destination: dest,
            tag: cursor.tag,
        };
        self.settle(cursor, outcome)
    }

    /// Installs the result of a `RollbackPending` replay: counters, bound,
    /// undone events, and either the epoch bump or a resume cursor.
    fn settle(&mut self, cursor: ResumeCursor, outcome: ReplayOutcome) -> Result<RollbackReport> {
        let lp = self.ctx.id;
        let env = self.env;
        let ctx = &mut *self.ctx;
        let dest = cursor.destination;
        let target = ReplayTarget::new(dest, Boundary::Exclusive);

        ctx.bound = cursor.last;
        ctx.frames = cursor.frames;
        ctx.policy.from_last = cursor.from_last_checkpoint;

        // only a resumable rollback is ever handed an interruptible guard
        if outcome.stop == StopReason::Interrupted {
            // events before the destination are still to be replayed
            let undone = undo_after(ctx, env.io, cursor.last, |k| target.stops_at(k))?;
            ctx.resume = Some(cursor);
            ctx.state = LpState::RollbackPending;
            tracing::debug!("LP {} replay interrupted at {}; resume cursor kept", lp, cursor.last);
            return Ok(RollbackReport {
                destination: dest,
                checkpoint: None,
                checkpoints_discarded: 0,
                replayed: outcome.replayed,
                undone,
                stop: outcome.stop,
                completed: false,
                epoch: ctx.epoch.epoch(),
            });
        }

        let undone = undo_after(ctx, env.io, cursor.last, |_| true)?;
        ctx.collected_upto = ctx.collected_upto.min(ctx.bound);
        let stamp = ctx.epoch.advance(dest.timestamp);
        let length = (!dest.timestamp.is_infinite()).then_some(undone);
        ctx.stats.record_rollback(length);
        ctx.pending = None;
        ctx.resume = None;
        ctx.misaligned = false;
        ctx.state = cursor.tag;
        env.stats.post(lp, Metric::Rollback, 1.0);
        if let Some(len) = length {
            env.stats.post(lp, Metric::RollbackLength, len as f64);
        }
        tracing::debug!(
            "LP {} rolled back to {}: bound {}, {} undone, epoch {}",
            lp,
            dest,
            ctx.bound,
            undone,
            stamp.epoch.0
        );
        Ok(RollbackReport {
            destination: dest,
            checkpoint: None,
            checkpoints_discarded: 0,
            replayed: outcome.replayed,
            undone,
            stop: outcome.stop,
            completed: true,
            epoch: stamp.epoch,
        })
    }
}
