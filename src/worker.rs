// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Per-LP handles.
//!
//! An `LpWorker` pairs exclusive access to one LP context with shared access
//! to the collaborators every LP uses. `Kernel::workers` hands out one per LP,
//! so disjoint LPs can be driven from different threads at the same time; the
//! only state they share is the I/O coordinator, which locks internally.
//!
//! Rollback (`rollback.rs`) and fossil collection (`fossil.rs`) extend
//! `LpWorker` with further `impl` blocks.

use crate::checkpoint::{adaptive_period, CheckpointRef};
use crate::config::{CheckpointMode, KernelConfig};
use crate::error::{KernelError, Result};
use crate::event::{Event, Validity};
use crate::io::ReversibleIo;
use crate::kernel::{protocol_violation, ExecutionReport, InsertOutcome};
use crate::lp::{LpContext, LpState};
use crate::model::{ExecContext, IoMode, Model};
use crate::replay::{self, Boundary, ReplayGuard, ReplayTarget, Uninterruptible};
use crate::snapshot::SnapshotStrategy;
use crate::stats::{Metric, StatsSink};
use crate::types::{EventKey, LpId, SimTime};
use std::time::Instant;

/// Collaborators shared by every LP of a kernel.
pub struct Env<'k, M, P> {
    pub(crate) config: &'k KernelConfig,
    pub(crate) model: &'k M,
    pub(crate) snapshots: &'k P,
    pub(crate) io: &'k ReversibleIo,
    pub(crate) stats: &'k dyn StatsSink,
    pub(crate) guard: &'k dyn ReplayGuard,
}

impl<M, P> Clone for Env<'_, M, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M, P> Copy for Env<'_, M, P> {}

impl<'k, M, P> Env<'k, M, P> {
    /// Guard consulted by rollback replays. Interrupting a replay is only
    /// allowed when an interrupted rollback can be resumed.
    pub(crate) fn rollback_guard(&self) -> &'k dyn ReplayGuard {
        if self.config.resumable_rollback {
            self.guard
        } else {
            &Uninterruptible
        }
    }
}

pub struct LpWorker<'k, M: Model, P: SnapshotStrategy<M::State>> {
    pub(crate) env: Env<'k, M, P>,
    pub(crate) ctx: &'k mut LpContext<M::State, P::Log>,
}

impl<'k, M: Model, P: SnapshotStrategy<M::State>> LpWorker<'k, M, P> {
    pub(crate) fn new(env: Env<'k, M, P>, ctx: &'k mut LpContext<M::State, P::Log>) -> Self {
        Self { env, ctx }
    }

    pub fn id(&self) -> LpId {
        self.ctx.id
    }

    pub fn context(&self) -> &LpContext<M::State, P::Log> {
        &*self.ctx
    }

    /// Inserts `event` into this LP's history.
    pub fn insert_event(&mut self, event: Event) -> Result<InsertOutcome> {
        let lp = self.ctx.id;
        if event.receiver != lp {
            return Err(KernelError::UnknownLp(event.receiver));
        }
        let ctx = &mut *self.ctx;
        let key = event.key();
        let straggler = ctx.is_straggler(key);
        ctx.history.insert(event)?;
        if straggler {
            ctx.mark_rollback(key);
            tracing::debug!("Straggler {} on LP {} (bound {})", key, lp, ctx.bound);
            return Ok(InsertOutcome::Straggler { destination: ctx.pending.unwrap_or(key) });
        }
        Ok(InsertOutcome::Scheduled)
    }

    /// Marks an event invalid. Invalidating executed work requires a rollback.
    /// The origin event anchors the first checkpoint and cannot be invalidated.
    pub fn invalidate_event(&mut self, key: EventKey, validity: Validity) -> Result<InsertOutcome> {
        let lp = self.ctx.id;
        let ctx = &mut *self.ctx;
        if key == EventKey::ORIGIN {
            return Err(protocol_violation(lp, ctx.state, "invalidate_event on the origin event"));
        }
        let event = ctx.history.get(&key).ok_or(KernelError::UnknownEvent { lp, key })?;
        event.set_validity(validity);
        if !validity.is_valid() && ctx.is_straggler(key) {
            ctx.mark_rollback(key);
            return Ok(InsertOutcome::Straggler { destination: ctx.pending.unwrap_or(key) });
        }
        Ok(InsertOutcome::Scheduled)
    }

    /// Removes an event that was never executed (or was undone).
    pub fn remove_event(&mut self, key: EventKey) -> Result<Event> {
        let lp = self.ctx.id;
        let ctx = &mut *self.ctx;
        match ctx.history.get(&key) {
            None => return Err(KernelError::UnknownEvent { lp, key }),
            Some(ev) if ev.is_executed() || key == EventKey::ORIGIN => {
                return Err(protocol_violation(lp, ctx.state, "remove_event on executed event"));
            }
            Some(_) => {}
        }
        ctx.history.remove(&key).ok_or(KernelError::UnknownEvent { lp, key })
    }

    /// Flags a causality violation detected by the dispatcher.
    pub fn request_rollback(&mut self, destination: EventKey) -> Result<()> {
        let ctx = &mut *self.ctx;
        match ctx.state {
            LpState::Ready | LpState::Blocked | LpState::RollbackPending => {
                ctx.mark_rollback(destination);
                Ok(())
            }
            state => Err(protocol_violation(ctx.id, state, "request_rollback")),
        }
    }

    /// Puts the LP in commit-horizon realignment mode. The LP stays there,
    /// whatever rollbacks it goes through, until `end_gvt_realignment`.
    pub fn begin_gvt_realignment(&mut self) -> Result<()> {
        let ctx = &mut *self.ctx;
        match ctx.state {
            LpState::Ready | LpState::Blocked => {
                ctx.realign_tag = ctx.state;
                ctx.state = LpState::OnGvt;
                Ok(())
            }
            state => Err(protocol_violation(ctx.id, state, "begin_gvt_realignment")),
        }
    }

    /// Brings the state buffer back to the execution bound and leaves
    /// realignment mode. If the realignment replay fails the LP stays in
    /// `OnGvt` and the call can be retried.
    pub fn end_gvt_realignment(&mut self) -> Result<()> {
        let lp = self.ctx.id;
        if self.ctx.state != LpState::OnGvt {
            return Err(protocol_violation(lp, self.ctx.state, "end_gvt_realignment"));
        }
        if self.ctx.misaligned {
            let bound = self.ctx.bound;
            self.rollback(bound.timestamp, bound.tie_breaker)?;
            if self.ctx.misaligned {
                tracing::error!("LP {}: replay did not reach the execution bound {}", lp, bound);
                return Err(KernelError::RealignmentFailed(lp));
            }
        }
        self.ctx.state = self.ctx.realign_tag;
        tracing::trace!("LP {} back at its execution bound {}", lp, self.ctx.bound);
        Ok(())
    }

    /// Executes the next event forward. `None` when there is nothing to
    /// execute or the LP is blocked.
    pub fn execute_next(&mut self) -> Result<Option<ExecutionReport>> {
        let lp = self.ctx.id;
        let env = self.env;
        let ctx = &mut *self.ctx;
        match ctx.state {
            LpState::Ready => {}
            LpState::Blocked => return Ok(None),
            state => return Err(protocol_violation(lp, state, "execute_next")),
        }

        let key = loop {
            let Some(next) = ctx.history.next_after(&ctx.bound) else {
                return Ok(None);
            };
            let key = next.key();
            if next.is_valid() {
                break key;
            }
            tracing::trace!("LP {} drops invalid event {} before execution", lp, key);
            ctx.history.remove(&key);
        };

        let epoch = ctx.epoch.epoch();
        let Some(event) = ctx.history.get_mut(&key) else {
            return Err(KernelError::UnknownEvent { lp, key });
        };
        let mut windows = std::mem::take(&mut event.windows);
        let mut outgoing = Vec::new();
        let started = Instant::now();
        let io = if env.config.reversible_io {
            IoMode::Buffered { windows: &mut windows, coordinator: env.io, limit: env.config.window_limit() }
        } else {
            IoMode::Direct { coordinator: env.io }
        };
        let mut exec = ExecContext::new(lp, key, event.kind, &event.payload, epoch, &mut ctx.rng, &mut outgoing, io);
        let outcome = env.model.execute(&mut exec, &mut ctx.buffer);
        let cost = started.elapsed().as_nanos() as f64;
        event.windows = windows;
        outcome?;

        ctx.frames += 1;
        event.epoch = epoch;
        event.frame = ctx.frames;
        event.executed = true;
        ctx.bound = key;
        ctx.policy.on_event();
        ctx.stats.record_event(cost);
        ctx.since_clean = ctx.since_clean.saturating_add(1);
        env.stats.post(lp, Metric::EventCost, cost);
        tracing::trace!("LP {} executed {} (frame {})", lp, key, ctx.frames);

        let checkpointed = self.log_state()?;
        Ok(Some(ExecutionReport { key, outgoing, checkpointed }))
    }

    /// Checkpoint-or-not decision and action. Returns whether a checkpoint was taken.
    pub fn log_state(&mut self) -> Result<bool> {
        let mode = self.env.config.checkpoint_mode;
        if mode == CheckpointMode::Periodic && self.ctx.policy.tick_recalc(self.env.config.checkpoint_recalc_interval) {
            self.recalculate_period();
        }
        if self.ctx.policy.should_checkpoint(mode, self.ctx.state) {
            self.take_checkpoint()?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Recomputes the adaptive checkpoint period from the LP's running averages.
    pub fn recalculate_period(&mut self) -> u32 {
        let lp = self.ctx.id;
        let ctx = &mut *self.ctx;
        if let Some(period) = adaptive_period(&ctx.stats, self.env.config.max_checkpoint_period) {
            if period != ctx.policy.period {
                tracing::debug!("LP {} checkpoint period {} -> {}", lp, ctx.policy.period, period);
            }
            ctx.policy.period = period;
            self.env.stats.post(lp, Metric::CheckpointPeriod, f64::from(period));
        }
        ctx.policy.period
    }

    /// Captures the LP state right after its last executed event.
    pub fn take_checkpoint(&mut self) -> Result<CheckpointRef> {
        let lp = self.ctx.id;
        let ctx = &mut *self.ctx;
        // a realigning buffer does not match the bound it would be logged under
        if matches!(ctx.state, LpState::SilentExec | LpState::OnGvt) {
            return Err(protocol_violation(lp, ctx.state, "take_checkpoint"));
        }
        let started = Instant::now();
        let log = self.env.snapshots.capture(&ctx.buffer)?;
        let cost = started.elapsed().as_nanos() as f64;
        let tag = match ctx.state {
            LpState::Blocked => LpState::Blocked,
            _ => LpState::Ready,
        };
        let (id, displaced) = ctx.checkpoints.push(ctx.bound, log, ctx.rng, ctx.frames, tag);
        if let Some(old) = displaced {
            self.env.snapshots.delete(old);
        }
        ctx.stats.record_checkpoint(cost);
        self.env.stats.post(lp, Metric::CheckpointTaken, 1.0);
        self.env.stats.post(lp, Metric::CheckpointCost, cost);
        let ckpt = ctx.checkpoints.get(id)?;
        tracing::trace!("LP {} checkpoint {:?} at {}", lp, id, ctx.bound);
        CheckpointRef::of(lp, ckpt)
    }

    /// Restores `checkpoint` into the state buffer. Returns the frame count
    /// recorded with it.
    pub fn restore_state(&mut self, checkpoint: CheckpointRef) -> Result<u64> {
        let ctx = &mut *self.ctx;
        let ckpt = ctx.checkpoints.get(checkpoint.id)?;
        let key = ckpt.last_event()?;
        ctx.buffer = self.env.snapshots.restore(ckpt.log()?)?;
        ctx.rng = ckpt.rng;
        ctx.misaligned = key != ctx.bound;
        Ok(ckpt.frames)
    }

    pub fn force_checkpoint(&mut self) {
        self.ctx.policy.force();
    }

    pub fn set_checkpoint_period(&mut self, period: u32) -> Result<()> {
        if period == 0 {
            return Err(KernelError::Config("checkpoint period must be at least 1".into()));
        }
        self.ctx.policy.period = period;
        Ok(())
    }

    /// Replaces the state buffer. The next decision takes a checkpoint.
    pub fn set_state(&mut self, state: M::State) {
        self.ctx.buffer = state;
        self.ctx.misaligned = false;
        self.ctx.policy.force();
    }

    pub fn block(&mut self) -> Result<()> {
        let ctx = &mut *self.ctx;
        match ctx.state {
            LpState::Ready | LpState::Blocked => {
                ctx.state = LpState::Blocked;
                Ok(())
            }
            state => Err(protocol_violation(ctx.id, state, "block")),
        }
    }

    pub fn unblock(&mut self) -> Result<()> {
        let ctx = &mut *self.ctx;
        match ctx.state {
            LpState::Ready | LpState::Blocked => {
                ctx.state = LpState::Ready;
                Ok(())
            }
            state => Err(protocol_violation(ctx.id, state, "unblock")),
        }
    }

    /// Replays the events after `start` against the current state buffer up
    /// to `(until, tie_breaker)`. The boundary is inclusive while the LP
    /// realigns to a commit horizon, exclusive otherwise. Returns the number
    /// of events replayed.
    pub fn silent_execution(&mut self, start: EventKey, until: SimTime, tie_breaker: u32) -> Result<u64> {
        let lp = self.ctx.id;
        let env = self.env;
        let ctx = &mut *self.ctx;
        let prev = ctx.state;
        if prev == LpState::SilentExec {
            return Err(protocol_violation(lp, prev, "silent_execution"));
        }
        let realigning = prev == LpState::OnGvt;
        let boundary = if realigning { Boundary::Inclusive } else { Boundary::Exclusive };
        let target = ReplayTarget::new(EventKey::new(until, tie_breaker), boundary);
        let guard: &dyn ReplayGuard = if realigning { &Uninterruptible } else { env.rollback_guard() };
        ctx.state = LpState::SilentExec;
        let outcome = replay::silent_execution(env.model, lp, &ctx.history, &mut ctx.buffer, &mut ctx.rng, start, target, guard);
        ctx.state = prev;
        let outcome = outcome?;
        if realigning {
            ctx.misaligned |= outcome.replayed > 0;
        } else {
            ctx.bound = outcome.last;
        }
        ctx.stats.events_replayed += outcome.replayed;
        env.stats.post(lp, Metric::SilentEvents, outcome.replayed as f64);
        Ok(outcome.replayed)
    }

    /// Calls `f` on the state of the LP as of `horizon`, then brings the LP
    /// back to its speculative present.
    pub fn with_committed_state<R>(&mut self, horizon: SimTime, f: impl FnOnce(&M::State) -> R) -> Result<R> {
        self.begin_gvt_realignment()?;
        let target = EventKey::new(horizon, u32::MAX).min(self.ctx.bound);
        let out = self.rollback(target.timestamp, target.tie_breaker).map(|_| f(&self.ctx.buffer));
        let back = self.end_gvt_realignment();
        let out = out?;
        back?;
        Ok(out)
    }

    // Reversible I/O.

    /// Folds the forward windows of every executed event below `horizon`
    /// into the LP's certified window and records the horizon.
    pub fn io_collect(&mut self, horizon: SimTime) -> Result<usize> {
        let lp = self.ctx.id;
        let ctx = &mut *self.ctx;
        let mut folded = 0;
        if ctx.collected_upto < ctx.bound {
            let mut last = ctx.collected_upto;
            for event in ctx.history.range_mut(ctx.collected_upto, ctx.bound) {
                if event.timestamp() >= horizon {
                    break;
                }
                let epoch = event.epoch;
                if event.is_valid() && event.executed {
                    if let Some(mut window) = event.windows.take_forward(epoch) {
                        ctx.io_window.merge(&mut window);
                        folded += 1;
                    }
                } else {
                    event.windows.discard_forward();
                }
                event.windows.clear_reverse();
                last = event.key();
            }
            ctx.collected_upto = last;
        }
        // nothing below the next unexecuted event can be certified yet
        let effective = match ctx.history.next_after(&ctx.bound) {
            Some(next) => horizon.min(next.timestamp()),
            None => horizon,
        };
        self.env.io.set_horizon(lp, effective)?;
        Ok(folded)
    }

    /// Undoes the I/O of one event: its forward window is dropped and its
    /// in-place writes are restored, newest first.
    pub fn io_rollback(&mut self, key: EventKey) -> Result<()> {
        let lp = self.ctx.id;
        let event = self.ctx.history.get_mut(&key).ok_or(KernelError::UnknownEvent { lp, key })?;
        event.windows.discard_forward();
        for record in event.windows.take_reverse() {
            self.env.io.restore(&record)?;
        }
        Ok(())
    }
}
