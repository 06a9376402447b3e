// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The kernel instance: an arena of LP contexts plus the collaborators every
//! LP shares (model, snapshot strategy, I/O coordinator, statistics sink,
//! replay guard).
//!
//! Per-LP operations live on `LpWorker`; the `Kernel` methods taking an
//! `LpId` look the LP up and delegate. `workers` splits the arena into one
//! worker per LP for callers that drive LPs concurrently.

use crate::checkpoint::CheckpointRef;
use crate::config::{CheckpointMode, KernelConfig};
use crate::epoch::{Lineage, ParentLink};
use crate::error::{KernelError, Result};
use crate::event::{Event, Validity};
use crate::fossil::FossilReport;
use crate::io::{IoTarget, ReversibleIo};
use crate::lp::{LpContext, LpState};
use crate::model::{LpRng, Model, OutgoingMessage};
use crate::replay::{ReplayGuard, Uninterruptible};
use crate::rollback::RollbackReport;
use crate::snapshot::{FullCopy, SnapshotStrategy};
use crate::stats::{NullSink, StatsSink};
use crate::types::{EventKey, IoHandle, LpId, SimTime};
use crate::worker::{Env, LpWorker};
use std::sync::Arc;

/// Result of inserting an event into an LP history.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Scheduled,
    /// The event lands before the execution point; the LP now awaits a rollback.
    Straggler { destination: EventKey },
}

#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionReport {
    pub key: EventKey,
    pub outgoing: Vec<OutgoingMessage>,
    pub checkpointed: bool,
}

pub type LpArena<M, P> = Vec<LpContext<<M as Model>::State, <P as SnapshotStrategy<<M as Model>::State>>::Log>>;

pub struct Kernel<M: Model, P: SnapshotStrategy<M::State> = FullCopy> {
    pub(crate) config: KernelConfig,
    pub(crate) model: M,
    pub(crate) snapshots: P,
    pub(crate) lps: LpArena<M, P>,
    pub(crate) io: Arc<ReversibleIo>,
    pub(crate) stats: Arc<dyn StatsSink>,
    pub(crate) guard: Arc<dyn ReplayGuard>,
}

pub(crate) fn protocol_violation(lp: LpId, state: LpState, op: &str) -> KernelError {
    tracing::warn!("{} rejected on LP {} in state {:?}", op, lp, state);
    KernelError::ProtocolViolation { lp, state }
}

impl<M: Model, P: SnapshotStrategy<M::State>> Kernel<M, P> {
    pub fn new(config: KernelConfig, model: M, snapshots: P) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            "Kernel initialised: mode={:?} period={} resumable={} reversible_io={} io_buffer_policy={:?}",
            config.checkpoint_mode,
            config.checkpoint_period,
            config.resumable_rollback,
            config.reversible_io,
            config.io_buffer_policy
        );
        Ok(Self {
            config,
            model,
            snapshots,
            lps: Vec::new(),
            io: Arc::new(ReversibleIo::new()),
            stats: Arc::new(NullSink),
            guard: Arc::new(Uninterruptible),
        })
    }

    pub fn with_stats_sink(mut self, sink: Arc<dyn StatsSink>) -> Self {
        self.stats = sink;
        self
    }

    /// Shares an existing coordinator, e.g. one whose targets were
    /// registered before the model was built. Install before adding LPs.
    pub fn with_io(mut self, io: Arc<ReversibleIo>) -> Self {
        debug_assert!(self.lps.is_empty(), "LP windows are registered with the old coordinator");
        self.io = io;
        self
    }

    /// Installs the guard that may interrupt rollback replays. It is only
    /// consulted when `resumable_rollback` is enabled.
    pub fn with_replay_guard(mut self, guard: Arc<dyn ReplayGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn io(&self) -> &Arc<ReversibleIo> {
        &self.io
    }

    pub fn lp_count(&self) -> usize {
        self.lps.len()
    }

    pub fn lp_ids(&self) -> impl Iterator<Item = LpId> {
        (0..self.lps.len() as u32).map(LpId)
    }

    pub fn lp(&self, lp: LpId) -> Result<&LpContext<M::State, P::Log>> {
        self.lps.get(lp.index()).ok_or(KernelError::UnknownLp(lp))
    }

    fn split(&mut self) -> (Env<'_, M, P>, &mut LpArena<M, P>) {
        let env = Env {
            config: &self.config,
            model: &self.model,
            snapshots: &self.snapshots,
            io: self.io.as_ref(),
            stats: self.stats.as_ref(),
            guard: self.guard.as_ref(),
        };
        (env, &mut self.lps)
    }

    /// Exclusive handle on one LP.
    pub fn worker(&mut self, lp: LpId) -> Result<LpWorker<'_, M, P>> {
        let (env, lps) = self.split();
        let ctx = lps.get_mut(lp.index()).ok_or(KernelError::UnknownLp(lp))?;
        Ok(LpWorker::new(env, ctx))
    }

    /// One handle per LP, in id order. The handles borrow disjoint contexts
    /// and can be moved to different threads when the model, the snapshot
    /// strategy and the LP state allow it.
    pub fn workers(&mut self) -> Vec<LpWorker<'_, M, P>> {
        let (env, lps) = self.split();
        lps.iter_mut().map(|ctx| LpWorker::new(env, ctx)).collect()
    }

    /// Registers a new LP with `initial` as its state. The LP starts at the
    /// origin event with one checkpoint referencing it.
    pub fn add_lp(&mut self, initial: M::State, seed: u64) -> Result<LpId> {
        let id = LpId(self.lps.len() as u32);
        let window = self.io.register_lp(id)?;
        let rng = LpRng::new(seed, u64::from(id.0));
        let mut ctx = LpContext::new(id, initial, rng, self.config.checkpoint_period, window);
        ctx.policy.force();
        self.lps.push(ctx);
        if !self.worker(id)?.log_state()? {
            return Err(KernelError::EmptyCheckpointLog(id));
        }
        tracing::debug!("Registered LP {}", id);
        Ok(id)
    }

    pub fn io_register(&self, target: IoTarget) -> IoHandle {
        self.io.register(target)
    }

    /// Inserts `event` into its receiver's history.
    pub fn insert_event(&mut self, event: Event) -> Result<InsertOutcome> {
        self.worker(event.receiver)?.insert_event(event)
    }

    pub fn invalidate_event(&mut self, lp: LpId, key: EventKey, validity: Validity) -> Result<InsertOutcome> {
        self.worker(lp)?.invalidate_event(key, validity)
    }

    pub fn remove_event(&mut self, lp: LpId, key: EventKey) -> Result<Event> {
        self.worker(lp)?.remove_event(key)
    }

    pub fn request_rollback(&mut self, lp: LpId, destination: EventKey) -> Result<()> {
        self.worker(lp)?.request_rollback(destination)
    }

    pub fn begin_gvt_realignment(&mut self, lp: LpId) -> Result<()> {
        self.worker(lp)?.begin_gvt_realignment()
    }

    pub fn end_gvt_realignment(&mut self, lp: LpId) -> Result<()> {
        self.worker(lp)?.end_gvt_realignment()
    }

    pub fn execute_next(&mut self, lp: LpId) -> Result<Option<ExecutionReport>> {
        self.worker(lp)?.execute_next()
    }

    pub fn log_state(&mut self, lp: LpId) -> Result<bool> {
        self.worker(lp)?.log_state()
    }

    pub fn recalculate_period(&mut self, lp: LpId) -> Result<u32> {
        Ok(self.worker(lp)?.recalculate_period())
    }

    pub fn take_checkpoint(&mut self, lp: LpId) -> Result<CheckpointRef> {
        self.worker(lp)?.take_checkpoint()
    }

    pub fn restore_state(&mut self, lp: LpId, checkpoint: CheckpointRef) -> Result<u64> {
        self.worker(lp)?.restore_state(checkpoint)
    }

    /// Newest checkpoint taken at or before `time`.
    pub fn find_time_barrier(&self, lp: LpId, time: SimTime) -> Result<CheckpointRef> {
        let ctx = self.lp(lp)?;
        let ckpt = ctx.checkpoints.find_at_or_before(time).ok_or(KernelError::EmptyCheckpointLog(lp))?;
        CheckpointRef::of(lp, ckpt)
    }

    pub fn force_checkpoint(&mut self, lp: LpId) -> Result<()> {
        self.worker(lp)?.force_checkpoint();
        Ok(())
    }

    pub fn set_checkpoint_mode(&mut self, mode: CheckpointMode) {
        self.config.checkpoint_mode = mode;
    }

    pub fn set_checkpoint_period(&mut self, lp: LpId, period: u32) -> Result<()> {
        self.worker(lp)?.set_checkpoint_period(period)
    }

    pub fn set_state(&mut self, lp: LpId, state: M::State) -> Result<()> {
        self.worker(lp)?.set_state(state);
        Ok(())
    }

    pub fn block(&mut self, lp: LpId) -> Result<()> {
        self.worker(lp)?.block()
    }

    pub fn unblock(&mut self, lp: LpId) -> Result<()> {
        self.worker(lp)?.unblock()
    }

    pub fn silent_execution(&mut self, lp: LpId, start: EventKey, until: SimTime, tie_breaker: u32) -> Result<u64> {
        self.worker(lp)?.silent_execution(start, until, tie_breaker)
    }

    pub fn with_committed_state<R>(&mut self, lp: LpId, horizon: SimTime, f: impl FnOnce(&M::State) -> R) -> Result<R> {
        self.worker(lp)?.with_committed_state(horizon, f)
    }

    pub fn rollback(&mut self, lp: LpId, destination: SimTime, tie_breaker: u32) -> Result<RollbackReport> {
        self.worker(lp)?.rollback(destination, tie_breaker)
    }

    pub fn rollback_forward(&mut self, lp: LpId) -> Result<RollbackReport> {
        self.worker(lp)?.rollback_forward()
    }

    pub fn clean_checkpoint(&mut self, lp: LpId, horizon: SimTime) -> Result<FossilReport> {
        self.worker(lp)?.clean_checkpoint(horizon)
    }

    pub fn maybe_collect_fossils(&mut self, lp: LpId, horizon: SimTime) -> Result<Option<FossilReport>> {
        self.worker(lp)?.maybe_collect_fossils(horizon)
    }

    /// Whether the parent of an event still belongs to its LP's live history.
    pub fn lineage(&self, parent: &ParentLink) -> Result<Lineage> {
        Ok(parent.lineage(self.lp(parent.lp)?.epoch()))
    }

    // Reversible I/O surface.

    pub fn io_collect(&mut self, lp: LpId, horizon: SimTime) -> Result<usize> {
        self.worker(lp)?.io_collect(horizon)
    }

    pub fn io_rollback(&mut self, lp: LpId, key: EventKey) -> Result<()> {
        self.worker(lp)?.io_rollback(key)
    }

    pub fn io_execute(&self) -> Result<usize> {
        self.io.execute()
    }

    /// Forces every buffered operation out, in order. Used at shutdown.
    pub fn io_flush(&mut self) -> Result<usize> {
        for mut worker in self.workers() {
            worker.io_collect(SimTime::INFINITY)?;
            worker.ctx.io_window.append_marker(SimTime::INFINITY);
            worker.env.io.set_horizon(worker.id(), SimTime::INFINITY)?;
        }
        let performed = self.io.execute()?;
        tracing::info!("Flushed {} buffered I/O operations", performed);
        Ok(performed)
    }

    pub fn io_clean(&self) -> usize {
        self.io.clean()
    }

    pub fn io_destroy(&self) -> Result<()> {
        self.io.destroy()
    }
}
