// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Sequential Time Warp dispatcher.
//!
//! Stands in for the parallel runtime and its GVT computation around the
//! rollback core. With `Schedule::Ordered` events run
//! in global timestamp order and no straggler ever appears; with
//! `Schedule::Optimistic` every LP runs a batch of events ahead of the others
//! and the kernel has to repair the resulting causality violations.

use anyhow::Result;
use byteorder::{LittleEndian, WriteBytesExt};
use timewarp_kernel::{Event, EventKey, InsertOutcome, Kernel, LpId, LpRng, LpState, OutgoingMessage, SimTime, Validity};

use crate::config::RunConfig;
use crate::phold::{Phold, PholdState, KIND_PING};

/// Tie-breaker of a delivered message. Derived from the parent only, so a
/// re-executed event resends under the same key whatever the schedule.
fn tie_breaker(sender: LpId, msg: &OutgoingMessage) -> u32 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for word in [u64::from(sender.0), msg.parent.key.timestamp.as_f64().to_bits(), u64::from(msg.parent.key.tie_breaker)] {
        h = (h ^ word).wrapping_mul(0x0000_0100_0000_01b3);
    }
    (h >> 32) as u32
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Schedule {
    Ordered,
    Optimistic { batch: u32 },
}

/// A message delivered by the dispatcher, remembered until it is committed
/// so it can be cancelled if its parent is undone.
#[derive(Clone, Copy, Debug)]
struct SentMessage {
    parent: EventKey,
    receiver: LpId,
    key: EventKey,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RunSummary {
    pub executed: u64,
    pub stragglers: u64,
    pub rollbacks: u64,
    pub antimessages: u64,
    pub gvt_passes: u64,
    pub checkpoints_collected: u64,
    pub committed_io: u64,
    pub final_gvt: f64,
}

pub struct Dispatcher {
    kernel: Kernel<Phold>,
    schedule: Schedule,
    gvt_interval: u32,
    sent: Vec<Vec<SentMessage>>,
    since_gvt: u32,
    summary: RunSummary,
}

impl Dispatcher {
    /// Registers `config.lps` LPs with `kernel` and seeds their initial events.
    pub fn new(mut kernel: Kernel<Phold>, config: &RunConfig, schedule: Schedule) -> Result<Self> {
        let mut ids = Vec::with_capacity(config.lps as usize);
        for _ in 0..config.lps {
            ids.push(kernel.add_lp(PholdState::default(), config.seed)?);
        }
        let mut rng = LpRng::new(config.seed, u64::from(u32::MAX));
        for &lp in &ids {
            for i in 0..config.initial_events {
                let ts = SimTime::new(config.lookahead + rng.exponential(config.mean_delay))?;
                kernel.insert_event(Event::new(lp, ts, i, KIND_PING, Vec::new()))?;
            }
        }
        tracing::info!("Dispatcher ready: {} LPs, {:?}", ids.len(), schedule);
        Ok(Self {
            kernel,
            schedule,
            gvt_interval: config.gvt_interval,
            sent: vec![Vec::new(); ids.len()],
            since_gvt: 0,
            summary: RunSummary::default(),
        })
    }

    pub fn kernel(&self) -> &Kernel<Phold> {
        &self.kernel
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Runs until no LP has anything left to execute, then flushes and
    /// closes every I/O target.
    pub fn run(&mut self) -> Result<&RunSummary> {
        loop {
            let progressed = match self.schedule {
                Schedule::Ordered => self.step_ordered()?,
                Schedule::Optimistic { batch } => self.round(batch)?,
            };
            if self.since_gvt >= self.gvt_interval {
                self.commit_pass()?;
            }
            if !progressed {
                break;
            }
        }
        self.commit_pass()?;
        self.kernel.io_flush()?;
        self.kernel.io_destroy()?;
        self.summary.committed_io = self.kernel.io().committed();
        tracing::info!(
            "Run finished: {} executed, {} rollbacks, {} antimessages",
            self.summary.executed,
            self.summary.rollbacks,
            self.summary.antimessages
        );
        Ok(&self.summary)
    }

    /// Executes the globally earliest pending event.
    fn step_ordered(&mut self) -> Result<bool> {
        let mut best: Option<(EventKey, LpId)> = None;
        for lp in self.kernel.lp_ids() {
            let ctx = self.kernel.lp(lp)?;
            if let Some(next) = ctx.history().next_after(&ctx.bound()) {
                if best.map_or(true, |(key, _)| next.key() < key) {
                    best = Some((next.key(), lp));
                }
            }
        }
        match best {
            Some((_, lp)) => self.execute(lp),
            None => Ok(false),
        }
    }

    /// Lets every LP execute up to `batch` events regardless of the others.
    fn round(&mut self, batch: u32) -> Result<bool> {
        let ids: Vec<LpId> = self.kernel.lp_ids().collect();
        let mut progressed = false;
        for lp in ids {
            for _ in 0..batch {
                if !self.execute(lp)? {
                    break;
                }
                progressed = true;
            }
        }
        Ok(progressed)
    }

    fn execute(&mut self, lp: LpId) -> Result<bool> {
        if self.kernel.lp(lp)?.state() != LpState::Ready {
            return Ok(false);
        }
        let Some(report) = self.kernel.execute_next(lp)? else {
            return Ok(false);
        };
        self.summary.executed += 1;
        self.since_gvt += 1;
        let mut straggler = false;
        for msg in report.outgoing {
            straggler |= self.deliver(lp, msg)?;
        }
        if straggler {
            self.settle_rollbacks()?;
        }
        Ok(true)
    }

    fn deliver(&mut self, sender: LpId, msg: OutgoingMessage) -> Result<bool> {
        let event = Event::new(msg.receiver, msg.timestamp, tie_breaker(sender, &msg), msg.kind, msg.payload)
            .with_sender(sender)
            .with_parent(msg.parent);
        let key = event.key();
        let outcome = self.kernel.insert_event(event)?;
        self.sent[sender.index()].push(SentMessage { parent: msg.parent.key, receiver: msg.receiver, key });
        match outcome {
            InsertOutcome::Scheduled => Ok(false),
            InsertOutcome::Straggler { destination } => {
                tracing::debug!("Straggler {} from LP {} to LP {}", destination, sender, msg.receiver);
                self.summary.stragglers += 1;
                Ok(true)
            }
        }
    }

    /// Rolls back every LP awaiting it, cancelling the messages sent by the
    /// undone events, until no LP is left in `RollbackPending`.
    fn settle_rollbacks(&mut self) -> Result<()> {
        loop {
            let pending: Vec<LpId> = self
                .kernel
                .lp_ids()
                .filter(|&lp| self.kernel.lp(lp).map_or(false, |c| c.state() == LpState::RollbackPending))
                .collect();
            if pending.is_empty() {
                return Ok(());
            }
            for lp in pending {
                let report = self.kernel.rollback_forward(lp)?;
                if !report.completed {
                    continue;
                }
                self.summary.rollbacks += 1;
                self.purge_cancelled(lp)?;

                let bound = self.kernel.lp(lp)?.bound();
                let (undone, kept): (Vec<_>, Vec<_>) =
                    std::mem::take(&mut self.sent[lp.index()]).into_iter().partition(|m| m.parent > bound);
                self.sent[lp.index()] = kept;
                for msg in undone {
                    self.cancel(msg)?;
                }
            }
        }
    }

    /// Antimessage: an unexecuted target is removed outright, an executed
    /// one is invalidated and its LP rolled back on the next settle pass.
    fn cancel(&mut self, msg: SentMessage) -> Result<()> {
        let executed = match self.kernel.lp(msg.receiver)?.history().get(&msg.key) {
            Some(event) => event.is_executed(),
            None => return Ok(()),
        };
        if executed {
            self.kernel.invalidate_event(msg.receiver, msg.key, Validity::AntiMessage)?;
        } else {
            self.kernel.remove_event(msg.receiver, msg.key)?;
        }
        self.summary.antimessages += 1;
        Ok(())
    }

    /// Drops the invalidated events a rollback just undid.
    fn purge_cancelled(&mut self, lp: LpId) -> Result<()> {
        let keys: Vec<EventKey> = self
            .kernel
            .lp(lp)?
            .history()
            .iter()
            .filter(|e| !e.is_valid() && !e.is_executed())
            .map(|e| e.key())
            .collect();
        for key in keys {
            self.kernel.remove_event(lp, key)?;
        }
        Ok(())
    }

    /// Lower bound on every timestamp a rollback can still target: the
    /// earliest unexecuted event over all LPs. Only meaningful once every
    /// rollback has settled.
    pub fn gvt(&self) -> Result<SimTime> {
        let mut gvt = SimTime::INFINITY;
        for lp in self.kernel.lp_ids() {
            let ctx = self.kernel.lp(lp)?;
            if let Some(next) = ctx.history().next_after(&ctx.bound()) {
                gvt = gvt.min(next.timestamp());
            }
        }
        Ok(gvt)
    }

    /// Certifies output and collects fossils below the current GVT.
    fn commit_pass(&mut self) -> Result<()> {
        self.settle_rollbacks()?;
        let gvt = self.gvt()?;
        let ids: Vec<LpId> = self.kernel.lp_ids().collect();
        for lp in ids {
            match self.kernel.maybe_collect_fossils(lp, gvt)? {
                Some(report) => self.summary.checkpoints_collected += report.checkpoints_deleted as u64,
                None => {
                    self.kernel.io_collect(lp, gvt)?;
                }
            }
            self.sent[lp.index()].retain(|m| m.parent.timestamp >= gvt);
        }
        let performed = self.kernel.io_execute()?;
        let reclaimed = self.kernel.io_clean();
        tracing::debug!("GVT {}: {} operations committed, {} nodes reclaimed", gvt, performed, reclaimed);
        self.summary.gvt_passes += 1;
        self.summary.final_gvt = gvt.as_f64();
        self.since_gvt = 0;
        Ok(())
    }

    /// blake3 digest over every LP state, then `output`.
    pub fn digest(&self, output: &[u8]) -> Result<String> {
        let mut buf = Vec::new();
        for lp in self.kernel.lp_ids() {
            let state = self.kernel.lp(lp)?.buffer();
            buf.write_u32::<LittleEndian>(lp.0)?;
            buf.write_u64::<LittleEndian>(state.received)?;
            buf.write_u64::<LittleEndian>(state.digest)?;
        }
        let mut hasher = blake3::Hasher::new();
        hasher.update(&buf);
        hasher.update(output);
        Ok(hasher.finalize().to_hex().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::run::build;

    fn config() -> RunConfig {
        RunConfig { lps: 3, end_time: 20.0, batch: 6, gvt_interval: 16, ..RunConfig::default() }
    }

    #[test]
    fn test_optimistic_run_settles_everything() {
        let mut dispatcher = build(&config(), Schedule::Optimistic { batch: 6 }, None, None, None).unwrap();
        let summary = dispatcher.run().unwrap().clone();
        assert!(summary.stragglers > 0);
        assert!(summary.rollbacks > 0);
        assert_eq!(summary.final_gvt, f64::INFINITY);

        let kernel = dispatcher.kernel();
        for lp in kernel.lp_ids() {
            let ctx = kernel.lp(lp).unwrap();
            assert_eq!(ctx.state(), LpState::Ready);
            assert!(ctx.history().next_after(&ctx.bound()).is_none(), "LP {} left work behind", lp);
            assert!(ctx.history().iter().all(|e| e.is_valid()));
        }
    }

    #[test]
    fn test_schedules_agree_on_final_state() {
        let mut ordered = build(&config(), Schedule::Ordered, None, None, None).unwrap();
        let mut optimistic = build(&config(), Schedule::Optimistic { batch: 6 }, None, None, None).unwrap();
        let a = ordered.run().unwrap().executed;
        optimistic.run().unwrap();
        assert_eq!(ordered.digest(&[]).unwrap(), optimistic.digest(&[]).unwrap());

        let received: u64 = optimistic.kernel().lp_ids().map(|lp| optimistic.kernel().lp(lp).unwrap().buffer().received).sum();
        assert_eq!(received, a);
    }

    #[test]
    fn test_tie_breaker_depends_on_parent_only() {
        use timewarp_kernel::epoch::{Epoch, ParentLink};
        let parent = ParentLink { lp: LpId(1), key: EventKey::new(SimTime::from(3), 4), epoch: Epoch(0) };
        let msg = |epoch| OutgoingMessage {
            receiver: LpId(2),
            timestamp: SimTime::from(5),
            kind: KIND_PING,
            payload: Vec::new(),
            parent: ParentLink { epoch, ..parent },
        };
        assert_eq!(tie_breaker(LpId(1), &msg(Epoch(0))), tie_breaker(LpId(1), &msg(Epoch(7))));
        assert_ne!(tie_breaker(LpId(1), &msg(Epoch(0))), tie_breaker(LpId(0), &msg(Epoch(0))));
    }
}
