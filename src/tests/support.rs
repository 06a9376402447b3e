// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! A small model shared by the scenario tests.

use crate::config::{KernelConfig, DEFAULT_MAX_CHECKPOINT_PERIOD};
use crate::error::Result;
use crate::event::Event;
use crate::io::{IoTarget, ReversibleIo};
use crate::kernel::{InsertOutcome, Kernel};
use crate::model::{ExecContext, Model};
use crate::snapshot::FullCopy;
use crate::types::{IoHandle, LpId, SimTime};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub executed: u64,
    pub digest: u64,
    pub last_draw: u32,
}

/// Folds every event (and one random draw) into a running digest. Optionally
/// logs each timestamp to an append target and stamps it into a seekable one.
#[derive(Clone, Copy, Debug, Default)]
pub struct Recorder {
    pub log: Option<IoHandle>,
    pub ledger: Option<IoHandle>,
}

impl Model for Recorder {
    type State = Tally;

    fn execute(&self, ctx: &mut ExecContext<'_>, state: &mut Tally) -> Result<()> {
        let draw = ctx.rng().next_u32();
        let ts = ctx.now().as_f64() as u64;
        state.executed += 1;
        state.last_draw = draw;
        state.digest = state.digest.rotate_left(7)
            ^ ctx.now().as_f64().to_bits()
            ^ u64::from(draw)
            ^ u64::from(ctx.key().tie_breaker);
        if let Some(log) = self.log {
            ctx.write(log, format!("{};", ts).as_bytes())?;
        }
        if let Some(ledger) = self.ledger {
            ctx.write_at(ledger, 0, format!("{:04}", ts).as_bytes())?;
        }
        Ok(())
    }
}

pub fn at(ts: u32) -> SimTime {
    SimTime::from(ts)
}

pub fn kernel(config: KernelConfig, model: Recorder) -> Kernel<Recorder> {
    Kernel::new(config, model, FullCopy).unwrap()
}

/// Kernel whose model writes to an append log and a seekable ledger.
pub fn kernel_with_targets(config: KernelConfig, log: IoTarget, ledger: Option<IoTarget>) -> (Kernel<Recorder>, IoHandle, Option<IoHandle>) {
    let io = Arc::new(ReversibleIo::new());
    let log = io.register(log);
    let ledger = ledger.map(|t| io.register(t));
    let model = Recorder { log: Some(log), ledger };
    (kernel(config, model).with_io(io), log, ledger)
}

pub fn periodic(period: u32) -> KernelConfig {
    KernelConfig {
        checkpoint_period: period,
        max_checkpoint_period: period.max(DEFAULT_MAX_CHECKPOINT_PERIOD),
        ..KernelConfig::default()
    }
}

pub fn schedule(kernel: &mut Kernel<Recorder>, lp: LpId, stamps: &[u32]) {
    for &ts in stamps {
        let outcome = kernel.insert_event(Event::new(lp, at(ts), 0, 1, vec![])).unwrap();
        assert_eq!(outcome, InsertOutcome::Scheduled);
    }
}

/// Executes `lp` forward until its history is exhausted.
pub fn run_to_end(kernel: &mut Kernel<Recorder>, lp: LpId) -> usize {
    let mut executed = 0;
    while kernel.execute_next(lp).unwrap().is_some() {
        executed += 1;
    }
    executed
}

/// State reached by executing `stamps` in order without any rollback.
pub fn reference_state(stamps: &[u32], seed: u64) -> Tally {
    let mut k = kernel(periodic(DEFAULT_MAX_CHECKPOINT_PERIOD), Recorder::default());
    let lp = k.add_lp(Tally::default(), seed).unwrap();
    schedule(&mut k, lp, stamps);
    run_to_end(&mut k, lp);
    k.lp(lp).unwrap().buffer().clone()
}
