// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use anyhow::{Context, Result};
use comfy_table::presets::UTF8_FULL;
use comfy_table::{ContentArrangement, Table};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use timewarp_kernel::io::{IoTarget, MemorySink, ReversibleIo};
use timewarp_kernel::stats::{MetricsSink, StatsSink};
use timewarp_kernel::{FullCopy, Kernel};

use crate::config::RunConfig;
use crate::dispatch::{Dispatcher, RunSummary, Schedule};
use crate::phold::{read_ledger, Phold, PholdState, LEDGER_SLOT};
use crate::telemetry;

#[derive(Clone, Debug, Default)]
pub struct RunOptions {
    /// Append target for the event log. Kept in memory when absent.
    pub output: Option<PathBuf>,
    /// Seekable target holding every LP's received count.
    pub ledger: Option<PathBuf>,
    pub optimistic: bool,
    pub metrics: bool,
}

pub struct RunOutcome {
    pub summary: RunSummary,
    pub states: Vec<PholdState>,
    /// Committed event log.
    pub output: Vec<u8>,
    pub digest: String,
    pub table: Table,
}

impl RunOptions {
    pub fn schedule(&self, config: &RunConfig) -> Schedule {
        if self.optimistic {
            Schedule::Optimistic { batch: config.batch }
        } else {
            Schedule::Ordered
        }
    }
}

/// Wires a PHOLD kernel to the given targets and seeds it.
pub fn build(
    config: &RunConfig,
    schedule: Schedule,
    log: Option<IoTarget>,
    ledger: Option<IoTarget>,
    sink: Option<Arc<dyn StatsSink>>,
) -> Result<Dispatcher> {
    let io = Arc::new(ReversibleIo::new());
    let model = Phold {
        lps: config.lps,
        mean_delay: config.mean_delay,
        lookahead: config.lookahead,
        end_time: config.end_time,
        log: log.map(|t| io.register(t)),
        ledger: ledger.map(|t| io.register(t)),
    };
    let mut kernel = Kernel::new(config.kernel.clone(), model, FullCopy)?.with_io(io);
    if let Some(sink) = sink {
        kernel = kernel.with_stats_sink(sink);
    }
    Dispatcher::new(kernel, config, schedule)
}

fn open_ledger(path: &Path, lps: u32) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("Failed to open ledger {}", path.display()))?;
    // restores truncate to the pre-write length, so every slot must exist up front
    file.set_len(u64::from(lps) * LEDGER_SLOT)?;
    Ok(file)
}

/// Runs the simulation described by `config` and collects everything worth reporting.
pub fn simulate(config: &RunConfig, opts: &RunOptions) -> Result<RunOutcome> {
    let memory = MemorySink::new();
    let log = match &opts.output {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("Failed to create output {}", path.display()))?;
            IoTarget::Append(Box::new(file))
        }
        None => IoTarget::Append(Box::new(memory.clone())),
    };
    let ledger = match &opts.ledger {
        Some(path) => Some(IoTarget::Seekable(Box::new(open_ledger(path, config.lps)?))),
        None => None,
    };
    let sink: Option<Arc<dyn StatsSink>> = opts.metrics.then(|| Arc::new(MetricsSink) as Arc<dyn StatsSink>);

    let mut dispatcher = build(config, opts.schedule(config), Some(log), ledger, sink)?;
    let summary = dispatcher.run()?.clone();

    let output = match &opts.output {
        Some(path) => std::fs::read(path)?,
        None => memory.contents(),
    };
    let kernel = dispatcher.kernel();
    let mut states = Vec::with_capacity(config.lps as usize);
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["LP", "Received", "Executed", "Replayed", "Rollbacks", "Checkpoints", "Collected", "Period"]);
    for lp in kernel.lp_ids() {
        let ctx = kernel.lp(lp)?;
        let stats = ctx.stats();
        table.add_row(vec![
            lp.to_string(),
            ctx.buffer().received.to_string(),
            stats.events_executed.to_string(),
            stats.events_replayed.to_string(),
            stats.rollbacks.to_string(),
            stats.checkpoints.to_string(),
            stats.checkpoints_collected.to_string(),
            ctx.period().to_string(),
        ]);
        states.push(ctx.buffer().clone());
    }
    let digest = dispatcher.digest(&output)?;

    if let Some(path) = &opts.ledger {
        let counts = read_ledger(&std::fs::read(path)?);
        let expected: Vec<u64> = states.iter().map(|s| s.received).collect();
        if counts != expected {
            anyhow::bail!("ledger {} does not match the final LP states", path.display());
        }
    }

    Ok(RunOutcome { summary, states, output, digest, table })
}

pub fn run(config: &RunConfig, opts: &RunOptions) -> Result<()> {
    let outcome = simulate(config, opts)?;
    let s = &outcome.summary;

    println!("\nPer-LP statistics\n");
    println!("{}\n", outcome.table);
    println!("Executed:       {}", s.executed);
    println!("Stragglers:     {}", s.stragglers);
    println!("Rollbacks:      {}", s.rollbacks);
    println!("Antimessages:   {}", s.antimessages);
    println!("GVT passes:     {}", s.gvt_passes);
    println!("Committed I/O:  {}", s.committed_io);
    println!("Digest:         {}\n", outcome.digest);

    if opts.metrics {
        println!("{}", telemetry::get_metrics());
    }
    Ok(())
}
