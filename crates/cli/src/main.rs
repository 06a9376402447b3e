// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use timewarp_cli::commands::{config, run, verify};
use timewarp_cli::config::RunConfig;
use timewarp_cli::telemetry;
use timewarp_kernel::CheckpointMode;

#[derive(Parser)]
#[command(name = "timewarp")]
#[command(about = "Optimistic PHOLD driver for the Time Warp rollback kernel", long_about = None)]
struct Cli {
    /// JSON run configuration; flags below override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Overrides {
    #[arg(long, global = true)]
    lps: Option<u32>,

    #[arg(long, global = true)]
    end_time: Option<f64>,

    #[arg(long, global = true)]
    seed: Option<u64>,

    /// Events an LP may run ahead per round
    #[arg(long, global = true)]
    batch: Option<u32>,

    #[arg(long, global = true)]
    gvt_interval: Option<u32>,

    /// Fixed checkpoint period (the adaptive policy still recalculates it)
    #[arg(long, global = true)]
    period: Option<u32>,

    /// Checkpoint after every event
    #[arg(long, global = true)]
    always_copy: bool,

    /// Keep interrupted replays resumable
    #[arg(long, global = true)]
    resumable: bool,

    /// Write output directly instead of deferring it to the commit horizon
    #[arg(long, global = true)]
    direct_io: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run PHOLD and print per-LP statistics
    Run {
        /// Run optimistically instead of in timestamp order
        #[arg(long)]
        optimistic: bool,

        /// File receiving the committed event log
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// File receiving every LP's received count, written in place
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Export kernel metrics and print them after the run
        #[arg(long)]
        metrics: bool,
    },
    /// Check that an optimistic run matches a timestamp-ordered one
    Verify,
    /// Print the effective configuration
    Config,
}

impl Overrides {
    fn apply(&self, config: &mut RunConfig) {
        if let Some(lps) = self.lps {
            config.lps = lps;
        }
        if let Some(end_time) = self.end_time {
            config.end_time = end_time;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(batch) = self.batch {
            config.batch = batch;
        }
        if let Some(interval) = self.gvt_interval {
            config.gvt_interval = interval;
        }
        if let Some(period) = self.period {
            config.kernel.checkpoint_period = period;
            config.kernel.max_checkpoint_period = config.kernel.max_checkpoint_period.max(period);
        }
        if self.always_copy {
            config.kernel.checkpoint_mode = CheckpointMode::AlwaysCopy;
        }
        if self.resumable {
            config.kernel.resumable_rollback = true;
        }
        if self.direct_io {
            config.kernel.reversible_io = false;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let metrics = matches!(cli.command, Commands::Run { metrics: true, .. });
    telemetry::init_telemetry(metrics)?;

    let mut cfg = RunConfig::load(cli.config.as_deref())?;
    cli.overrides.apply(&mut cfg);
    cfg.validate()?;

    match cli.command {
        Commands::Run {
            optimistic,
            output,
            ledger,
            metrics,
        } => run::run(&cfg, &run::RunOptions { output, ledger, optimistic, metrics }),
        Commands::Verify => verify::run(&cfg),
        Commands::Config => config::run(&cfg),
    }
}
