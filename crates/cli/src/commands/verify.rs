// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use anyhow::{bail, Result};

use super::run::{simulate, RunOptions};
use crate::config::RunConfig;

pub struct Verdict {
    pub digest: String,
    pub rollbacks: u64,
    pub antimessages: u64,
}

/// Runs the model once in timestamp order and once optimistically. Rollback
/// is correct only if both runs end in the same states with the same
/// committed output.
pub fn check(config: &RunConfig) -> Result<Verdict> {
    let ordered = simulate(config, &RunOptions::default())?;
    let optimistic = simulate(config, &RunOptions { optimistic: true, ..RunOptions::default() })?;

    if ordered.summary.rollbacks != 0 {
        tracing::warn!("Ordered run rolled back {} times", ordered.summary.rollbacks);
    }
    if let Some(lp) = ordered.states.iter().zip(&optimistic.states).position(|(a, b)| a != b) {
        bail!("LP {} diverged: ordered {:?}, optimistic {:?}", lp, ordered.states[lp], optimistic.states[lp]);
    }
    if ordered.output != optimistic.output {
        bail!(
            "committed output diverged ({} bytes ordered, {} bytes optimistic)",
            ordered.output.len(),
            optimistic.output.len()
        );
    }
    if ordered.digest != optimistic.digest {
        bail!("digest mismatch: {} != {}", ordered.digest, optimistic.digest);
    }
    Ok(Verdict {
        digest: optimistic.digest,
        rollbacks: optimistic.summary.rollbacks,
        antimessages: optimistic.summary.antimessages,
    })
}

pub fn run(config: &RunConfig) -> Result<()> {
    match check(config) {
        Ok(verdict) => {
            println!("\n✅ VERIFIED\n");
            println!("Digest:        {}", verdict.digest);
            println!("Rollbacks:     {}", verdict.rollbacks);
            println!("Antimessages:  {}\n", verdict.antimessages);
            Ok(())
        }
        Err(err) => {
            println!("\n❌ DIVERGED\n");
            Err(err)
        }
    }
}
