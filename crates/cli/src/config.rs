// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Run configuration: an optional JSON file, then command-line overrides.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use timewarp_kernel::KernelConfig;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub kernel: KernelConfig,
    pub lps: u32,
    /// Events seeded into every LP before the run starts.
    pub initial_events: u32,
    /// No message is scheduled past this time.
    pub end_time: f64,
    pub mean_delay: f64,
    /// Minimum delay of every message; keeps timestamps strictly increasing.
    pub lookahead: f64,
    pub seed: u64,
    /// Events an LP may run ahead per scheduling round.
    pub batch: u32,
    /// Forward executions between two commit-horizon passes.
    pub gvt_interval: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            kernel: KernelConfig { clean_interval: 64, ..KernelConfig::default() },
            lps: 8,
            initial_events: 4,
            end_time: 100.0,
            mean_delay: 1.0,
            lookahead: 0.1,
            seed: 7,
            batch: 16,
            gvt_interval: 256,
        }
    }
}

impl RunConfig {
    /// Defaults, overlaid with `path` when given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                serde_json::from_str(&raw).with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.kernel.validate()?;
        if self.lps == 0 {
            bail!("lps must be at least 1");
        }
        if !(self.end_time.is_finite() && self.end_time > 0.0) {
            bail!("end_time must be a positive finite number");
        }
        if !(self.lookahead > 0.0 && self.mean_delay > 0.0) {
            bail!("lookahead and mean_delay must be positive");
        }
        if self.batch == 0 || self.gvt_interval == 0 {
            bail!("batch and gvt_interval must be at least 1");
        }
        Ok(())
    }
}
