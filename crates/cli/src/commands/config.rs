// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use crate::config::RunConfig;

/// Prints the effective configuration as JSON, ready to be edited and passed back with `--config`.
pub fn run(config: &RunConfig) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
