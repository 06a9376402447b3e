// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Kernel configuration.

use crate::error::{KernelError, Result};
use crate::io::WindowLimit;
use serde::{Deserialize, Serialize};

/// Default number of events between two checkpoints in periodic mode.
pub const DEFAULT_CHECKPOINT_PERIOD: u32 = 10;

/// Upper clamp for the adaptive checkpoint period.
pub const DEFAULT_MAX_CHECKPOINT_PERIOD: u32 = 128;

/// Checkpoint decisions between two recomputations of the adaptive period.
pub const DEFAULT_RECALC_INTERVAL: u32 = 512;

/// Forward executions between two fossil collections of one LP.
pub const CLEAN_CKP_INTERVAL: u32 = 1000;

/// Payload bytes one event may buffer before its window policy applies.
pub const DEFAULT_WINDOW_CAPACITY: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointMode {
    /// A checkpoint after every executed event.
    AlwaysCopy,
    /// A checkpoint every `period` events, the period adapted at runtime.
    #[default]
    Periodic,
}

/// What an event's forward I/O window does once its payload would exceed
/// `io_window_capacity`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BufferPolicy {
    /// Keep buffering; the capacity is only a hint.
    #[default]
    Grow,
    /// Fail the write with `ResourceExhausted`.
    Reject,
    /// Drop the oldest buffered operations of the event until the write fits.
    Overwrite,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub checkpoint_mode: CheckpointMode,
    pub checkpoint_period: u32,
    pub max_checkpoint_period: u32,
    pub checkpoint_recalc_interval: u32,
    pub clean_interval: u32,
    pub resumable_rollback: bool,
    pub reversible_io: bool,
    pub io_buffer_policy: BufferPolicy,
    pub io_window_capacity: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            checkpoint_mode: CheckpointMode::Periodic,
            checkpoint_period: DEFAULT_CHECKPOINT_PERIOD,
            max_checkpoint_period: DEFAULT_MAX_CHECKPOINT_PERIOD,
            checkpoint_recalc_interval: DEFAULT_RECALC_INTERVAL,
            clean_interval: CLEAN_CKP_INTERVAL,
            resumable_rollback: false,
            reversible_io: true,
            io_buffer_policy: BufferPolicy::Grow,
            io_window_capacity: DEFAULT_WINDOW_CAPACITY,
        }
    }
}

impl KernelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_period == 0 {
            return Err(KernelError::Config("checkpoint_period must be at least 1".into()));
        }
        if self.max_checkpoint_period < self.checkpoint_period {
            return Err(KernelError::Config(format!(
                "max_checkpoint_period ({}) is below checkpoint_period ({})",
                self.max_checkpoint_period, self.checkpoint_period
            )));
        }
        if self.checkpoint_recalc_interval == 0 {
            return Err(KernelError::Config("checkpoint_recalc_interval must be at least 1".into()));
        }
        if self.clean_interval == 0 {
            return Err(KernelError::Config("clean_interval must be at least 1".into()));
        }
        if self.io_window_capacity == 0 && self.io_buffer_policy != BufferPolicy::Grow {
            return Err(KernelError::Config(format!(
                "io_window_capacity must be at least 1 with the {:?} policy",
                self.io_buffer_policy
            )));
        }
        Ok(())
    }

    pub fn window_limit(&self) -> WindowLimit {
        WindowLimit { policy: self.io_buffer_policy, capacity: self.io_window_capacity }
    }
}
