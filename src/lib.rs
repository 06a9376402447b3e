// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.

//! timewarp-kernel: the rollback core of an optimistic (Time Warp) parallel
//! discrete-event simulation kernel.
//!
//! Logical processes execute events speculatively. When a causally earlier
//! event arrives late, the kernel restores a checkpoint, silently replays the
//! history up to the straggler and invalidates everything produced after it.
//! External I/O is buffered per event and only released once a commit
//! horizon certifies that no rollback can reach it.

pub mod checkpoint;
pub mod config;
pub mod epoch;
pub mod error;
pub mod event;
pub mod fossil;
pub mod history;
pub mod io;
pub mod kernel;
pub mod lp;
pub mod model;
pub mod replay;
pub mod rollback;
pub mod snapshot;
pub mod stats;
pub mod types;
pub mod worker;

pub use config::{BufferPolicy, CheckpointMode, KernelConfig};
pub use error::{KernelError, Result};
pub use event::{Event, Validity};
pub use fossil::FossilReport;
pub use kernel::{ExecutionReport, InsertOutcome, Kernel};
pub use lp::LpState;
pub use model::{ExecContext, LpRng, Model, OutgoingMessage};
pub use rollback::RollbackReport;
pub use snapshot::{FullCopy, Serialized, SnapshotStrategy};
pub use types::{EventKey, IoHandle, LpId, SimTime};
pub use worker::LpWorker;

#[cfg(test)]
pub mod tests;
