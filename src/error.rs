// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Error types.

use crate::lp::LpState;
use crate::types::{EventKey, LpId};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KernelError {
    /// An operation was invoked while the LP was not in a state that allows it.
    #[error("protocol violation on LP {lp}: operation not allowed in state {state:?}")]
    ProtocolViolation { lp: LpId, state: LpState },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The rollback scan discarded every checkpoint of the LP.
    #[error("no valid checkpoint survives the rollback scan of LP {0}")]
    NoValidCheckpoint(LpId),

    /// A realignment replay stopped short of its target.
    #[error("realignment of LP {0} did not reach its target")]
    RealignmentFailed(LpId),

    #[error("checkpoint log of LP {0} is empty")]
    EmptyCheckpointLog(LpId),

    /// A checkpoint was used after it had been deleted.
    #[error("stale checkpoint reference")]
    StaleCheckpoint,

    #[error("unknown LP {0}")]
    UnknownLp(LpId),

    #[error("LP {lp} has no event at {key}")]
    UnknownEvent { lp: LpId, key: EventKey },

    #[error("LP {lp} already holds an event at {key}")]
    DuplicateEvent { lp: LpId, key: EventKey },

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(f64),

    #[error("unknown I/O handle {0}")]
    UnknownIoHandle(u32),

    #[error("snapshot checksum mismatch: expected {expected:#018x}, found {found:#018x}")]
    SnapshotCorrupted { expected: u64, found: u64 },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl KernelError {
    /// Invariant violations mean the fossil collector and the rollback engine
    /// disagreed about safety margins; the simulation cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KernelError::NoValidCheckpoint(_)
                | KernelError::EmptyCheckpointLog(_)
                | KernelError::StaleCheckpoint
        )
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;
