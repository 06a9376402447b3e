// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Identity types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Validated index of a logical process inside the kernel arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct LpId(pub u32);

impl LpId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of an externally visible I/O target registered with the coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IoHandle {
    pub(crate) id: u32,
    pub(crate) seekable: bool,
}

impl IoHandle {
    pub fn id(self) -> u32 {
        self.id
    }

    /// Seekable targets are written in place and restored from pre-images.
    pub fn is_seekable(self) -> bool {
        self.seekable
    }
}
