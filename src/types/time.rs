// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Simulation time and the per-LP event ordering key.

use crate::error::{KernelError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Logical simulation time.
///
/// Totally ordered through `f64::total_cmp`; NaN is rejected at construction.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SimTime(f64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0.0);
    /// INFTY: later than every event of the run.
    pub const INFINITY: SimTime = SimTime(f64::INFINITY);
    pub const NEG_INFINITY: SimTime = SimTime(f64::NEG_INFINITY);

    pub fn new(value: f64) -> Result<Self> {
        if value.is_nan() {
            return Err(KernelError::InvalidTimestamp(value));
        }
        Ok(Self(value))
    }

    pub fn as_f64(self) -> f64 {
        self.0
    }

    pub fn is_infinite(self) -> bool {
        self.0 == f64::INFINITY
    }

    pub(crate) fn to_bits(self) -> u64 {
        self.0.to_bits()
    }

    pub(crate) fn from_bits(bits: u64) -> Self {
        Self(f64::from_bits(bits))
    }
}

impl From<u32> for SimTime {
    fn from(value: u32) -> Self {
        Self(f64::from(value))
    }
}

impl PartialEq for SimTime {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SimTime {}

impl PartialOrd for SimTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SimTime {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "INFTY")
        } else {
            write!(f, "{:.6}", self.0)
        }
    }
}

/// `(timestamp, tie_breaker)`: the strict total order of one LP's history.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventKey {
    pub timestamp: SimTime,
    pub tie_breaker: u32,
}

impl std::hash::Hash for SimTime {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl EventKey {
    /// Key of the origin event every history starts with.
    pub const ORIGIN: EventKey = EventKey { timestamp: SimTime::ZERO, tie_breaker: 0 };

    pub fn new(timestamp: SimTime, tie_breaker: u32) -> Self {
        Self { timestamp, tie_breaker }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.timestamp, self.tie_breaker)
    }
}
