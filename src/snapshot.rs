// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! State capture/restore primitives used by checkpoints.

use crate::error::{KernelError, Result};
use crc64fast::Digest;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// How an LP state buffer is turned into a checkpoint log and back.
pub trait SnapshotStrategy<S> {
    type Log;

    fn capture(&self, state: &S) -> Result<Self::Log>;

    fn restore(&self, log: &Self::Log) -> Result<S>;

    fn delete(&self, log: Self::Log) {
        drop(log);
    }

    /// Approximate footprint, for statistics.
    fn size_of(&self, log: &Self::Log) -> usize;
}

/// Keeps a full clone of the state.
#[derive(Clone, Copy, Debug, Default)]
pub struct FullCopy;

impl<S: Clone> SnapshotStrategy<S> for FullCopy {
    type Log = S;

    fn capture(&self, state: &S) -> Result<S> {
        Ok(state.clone())
    }

    fn restore(&self, log: &S) -> Result<S> {
        Ok(log.clone())
    }

    fn size_of(&self, _log: &S) -> usize {
        std::mem::size_of::<S>()
    }
}

/// Keeps a bincode encoding of the state, checked with crc64 on restore.
#[derive(Clone, Copy, Debug, Default)]
pub struct Serialized;

#[derive(Clone, Debug)]
pub struct SerializedLog {
    bytes: Vec<u8>,
    checksum: u64,
}

impl SerializedLog {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

fn checksum(bytes: &[u8]) -> u64 {
    let mut digest = Digest::new();
    digest.write(bytes);
    digest.sum64()
}

impl<S: Serialize + DeserializeOwned> SnapshotStrategy<S> for Serialized {
    type Log = SerializedLog;

    fn capture(&self, state: &S) -> Result<SerializedLog> {
        let bytes = bincode::serde::encode_to_vec(state, bincode::config::standard())
            .map_err(|e| KernelError::Serialization(e.to_string()))?;
        let checksum = checksum(&bytes);
        Ok(SerializedLog { bytes, checksum })
    }

    fn restore(&self, log: &SerializedLog) -> Result<S> {
        let found = checksum(&log.bytes);
        if found != log.checksum {
            return Err(KernelError::SnapshotCorrupted { expected: log.checksum, found });
        }
        let (state, _) = bincode::serde::decode_from_slice::<S, _>(&log.bytes, bincode::config::standard())
            .map_err(|e| KernelError::Serialization(e.to_string()))?;
        Ok(state)
    }

    fn size_of(&self, log: &SerializedLog) -> usize {
        log.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Counter {
        total: u64,
        seen: Vec<u32>,
    }

    #[test]
    fn test_full_copy_is_independent() {
        let mut state = Counter { total: 3, seen: vec![1] };
        let log = SnapshotStrategy::<Counter>::capture(&FullCopy, &state).unwrap();
        state.total = 99;
        let back = SnapshotStrategy::<Counter>::restore(&FullCopy, &log).unwrap();
        assert_eq!(back.total, 3);
    }

    #[test]
    fn test_serialized_restores_equal_state() {
        let state = Counter { total: 42, seen: vec![1, 2, 3] };
        let log = SnapshotStrategy::<Counter>::capture(&Serialized, &state).unwrap();
        assert!(!log.is_empty());
        let back = SnapshotStrategy::<Counter>::restore(&Serialized, &log).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_serialized_detects_corruption() {
        let state = Counter { total: 42, seen: vec![1, 2, 3] };
        let mut log = SnapshotStrategy::<Counter>::capture(&Serialized, &state).unwrap();
        log.bytes[0] ^= 0xff;
        let res = SnapshotStrategy::<Counter>::restore(&Serialized, &log);
        assert!(matches!(res, Err(KernelError::SnapshotCorrupted { .. })));
    }
}
