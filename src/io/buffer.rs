// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Buffered I/O operations and the per-event windows that hold them.

use super::queue::NbQueue;
use crate::config::BufferPolicy;
use crate::epoch::Epoch;
use crate::error::{KernelError, Result};
use crate::types::{IoHandle, SimTime};
use parking_lot::Mutex;
use std::io::{self, Cursor, Read, Seek, Write};
use std::sync::Arc;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IoOpKind {
    Write(Vec<u8>),
    Close,
}

/// A deferred operation on an append-only target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IoOp {
    pub handle: IoHandle,
    pub kind: IoOpKind,
}

impl IoOp {
    /// Payload bytes held by the operation.
    pub fn payload_len(&self) -> usize {
        match &self.kind {
            IoOpKind::Write(bytes) => bytes.len(),
            IoOpKind::Close => 0,
        }
    }
}

/// Capacity of one event's forward window and what happens past it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowLimit {
    pub policy: BufferPolicy,
    pub capacity: usize,
}

impl Default for WindowLimit {
    fn default() -> Self {
        Self { policy: BufferPolicy::Grow, capacity: usize::MAX }
    }
}

/// Pre-image of an in-place write on a seekable target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReverseRecord {
    pub handle: IoHandle,
    pub timestamp: SimTime,
    pub offset: u64,
    pub preimage: Vec<u8>,
    /// Length of the target before the write, to undo extensions.
    pub prev_len: u64,
}

/// Storage that can be restored in place.
pub trait SeekStore: Read + Write + Seek + Send {
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl SeekStore for std::fs::File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

impl SeekStore for Cursor<Vec<u8>> {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        let len = usize::try_from(len).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "length overflow"))?;
        self.get_mut().truncate(len);
        Ok(())
    }
}

pub enum IoTarget {
    /// Append-only target: writes are deferred until committed.
    Append(Box<dyn Write + Send>),
    /// Seekable target: writes land immediately, pre-images allow restoring.
    Seekable(Box<dyn SeekStore>),
}

impl std::fmt::Debug for IoTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IoTarget::Append(_) => f.write_str("IoTarget::Append"),
            IoTarget::Seekable(_) => f.write_str("IoTarget::Seekable"),
        }
    }
}

/// Shared in-memory append target, handy for inspecting committed output.
#[derive(Clone, Debug, Default)]
pub struct MemorySink(Arc<Mutex<Vec<u8>>>);

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.lock().clone()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Forward and reverse windows owned by one event.
#[derive(Debug, Default)]
pub struct EventWindows {
    forward: Option<NbQueue<IoOp>>,
    /// Payload bytes buffered in `forward`.
    forward_bytes: usize,
    reverse: Vec<ReverseRecord>,
    reverse_epoch: Epoch,
}

impl EventWindows {
    pub fn is_empty(&self) -> bool {
        self.forward.as_ref().map_or(true, |w| w.is_empty()) && self.reverse.is_empty()
    }

    pub fn forward_bytes(&self) -> usize {
        self.forward_bytes
    }

    /// Forward window for interception under `epoch`. A window tagged with
    /// another epoch is stale: its contents are dropped and it is re-tagged.
    pub fn forward_for(&mut self, epoch: Epoch) -> &mut NbQueue<IoOp> {
        let current = self.forward.as_ref().map(|w| w.epoch());
        if current != Some(epoch.0) {
            if let Some(stale) = current {
                tracing::trace!("Discarding stale forward window (epoch {} != {})", stale, epoch.0);
            }
            let window = NbQueue::new();
            window.set_epoch(epoch.0);
            self.forward = Some(window);
            self.forward_bytes = 0;
        }
        self.forward.get_or_insert_with(NbQueue::new)
    }

    /// Appends `op` to the forward window of `epoch`. `limit` decides what
    /// happens when the window's payload would exceed its capacity.
    pub fn buffer(&mut self, epoch: Epoch, op: IoOp, now: SimTime, limit: WindowLimit) -> Result<()> {
        let len = op.payload_len();
        self.forward_for(epoch);
        if self.forward_bytes.saturating_add(len) > limit.capacity {
            match limit.policy {
                BufferPolicy::Grow => {}
                BufferPolicy::Reject => {
                    tracing::debug!("Forward window full ({} + {} > {}), write rejected", self.forward_bytes, len, limit.capacity);
                    return Err(KernelError::ResourceExhausted("forward I/O window"));
                }
                BufferPolicy::Overwrite => self.evict(len, limit.capacity),
            }
        }
        self.forward_for(epoch).append(op, now);
        self.forward_bytes += len;
        Ok(())
    }

    /// Drops the oldest forward operations until `incoming` more bytes fit.
    /// An operation larger than the whole capacity empties the window.
    fn evict(&mut self, incoming: usize, capacity: usize) {
        let Some(window) = self.forward.as_mut() else {
            return;
        };
        let mut dropped = 0;
        while self.forward_bytes.saturating_add(incoming) > capacity {
            let Some((_, old)) = window.pop() else {
                break;
            };
            self.forward_bytes -= old.payload_len();
            dropped += 1;
        }
        window.clean();
        tracing::debug!("Overwrote {} buffered operations to fit {} bytes", dropped, incoming);
    }

    pub fn push_reverse(&mut self, epoch: Epoch, record: ReverseRecord) {
        if self.reverse_epoch != epoch {
            self.reverse.clear();
            self.reverse_epoch = epoch;
        }
        self.reverse.push(record);
    }

    /// Hands out the forward window if it was produced under `epoch`; a
    /// mismatching window is discarded.
    pub fn take_forward(&mut self, epoch: Epoch) -> Option<NbQueue<IoOp>> {
        self.forward_bytes = 0;
        let window = self.forward.take()?;
        if window.epoch() == epoch.0 {
            Some(window)
        } else {
            None
        }
    }

    pub fn discard_forward(&mut self) {
        self.forward = None;
        self.forward_bytes = 0;
    }

    /// Pre-images, newest first.
    pub fn take_reverse(&mut self) -> impl Iterator<Item = ReverseRecord> {
        std::mem::take(&mut self.reverse).into_iter().rev()
    }

    pub fn clear_reverse(&mut self) {
        self.reverse.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(id: u32) -> IoOp {
        IoOp { handle: IoHandle { id, seekable: false }, kind: IoOpKind::Close }
    }

    fn text(bytes: &[u8]) -> IoOp {
        IoOp { handle: IoHandle { id: 0, seekable: false }, kind: IoOpKind::Write(bytes.to_vec()) }
    }

    fn limit(policy: BufferPolicy, capacity: usize) -> WindowLimit {
        WindowLimit { policy, capacity }
    }

    fn buffered(windows: &mut EventWindows, epoch: Epoch) -> Vec<IoOp> {
        windows.take_forward(epoch).map(|mut w| w.drain().into_iter().map(|(_, o)| o).collect()).unwrap_or_default()
    }

    #[test]
    fn test_grow_policy_keeps_everything() {
        let mut windows = EventWindows::default();
        let now = SimTime::from(1);
        for chunk in [&b"abcd"[..], b"efgh", b"ij"] {
            windows.buffer(Epoch(0), text(chunk), now, limit(BufferPolicy::Grow, 4)).unwrap();
        }
        assert_eq!(windows.forward_bytes(), 10);
        assert_eq!(buffered(&mut windows, Epoch(0)).len(), 3);
        assert_eq!(windows.forward_bytes(), 0);
    }

    #[test]
    fn test_reject_policy_refuses_overflowing_write() {
        let mut windows = EventWindows::default();
        let now = SimTime::from(1);
        let full = limit(BufferPolicy::Reject, 6);
        windows.buffer(Epoch(0), text(b"abcd"), now, full).unwrap();
        assert!(matches!(
            windows.buffer(Epoch(0), text(b"efg"), now, full),
            Err(KernelError::ResourceExhausted(_))
        ));
        // a close carries no payload
        windows.buffer(Epoch(0), op(0), now, full).unwrap();
        windows.buffer(Epoch(0), text(b"ef"), now, full).unwrap();
        assert_eq!(buffered(&mut windows, Epoch(0)), vec![text(b"abcd"), op(0), text(b"ef")]);
    }

    #[test]
    fn test_overwrite_policy_drops_oldest() {
        let mut windows = EventWindows::default();
        let now = SimTime::from(1);
        let ring = limit(BufferPolicy::Overwrite, 6);
        for chunk in [&b"ab"[..], b"cd", b"ef", b"gh"] {
            windows.buffer(Epoch(0), text(chunk), now, ring).unwrap();
        }
        assert_eq!(windows.forward_bytes(), 6);
        assert_eq!(buffered(&mut windows, Epoch(0)), vec![text(b"cd"), text(b"ef"), text(b"gh")]);

        windows.buffer(Epoch(1), text(b"abc"), now, ring).unwrap();
        windows.buffer(Epoch(1), text(b"0123456789"), now, ring).unwrap();
        assert_eq!(buffered(&mut windows, Epoch(1)), vec![text(b"0123456789")]);
    }

    #[test]
    fn test_stale_window_resets_byte_count() {
        let mut windows = EventWindows::default();
        let ring = limit(BufferPolicy::Reject, 4);
        windows.buffer(Epoch(0), text(b"abcd"), SimTime::from(1), ring).unwrap();
        windows.buffer(Epoch(1), text(b"wxyz"), SimTime::from(1), ring).unwrap();
        assert_eq!(windows.forward_bytes(), 4);
    }

    #[test]
    fn test_stale_forward_window_is_discarded_on_access() {
        let mut windows = EventWindows::default();
        windows.forward_for(Epoch(0)).append(op(1), SimTime::from(1));
        assert!(!windows.is_empty());

        let fresh = windows.forward_for(Epoch(1));
        assert!(fresh.is_empty(), "epoch 0 contents must not survive into epoch 1");
        assert_eq!(fresh.epoch(), 1);
    }

    #[test]
    fn test_take_forward_checks_tag() {
        let mut windows = EventWindows::default();
        windows.forward_for(Epoch(2)).append(op(1), SimTime::from(1));
        assert!(windows.take_forward(Epoch(3)).is_none());

        windows.forward_for(Epoch(3)).append(op(2), SimTime::from(1));
        let mut w = windows.take_forward(Epoch(3)).unwrap();
        assert_eq!(w.pop().map(|(_, o)| o), Some(op(2)));
    }

    #[test]
    fn test_reverse_records_come_back_newest_first() {
        let mut windows = EventWindows::default();
        for offset in 0..3u64 {
            windows.push_reverse(
                Epoch(0),
                ReverseRecord {
                    handle: IoHandle { id: 0, seekable: true },
                    timestamp: SimTime::from(1),
                    offset,
                    preimage: vec![],
                    prev_len: 0,
                },
            );
        }
        let offsets: Vec<u64> = windows.take_reverse().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![2, 1, 0]);
    }
}
