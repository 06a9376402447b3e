// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Reversible I/O coordinator.
//!
//! Holds the real targets, the per-LP horizon table and the ordering heap over
//! the per-LP certified windows. Everything here sits behind one lock; LPs
//! only append to their own window through the `Producer` they got at
//! registration.

use super::buffer::{IoOp, IoOpKind, IoTarget, ReverseRecord};
use super::heap::{HeapOrder, IoHeap};
use super::queue::{Consumer, NbQueue, Producer};
use crate::error::{KernelError, Result};
use crate::types::{IoHandle, LpId, SimTime};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::io::{Read, Seek, SeekFrom, Write};

struct TargetSlot {
    target: Option<IoTarget>,
}

struct Committer {
    heap: IoHeap<Consumer<IoOp>>,
    horizons: FxHashMap<LpId, SimTime>,
    targets: FxHashMap<u32, TargetSlot>,
    next_handle: u32,
    committed: u64,
}

pub struct ReversibleIo {
    inner: Mutex<Committer>,
}

impl Default for ReversibleIo {
    fn default() -> Self {
        Self::new()
    }
}

impl ReversibleIo {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Committer {
                heap: IoHeap::new(HeapOrder::Min),
                horizons: FxHashMap::default(),
                targets: FxHashMap::default(),
                next_handle: 0,
                committed: 0,
            }),
        }
    }

    /// Creates the certified window of `lp`. Its horizon starts unset, which
    /// blocks every commit until the LP collects for the first time.
    pub fn register_lp(&self, lp: LpId) -> Result<Producer<IoOp>> {
        let (producer, consumer) = NbQueue::new().split();
        let mut inner = self.inner.lock();
        inner.heap.insert(lp, consumer)?;
        inner.horizons.insert(lp, SimTime::NEG_INFINITY);
        Ok(producer)
    }

    pub fn register(&self, target: IoTarget) -> IoHandle {
        let seekable = matches!(target, IoTarget::Seekable(_));
        let mut inner = self.inner.lock();
        let id = inner.next_handle;
        inner.next_handle += 1;
        inner.targets.insert(id, TargetSlot { target: Some(target) });
        tracing::debug!("Registered I/O target {} (seekable: {})", id, seekable);
        IoHandle { id, seekable }
    }

    /// Records `horizon` for `lp` (horizons never move back) and re-keys the
    /// LP's heap entry, whose window may have grown since the last call.
    pub fn set_horizon(&self, lp: LpId, horizon: SimTime) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = inner.horizons.get_mut(&lp).ok_or(KernelError::UnknownLp(lp))?;
        if horizon > *slot {
            *slot = horizon;
        }
        inner.heap.update_key(lp);
        Ok(())
    }

    pub fn horizon(&self, lp: LpId) -> Option<SimTime> {
        self.inner.lock().horizons.get(&lp).copied()
    }

    pub fn global_horizon(&self) -> SimTime {
        self.inner.lock().global_horizon()
    }

    /// Performs, in timestamp order, every buffered operation below the
    /// global horizon. Returns how many were performed.
    ///
    /// An operation leaves its window only once it was performed: on error
    /// the failed operation stays at the head of its window for the next call
    /// and the ones performed before it are already counted as committed.
    pub fn execute(&self) -> Result<usize> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let global = inner.global_horizon();
        let mut performed = 0;
        let outcome = loop {
            match inner.heap.peek_key() {
                Some(key) if key < global => {}
                _ => break Ok(()),
            }
            let Some((lp, timestamp, op)) = inner.heap.peek_item() else {
                break Ok(());
            };
            tracing::trace!("Committing I/O of LP {} at {} on handle {}", lp, timestamp, op.handle.id);
            if let Err(e) = perform(&mut inner.targets, op) {
                tracing::warn!("I/O of LP {} at {} failed, kept for retry: {}", lp, timestamp, e);
                break Err(e);
            }
            inner.heap.poll();
            performed += 1;
        };
        inner.committed += performed as u64;
        outcome.map(|()| performed)
    }

    /// Performs `op` immediately, bypassing the windows. Used when reversible
    /// I/O is disabled.
    pub fn perform_now(&self, op: IoOp) -> Result<()> {
        let mut inner = self.inner.lock();
        perform(&mut inner.targets, &op)?;
        inner.committed += 1;
        Ok(())
    }

    /// Applies a write to a seekable target in place and returns the pre-image.
    pub fn write_in_place(&self, handle: IoHandle, offset: u64, bytes: &[u8], timestamp: SimTime) -> Result<ReverseRecord> {
        let mut inner = self.inner.lock();
        let store = match inner.targets.get_mut(&handle.id).and_then(|s| s.target.as_mut()) {
            Some(IoTarget::Seekable(store)) => store,
            _ => return Err(KernelError::UnknownIoHandle(handle.id)),
        };
        let prev_len = store.seek(SeekFrom::End(0))?;
        let mut preimage = Vec::new();
        if offset < prev_len {
            let available = (prev_len - offset).min(bytes.len() as u64);
            preimage.resize(available as usize, 0);
            store.seek(SeekFrom::Start(offset))?;
            store.read_exact(&mut preimage)?;
        }
        store.seek(SeekFrom::Start(offset))?;
        store.write_all(bytes)?;
        Ok(ReverseRecord { handle, timestamp, offset, preimage, prev_len })
    }

    /// Undoes one in-place write.
    pub fn restore(&self, record: &ReverseRecord) -> Result<()> {
        let mut inner = self.inner.lock();
        let store = match inner.targets.get_mut(&record.handle.id).and_then(|s| s.target.as_mut()) {
            Some(IoTarget::Seekable(store)) => store,
            _ => return Err(KernelError::UnknownIoHandle(record.handle.id)),
        };
        store.seek(SeekFrom::Start(record.offset))?;
        store.write_all(&record.preimage)?;
        store.truncate(record.prev_len)?;
        Ok(())
    }

    /// Reclaims the nodes already consumed from every certified window.
    pub fn clean(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.heap.queues_mut().map(|q| q.clean()).sum()
    }

    /// Closes every target whose close was never committed.
    pub fn destroy(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut ids: Vec<u32> = inner.targets.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            if let Some(slot) = inner.targets.get_mut(&id) {
                if let Some(mut target) = slot.target.take() {
                    tracing::debug!("Closing target {} left open", id);
                    close(&mut target)?;
                }
            }
        }
        inner.targets.clear();
        Ok(())
    }

    pub fn committed(&self) -> u64 {
        self.inner.lock().committed
    }

    pub fn is_closed(&self, handle: IoHandle) -> bool {
        self.inner.lock().targets.get(&handle.id).map_or(true, |s| s.target.is_none())
    }
}

impl Committer {
    fn global_horizon(&self) -> SimTime {
        self.horizons.values().copied().min().unwrap_or(SimTime::NEG_INFINITY)
    }
}

fn perform(targets: &mut FxHashMap<u32, TargetSlot>, op: &IoOp) -> Result<()> {
    let slot = targets.get_mut(&op.handle.id).ok_or(KernelError::UnknownIoHandle(op.handle.id))?;
    let Some(target) = slot.target.as_mut() else {
        tracing::warn!("Dropping operation on closed target {}", op.handle.id);
        return Ok(());
    };
    match &op.kind {
        IoOpKind::Write(bytes) => match target {
            IoTarget::Append(w) => w.write_all(bytes)?,
            IoTarget::Seekable(s) => {
                s.seek(SeekFrom::End(0))?;
                s.write_all(bytes)?;
            }
        },
        IoOpKind::Close => {
            if let Some(mut target) = slot.target.take() {
                close(&mut target)?;
            }
        }
    }
    Ok(())
}

fn close(target: &mut IoTarget) -> Result<()> {
    match target {
        IoTarget::Append(w) => w.flush()?,
        IoTarget::Seekable(s) => s.flush()?,
    }
    Ok(())
}
