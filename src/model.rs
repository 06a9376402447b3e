// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! The event-execution callback and the context handed to it.

use crate::epoch::{Epoch, ParentLink};
use crate::error::{KernelError, Result};
use crate::io::{EventWindows, IoOp, IoOpKind, ReversibleIo, WindowLimit};
use crate::types::{EventKey, IoHandle, LpId, SimTime};
use serde::{Deserialize, Serialize};

/// Simulation model: executes one event against one LP state buffer.
///
/// When `ctx.is_silent()` the call is reconstructing already-settled state;
/// `send` and the I/O calls are ignored by the context in that case.
pub trait Model {
    type State;

    fn execute(&self, ctx: &mut ExecContext<'_>, state: &mut Self::State) -> Result<()>;
}

/// Per-LP PCG32 stream. Saved in every checkpoint so replay draws the same numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LpRng {
    state: u64,
    inc: u64,
}

impl LpRng {
    pub fn new(seed: u64, stream: u64) -> Self {
        let mut rng = Self { state: 0, inc: (stream << 1) | 1 };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    pub fn next_u32(&mut self) -> u32 {
        let oldstate = self.state;
        self.state = oldstate.wrapping_mul(6364136223846793005).wrapping_add(self.inc);
        let xorshifted = (((oldstate >> 18) ^ oldstate) >> 27) as u32;
        let rot = (oldstate >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        f64::from(self.next_u32()) / (f64::from(u32::MAX) + 1.0)
    }

    /// Exponentially distributed with the given mean.
    pub fn exponential(&mut self, mean: f64) -> f64 {
        -mean * (1.0 - self.next_f64()).ln()
    }
}

/// A message produced by forward execution, handed back to the dispatcher.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingMessage {
    pub receiver: LpId,
    pub timestamp: SimTime,
    pub kind: u32,
    pub payload: Vec<u8>,
    pub parent: ParentLink,
}

pub(crate) enum IoMode<'a> {
    /// Silent replay: nothing leaves the LP.
    Suppressed,
    /// Writes go to the event's windows.
    Buffered { windows: &'a mut EventWindows, coordinator: &'a ReversibleIo, limit: WindowLimit },
    /// Reversible I/O disabled: writes go straight to the target.
    Direct { coordinator: &'a ReversibleIo },
}

pub struct ExecContext<'a> {
    lp: LpId,
    key: EventKey,
    kind: u32,
    payload: &'a [u8],
    epoch: Epoch,
    rng: &'a mut LpRng,
    outgoing: &'a mut Vec<OutgoingMessage>,
    io: IoMode<'a>,
}

impl<'a> ExecContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        lp: LpId,
        key: EventKey,
        kind: u32,
        payload: &'a [u8],
        epoch: Epoch,
        rng: &'a mut LpRng,
        outgoing: &'a mut Vec<OutgoingMessage>,
        io: IoMode<'a>,
    ) -> Self {
        Self { lp, key, kind, payload, epoch, rng, outgoing, io }
    }

    pub fn lp(&self) -> LpId {
        self.lp
    }

    pub fn now(&self) -> SimTime {
        self.key.timestamp
    }

    pub fn key(&self) -> EventKey {
        self.key
    }

    pub fn kind(&self) -> u32 {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        self.payload
    }

    pub fn is_silent(&self) -> bool {
        matches!(self.io, IoMode::Suppressed)
    }

    pub fn rng(&mut self) -> &mut LpRng {
        self.rng
    }

    /// Schedules a message. Dropped during silent replay.
    pub fn send(&mut self, receiver: LpId, timestamp: SimTime, kind: u32, payload: Vec<u8>) -> Result<()> {
        if timestamp < self.key.timestamp {
            return Err(KernelError::InvalidTimestamp(timestamp.as_f64()));
        }
        if self.is_silent() {
            return Ok(());
        }
        self.outgoing.push(OutgoingMessage {
            receiver,
            timestamp,
            kind,
            payload,
            parent: ParentLink { lp: self.lp, key: self.key, epoch: self.epoch },
        });
        Ok(())
    }

    /// Appends `bytes` to an append-only target. Fails with
    /// `ResourceExhausted` when the event's window is full under the reject
    /// policy.
    pub fn write(&mut self, handle: IoHandle, bytes: &[u8]) -> Result<()> {
        self.intercept(IoOp { handle, kind: IoOpKind::Write(bytes.to_vec()) })
    }

    pub fn close(&mut self, handle: IoHandle) -> Result<()> {
        self.intercept(IoOp { handle, kind: IoOpKind::Close })
    }

    /// Writes `bytes` at `offset` of a seekable target. The pre-image is kept
    /// with the event so a rollback can restore it.
    pub fn write_at(&mut self, handle: IoHandle, offset: u64, bytes: &[u8]) -> Result<()> {
        if !handle.is_seekable() {
            return Err(KernelError::UnknownIoHandle(handle.id()));
        }
        let now = self.key.timestamp;
        match &mut self.io {
            IoMode::Suppressed => Ok(()),
            IoMode::Buffered { windows, coordinator, .. } => {
                let record = coordinator.write_in_place(handle, offset, bytes, now)?;
                windows.push_reverse(self.epoch, record);
                Ok(())
            }
            IoMode::Direct { coordinator } => {
                coordinator.write_in_place(handle, offset, bytes, now)?;
                Ok(())
            }
        }
    }

    fn intercept(&mut self, op: IoOp) -> Result<()> {
        let now = self.key.timestamp;
        match &mut self.io {
            IoMode::Suppressed => Ok(()),
            IoMode::Buffered { windows, limit, .. } => windows.buffer(self.epoch, op, now, *limit),
            IoMode::Direct { coordinator } => coordinator.perform_now(op),
        }
    }
}
