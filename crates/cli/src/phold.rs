// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! PHOLD: every event schedules one more event at a random LP after an
//! exponential delay, until the end time.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use timewarp_kernel::{ExecContext, IoHandle, LpId, Model, SimTime};

pub const KIND_PING: u32 = 1;

/// Bytes per LP slot in the ledger target.
pub const LEDGER_SLOT: u64 = 8;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PholdState {
    pub received: u64,
    pub digest: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct Phold {
    pub lps: u32,
    pub mean_delay: f64,
    pub lookahead: f64,
    pub end_time: f64,
    /// Append target: one line per executed event.
    pub log: Option<IoHandle>,
    /// Seekable target: each LP's received count at `lp * LEDGER_SLOT`.
    pub ledger: Option<IoHandle>,
}

impl Model for Phold {
    type State = PholdState;

    fn execute(&self, ctx: &mut ExecContext<'_>, state: &mut PholdState) -> timewarp_kernel::Result<()> {
        let now = ctx.now().as_f64();
        state.received += 1;
        state.digest = (state.digest ^ now.to_bits()).wrapping_mul(0x0000_0100_0000_01b3);

        if let Some(log) = self.log {
            ctx.write(log, format!("{} {:.6}\n", ctx.lp(), now).as_bytes())?;
        }
        if let Some(ledger) = self.ledger {
            let mut slot = [0u8; LEDGER_SLOT as usize];
            LittleEndian::write_u64(&mut slot, state.received);
            ctx.write_at(ledger, u64::from(ctx.lp().0) * LEDGER_SLOT, &slot)?;
        }

        let at = now + self.lookahead + ctx.rng().exponential(self.mean_delay);
        if at > self.end_time {
            return Ok(());
        }
        let receiver = LpId(ctx.rng().next_u32() % self.lps);
        ctx.send(receiver, SimTime::new(at)?, KIND_PING, Vec::new())
    }
}

/// Reads back the received counts written to a ledger.
pub fn read_ledger(bytes: &[u8]) -> Vec<u64> {
    bytes.chunks_exact(LEDGER_SLOT as usize).map(LittleEndian::read_u64).collect()
}
