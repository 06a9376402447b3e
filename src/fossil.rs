// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Fossil collection.
//!
//! Reclaims checkpoints and history that no rollback can reach once a commit
//! horizon is known. The newest checkpoint referencing an event strictly
//! before the horizon is always retained, together with every event from
//! that checkpoint's event onwards.

use crate::error::{KernelError, Result};
use crate::model::Model;
use crate::snapshot::SnapshotStrategy;
use crate::stats::Metric;
use crate::types::SimTime;
use crate::worker::LpWorker;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FossilReport {
    pub horizon: SimTime,
    pub checkpoints_deleted: usize,
    pub events_deleted: usize,
}

impl<M: Model, P: SnapshotStrategy<M::State>> LpWorker<'_, M, P> {
    /// Deletes every checkpoint older than the newest one whose event lies
    /// strictly before `horizon`, and the history prefix before that event.
    pub fn clean_checkpoint(&mut self, horizon: SimTime) -> Result<FossilReport> {
        // side effects are certified before the events carrying them go away
        if self.env.config.reversible_io {
            self.io_collect(horizon)?;
        }

        let lp = self.ctx.id;
        let env = self.env;
        let ctx = &mut *self.ctx;
        let mut report = FossilReport { horizon, checkpoints_deleted: 0, events_deleted: 0 };
        if horizon > ctx.commit_horizon {
            ctx.commit_horizon = horizon;
        }

        let Some(keep) = ctx.checkpoints.newest_before(horizon) else {
            tracing::trace!("LP {}: no checkpoint before {}, nothing to collect", lp, horizon);
            return Ok(report);
        };
        let keep_key = ctx
            .checkpoints
            .get_index(keep)
            .ok_or(KernelError::EmptyCheckpointLog(lp))?
            .last_event()?;

        for log in ctx.checkpoints.drain_oldest(keep) {
            env.snapshots.delete(log);
            report.checkpoints_deleted += 1;
        }
        if ctx.checkpoints.is_empty() {
            tracing::error!("LP {}: fossil collection emptied the checkpoint log", lp);
            return Err(KernelError::EmptyCheckpointLog(lp));
        }

        let fossils = ctx.history.split_before(&keep_key);
        report.events_deleted = fossils.len();
        drop(fossils);

        if ctx.resume.map_or(false, |c| c.last < keep_key) {
            tracing::debug!("LP {}: resume cursor collected, dropping it", lp);
            ctx.resume = None;
        }

        ctx.stats.checkpoints_collected += report.checkpoints_deleted as u64;
        env.stats.post(lp, Metric::CheckpointsCollected, report.checkpoints_deleted as f64);
        tracing::debug!(
            "LP {} fossil collection at {}: {} checkpoints, {} events",
            lp,
            horizon,
            report.checkpoints_deleted,
            report.events_deleted
        );
        Ok(report)
    }

    /// Runs `clean_checkpoint` once every `clean_interval` forward executions.
    pub fn maybe_collect_fossils(&mut self, horizon: SimTime) -> Result<Option<FossilReport>> {
        if self.ctx.since_clean < self.env.config.clean_interval {
            return Ok(None);
        }
        self.ctx.since_clean = 0;
        self.clean_checkpoint(horizon).map(Some)
    }
}
