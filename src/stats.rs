// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Per-LP running averages and the statistics sink.

use crate::types::LpId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Metric {
    CheckpointTaken,
    /// Nanoseconds spent capturing one checkpoint.
    CheckpointCost,
    /// Nanoseconds spent executing one event forward.
    EventCost,
    Rollback,
    /// Events undone by one rollback.
    RollbackLength,
    SilentEvents,
    CheckpointsCollected,
    CheckpointPeriod,
}

impl Metric {
    pub fn name(self) -> &'static str {
        match self {
            Metric::CheckpointTaken => "timewarp_checkpoints_total",
            Metric::CheckpointCost => "timewarp_checkpoint_cost_ns",
            Metric::EventCost => "timewarp_event_cost_ns",
            Metric::Rollback => "timewarp_rollbacks_total",
            Metric::RollbackLength => "timewarp_rollback_length",
            Metric::SilentEvents => "timewarp_silent_events_total",
            Metric::CheckpointsCollected => "timewarp_checkpoints_collected_total",
            Metric::CheckpointPeriod => "timewarp_checkpoint_period",
        }
    }
}

/// Fire-and-forget statistics collaborator. Never fails observably.
pub trait StatsSink: Send + Sync {
    fn post(&self, lp: LpId, metric: Metric, value: f64);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl StatsSink for NullSink {
    fn post(&self, _lp: LpId, _metric: Metric, _value: f64) {}
}

/// Forwards to the `metrics` facade, labelled by LP.
#[derive(Clone, Copy, Debug, Default)]
pub struct MetricsSink;

impl StatsSink for MetricsSink {
    fn post(&self, lp: LpId, metric: Metric, value: f64) {
        let label = lp.to_string();
        match metric {
            Metric::CheckpointTaken | Metric::Rollback | Metric::SilentEvents | Metric::CheckpointsCollected => {
                metrics::counter!(metric.name(), value as u64, "lp" => label);
            }
            Metric::CheckpointCost | Metric::EventCost | Metric::RollbackLength => {
                metrics::histogram!(metric.name(), value, "lp" => label);
            }
            Metric::CheckpointPeriod => {
                metrics::gauge!(metric.name(), value, "lp" => label);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct RunningAverage {
    sum: f64,
    count: u64,
}

impl RunningAverage {
    fn record(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Counters and averages kept per LP; they drive the adaptive checkpoint period.
#[derive(Clone, Debug, Default)]
pub struct LpStats {
    checkpoint_cost: RunningAverage,
    event_cost: RunningAverage,
    rollback_length: RunningAverage,
    pub checkpoints: u64,
    pub checkpoints_collected: u64,
    pub events_executed: u64,
    pub events_replayed: u64,
    pub rollbacks: u64,
    pub resumed_rollbacks: u64,
}

impl LpStats {
    pub fn record_checkpoint(&mut self, cost_ns: f64) {
        self.checkpoints += 1;
        self.checkpoint_cost.record(cost_ns);
    }

    pub fn record_event(&mut self, cost_ns: f64) {
        self.events_executed += 1;
        self.event_cost.record(cost_ns);
    }

    /// `length` is `None` when the destination was INFTY.
    pub fn record_rollback(&mut self, length: Option<u64>) {
        self.rollbacks += 1;
        if let Some(undone) = length {
            self.rollback_length.record(undone as f64);
        }
    }

    pub fn avg_checkpoint_cost(&self) -> Option<f64> {
        self.checkpoint_cost.mean()
    }

    pub fn avg_event_cost(&self) -> Option<f64> {
        self.event_cost.mean()
    }

    /// Zero until the first rollback.
    pub fn avg_rollback_length(&self) -> f64 {
        self.rollback_length.mean().unwrap_or(0.0)
    }
}
