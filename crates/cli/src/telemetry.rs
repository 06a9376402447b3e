// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use timewarp_kernel::stats::Metric;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize telemetry (logs, and metrics when asked for)
pub fn init_telemetry(with_metrics: bool) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "timewarp_kernel=info,timewarp_cli=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    if !with_metrics {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    if PROM_HANDLE.set(handle).is_err() {
        tracing::warn!("Prometheus handle already set. Telemetry re-initialized?");
    }

    metrics::describe_counter!(Metric::CheckpointTaken.name(), "Checkpoints taken");
    metrics::describe_histogram!(Metric::CheckpointCost.name(), "Nanoseconds spent capturing one checkpoint");
    metrics::describe_histogram!(Metric::EventCost.name(), "Nanoseconds spent executing one event forward");
    metrics::describe_counter!(Metric::Rollback.name(), "Completed rollbacks");
    metrics::describe_histogram!(Metric::RollbackLength.name(), "Events undone by one rollback");
    metrics::describe_counter!(Metric::SilentEvents.name(), "Events re-executed silently");
    metrics::describe_counter!(Metric::CheckpointsCollected.name(), "Checkpoints reclaimed by fossil collection");
    metrics::describe_gauge!(Metric::CheckpointPeriod.name(), "Current adaptive checkpoint period");

    metrics::gauge!("timewarp_up", 1.0);
    Ok(())
}

/// Get the Prometheus handle to render metrics
pub fn get_metrics() -> String {
    if let Some(handle) = PROM_HANDLE.get() {
        handle.render()
    } else {
        "# metrics not initialized".to_string()
    }
}
