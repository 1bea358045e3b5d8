//! Prometheus metrics recorder.
//!
//! The reconcile and user-sync crates emit through the `metrics` facade;
//! this module installs the recorder they report to and renders it for the
//! `/metrics` endpoint.

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

use teamsync_reconcile::metrics::names as reconcile;
use teamsync_usersync::metrics::names as usersync;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    // Pull-based: /metrics is served by the ops endpoint.
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }
            describe_metrics();
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

fn describe_metrics() {
    describe_counter!(
        reconcile::RECONCILER_STARTED_TOTAL,
        "Reconciler invocations started"
    );
    describe_counter!(
        reconcile::RECONCILER_SUCCEEDED_TOTAL,
        "Reconciler invocations that succeeded"
    );
    describe_counter!(
        reconcile::RECONCILER_FAILED_TOTAL,
        "Reconciler invocations that failed"
    );
    describe_histogram!(
        reconcile::RECONCILER_DURATION_SECONDS,
        Unit::Seconds,
        "Reconciler invocation duration"
    );
    describe_gauge!(
        reconcile::PENDING_TEAM_SYNCS,
        "Teams waiting for a sync worker"
    );
    describe_counter!(usersync::USERSYNC_RUNS_TOTAL, "User sync runs by status");
}
