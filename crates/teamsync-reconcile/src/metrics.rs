//! Reconcile metrics.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use teamsync_core::ReconcilerName;

/// Metric names as constants for consistency.
pub mod names {
    pub const RECONCILER_STARTED_TOTAL: &str = "teamsync_reconciler_started_total";
    pub const RECONCILER_SUCCEEDED_TOTAL: &str = "teamsync_reconciler_succeeded_total";
    pub const RECONCILER_FAILED_TOTAL: &str = "teamsync_reconciler_failed_total";
    pub const RECONCILER_DURATION_SECONDS: &str = "teamsync_reconciler_duration_seconds";
    pub const PENDING_TEAM_SYNCS: &str = "teamsync_pending_team_syncs";
}

pub(crate) fn record_started(reconciler: &ReconcilerName) {
    counter!(names::RECONCILER_STARTED_TOTAL, "reconciler" => reconciler.to_string()).increment(1);
}

pub(crate) fn record_finished(reconciler: &ReconcilerName, succeeded: bool, duration: Duration) {
    let name = if succeeded {
        names::RECONCILER_SUCCEEDED_TOTAL
    } else {
        names::RECONCILER_FAILED_TOTAL
    };
    counter!(name, "reconciler" => reconciler.to_string()).increment(1);
    histogram!(names::RECONCILER_DURATION_SECONDS, "reconciler" => reconciler.to_string())
        .record(duration.as_secs_f64());
}

pub(crate) fn record_pending(count: usize) {
    gauge!(names::PENDING_TEAM_SYNCS).set(count as f64);
}
