//! User-sync metrics.

use metrics::counter;

pub mod names {
    pub const USERSYNC_RUNS_TOTAL: &str = "teamsync_usersync_runs_total";
}

pub(crate) fn record_run(succeeded: bool) {
    let status = if succeeded { "success" } else { "failure" };
    counter!(names::USERSYNC_RUNS_TOTAL, "status" => status).increment(1);
}
