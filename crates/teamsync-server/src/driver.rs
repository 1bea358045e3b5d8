//! Periodic driver: full team sweeps and user-sync triggers.
//!
//! Both loops fire immediately on start and then at their interval, until
//! the root context is cancelled.

use std::time::Duration;

use teamsync_core::CorrelationId;
use teamsync_reconcile::SyncScheduler;
use teamsync_usersync::UserSyncTrigger;
use tokio::time::{Instant, MissedTickBehavior, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Delay before retrying a sweep whose team listing failed.
pub const ENUMERATE_RETRY: Duration = Duration::from_secs(1);

/// Schedules every team each `interval`.
pub async fn run_team_sweeps(ctx: CancellationToken, scheduler: SyncScheduler, interval: Duration) {
    info!(interval = ?interval, "Full team sync driver started");
    let mut next = Instant::now();
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = sleep_until(next) => {}
        }

        let correlation_id = CorrelationId::new();
        match scheduler.schedule_all(correlation_id).await {
            Ok(_) => next = Instant::now() + interval,
            Err(e) => {
                error!(
                    correlation_id = %correlation_id,
                    error = %e,
                    "Failed to list teams for full sync, retrying"
                );
                next = Instant::now() + ENUMERATE_RETRY;
            }
        }
    }
    info!("Full team sync driver stopped");
}

/// Triggers a user sync each `interval`.
pub async fn run_user_sync_triggers(
    ctx: CancellationToken,
    trigger: UserSyncTrigger,
    interval: Duration,
) {
    info!(interval = ?interval, "User sync driver started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ctx.cancelled() => break,
            _ = ticker.tick() => {
                if !trigger.trigger(CorrelationId::new()) {
                    debug!("User sync trigger dropped");
                }
            }
        }
    }
    info!("User sync driver stopped");
}
