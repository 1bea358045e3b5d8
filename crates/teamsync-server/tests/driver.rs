//! Periodic driver tests. The scheduler is never run here, so scheduled
//! teams stay pending and can be counted.

use std::sync::Arc;
use std::time::Duration;

use teamsync_core::{NewTeam, Slug};
use teamsync_db_memory::MemoryStore;
use teamsync_reconcile::{ReconcilerRegistry, SchedulerConfig, SyncScheduler};
use teamsync_server::driver::{run_team_sweeps, run_user_sync_triggers};
use teamsync_storage::{DynStore, StorageError};
use teamsync_usersync::UserSyncTrigger;
use tokio_util::sync::CancellationToken;

async fn store_with_teams(slugs: &[&str]) -> DynStore {
    let store: DynStore = Arc::new(MemoryStore::new());
    let teams: Vec<NewTeam> = slugs
        .iter()
        .map(|s| NewTeam {
            slug: Slug::parse(s).unwrap(),
            purpose: format!("{s} purpose"),
            slack_channel: None,
        })
        .collect();
    store
        .transaction(move |tx| {
            Box::pin(async move {
                for team in &teams {
                    tx.create_team(team).await?;
                }
                Ok::<_, StorageError>(())
            })
        })
        .await
        .unwrap();
    store
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_first_sweep_is_immediate() {
    let store = store_with_teams(&["alpha", "beta"]).await;
    let scheduler = SyncScheduler::new(
        store,
        Arc::new(ReconcilerRegistry::new()),
        SchedulerConfig::default(),
    );
    let ctx = CancellationToken::new();
    let driver = tokio::spawn(run_team_sweeps(
        ctx.clone(),
        scheduler.clone(),
        Duration::from_secs(3600),
    ));

    wait_for(|| scheduler.pending_count() == 2).await;

    ctx.cancel();
    driver.await.unwrap();
}

#[tokio::test]
async fn test_repeated_sweeps_coalesce() {
    let store = store_with_teams(&["alpha", "beta", "gamma"]).await;
    let scheduler = SyncScheduler::new(
        store,
        Arc::new(ReconcilerRegistry::new()),
        SchedulerConfig::default(),
    );
    let ctx = CancellationToken::new();
    let driver = tokio::spawn(run_team_sweeps(
        ctx.clone(),
        scheduler.clone(),
        Duration::from_millis(20),
    ));

    wait_for(|| scheduler.pending_count() == 3).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(scheduler.pending_count(), 3);

    ctx.cancel();
    driver.await.unwrap();
}

#[tokio::test]
async fn test_sweep_driver_stops_on_cancel() {
    let store = store_with_teams(&[]).await;
    let scheduler = SyncScheduler::new(
        store,
        Arc::new(ReconcilerRegistry::new()),
        SchedulerConfig::default(),
    );
    let ctx = CancellationToken::new();
    ctx.cancel();

    tokio::time::timeout(
        Duration::from_secs(1),
        run_team_sweeps(ctx, scheduler, Duration::from_secs(3600)),
    )
    .await
    .expect("driver exits once cancelled");
}

#[tokio::test]
async fn test_user_sync_trigger_fires_immediately() {
    let (trigger, mut triggers) = UserSyncTrigger::channel();
    let ctx = CancellationToken::new();
    let driver = tokio::spawn(run_user_sync_triggers(
        ctx.clone(),
        trigger,
        Duration::from_secs(3600),
    ));

    let received = tokio::time::timeout(Duration::from_secs(5), triggers.recv())
        .await
        .expect("first trigger is immediate");
    assert!(received.is_some());

    ctx.cancel();
    driver.await.unwrap();
}

#[tokio::test]
async fn test_user_sync_triggers_collapse_while_pending() {
    let (trigger, mut triggers) = UserSyncTrigger::channel();
    let ctx = CancellationToken::new();
    let driver = tokio::spawn(run_user_sync_triggers(
        ctx.clone(),
        trigger,
        Duration::from_millis(10),
    ));

    // Several ticks pass without a consumer; only one trigger is buffered.
    tokio::time::sleep(Duration::from_millis(100)).await;
    ctx.cancel();
    driver.await.unwrap();

    assert!(triggers.try_recv().is_ok());
    assert!(triggers.try_recv().is_err());
}
