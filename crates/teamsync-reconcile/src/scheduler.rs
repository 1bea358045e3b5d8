//! Team sync scheduler and its worker pool.
//!
//! Requests are keyed by team slug. While a request for a slug is pending,
//! further requests for the same slug coalesce into it and get its
//! correlation id back. A worker removes the pending entry when it starts
//! processing the team; a request arriving while the team is in flight is
//! queued again once the current run finishes, so two runs for the same
//! team never overlap.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use teamsync_core::{
    AuditAction, AuditTarget, ComponentName, CorrelationId, Member, ReconcilerError,
    ReconcilerName, Slug, Team,
};
use teamsync_storage::{DynStore, StorageError};
use time::OffsetDateTime;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::audit::AuditLogger;
use crate::error::ReconcileError;
use crate::metrics;
use crate::reconciler::{DynReconciler, ReconcileInput};
use crate::registry::ReconcilerRegistry;

/// Scheduler tuning.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of worker tasks started by [`SyncScheduler::run`].
    pub workers: usize,
    /// Delay before a team with a transient failure is scheduled again.
    pub retry_backoff: Duration,
    /// How many times a team is retried after transient failures.
    pub max_retries: u32,
    /// Interval at which [`SyncScheduler::update_metrics`] publishes gauges.
    pub metrics_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            retry_backoff: Duration::from_secs(5),
            max_retries: 1,
            metrics_interval: Duration::from_secs(10),
        }
    }
}

const MAX_BACKOFF: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    correlation_id: CorrelationId,
    attempt: u32,
}

#[derive(Debug, Default)]
struct Pending {
    entries: HashMap<Slug, PendingEntry>,
    queue: VecDeque<Slug>,
    in_flight: HashSet<Slug>,
}

struct Inner {
    store: DynStore,
    registry: Arc<ReconcilerRegistry>,
    audit: AuditLogger,
    config: SchedulerConfig,
    pending: Mutex<Pending>,
    notify: Notify,
    closed: CancellationToken,
}

/// Accepts team reconcile requests and runs them on a bounded worker pool.
#[derive(Clone)]
pub struct SyncScheduler {
    inner: Arc<Inner>,
}

/// Result of one team run, as seen by the worker.
#[derive(Debug, Default)]
struct TeamOutcome {
    retry: bool,
}

impl SyncScheduler {
    pub fn new(
        store: DynStore,
        registry: Arc<ReconcilerRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let audit = AuditLogger::new(store.clone(), ComponentName::TEAM_SYNC);
        Self {
            inner: Arc::new(Inner {
                store,
                registry,
                audit,
                config,
                pending: Mutex::new(Pending::default()),
                notify: Notify::new(),
                closed: CancellationToken::new(),
            }),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Requests a reconcile of `slug`.
    ///
    /// Returns the correlation id of the pending work for the slug, which is
    /// `correlation_id` unless an earlier request is still waiting.
    pub fn schedule(&self, slug: Slug, correlation_id: CorrelationId) -> CorrelationId {
        self.enqueue(slug, correlation_id, 0)
    }

    fn enqueue(&self, slug: Slug, correlation_id: CorrelationId, attempt: u32) -> CorrelationId {
        if self.inner.closed.is_cancelled() {
            debug!(team = %slug, "Scheduler closed, dropping request");
            return correlation_id;
        }

        let mut pending = self.pending();
        if let Some(existing) = pending.entries.get(&slug) {
            debug!(
                team = %slug,
                correlation_id = %existing.correlation_id,
                "Team already pending, coalescing request"
            );
            return existing.correlation_id;
        }

        pending.entries.insert(
            slug.clone(),
            PendingEntry {
                correlation_id,
                attempt,
            },
        );
        // An in-flight team is queued again when its current run finishes.
        if !pending.in_flight.contains(&slug) {
            pending.queue.push_back(slug);
            drop(pending);
            self.inner.notify.notify_one();
        }
        correlation_id
    }

    /// Schedules every non-deleted team under one correlation id.
    ///
    /// Deleted teams that still have reconciler state are scheduled too, so
    /// a teardown that failed earlier runs again.
    pub async fn schedule_all(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Vec<Slug>, ReconcileError> {
        let mut slugs = self.inner.store.list_team_slugs().await?;
        let removed = self.inner.store.list_removed_team_slugs().await?;
        let teams = slugs.len();
        slugs.extend(removed);

        for slug in &slugs {
            self.schedule(slug.clone(), correlation_id);
        }
        info!(
            teams,
            removed = slugs.len() - teams,
            correlation_id = %correlation_id,
            "Scheduled all teams"
        );
        Ok(slugs)
    }

    /// Number of teams waiting for a worker.
    pub fn pending_count(&self) -> usize {
        self.pending().entries.len()
    }

    /// Stops accepting work. In-flight team runs finish; `run` then returns.
    pub fn close(&self) {
        if !self.inner.closed.is_cancelled() {
            info!("Closing team sync scheduler");
            self.inner.closed.cancel();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Runs the worker pool until `ctx` is cancelled or [`Self::close`] is
    /// called, then waits for every worker to return.
    pub async fn run(&self, ctx: CancellationToken) {
        let workers = self.inner.config.workers.max(1);
        info!(workers, "Team sync workers started");

        let mut set = JoinSet::new();
        for id in 0..workers {
            let scheduler = self.clone();
            let ctx = ctx.clone();
            set.spawn(async move { scheduler.worker(id, ctx).await });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Team sync worker panicked");
            }
        }
        info!("Team sync workers stopped");
    }

    /// Publishes the pending-queue gauge until `ctx` is cancelled.
    pub async fn update_metrics(&self, ctx: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.config.metrics_interval);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = self.inner.closed.cancelled() => return,
                _ = ticker.tick() => metrics::record_pending(self.pending_count()),
            }
        }
    }

    fn take(&self) -> Option<(Slug, PendingEntry)> {
        let mut pending = self.pending();
        let slug = pending.queue.pop_front()?;
        let entry = pending.entries.remove(&slug)?;
        pending.in_flight.insert(slug.clone());
        Some((slug, entry))
    }

    fn finish(&self, slug: &Slug) {
        let mut pending = self.pending();
        pending.in_flight.remove(slug);
        if pending.entries.contains_key(slug) {
            pending.queue.push_back(slug.clone());
            drop(pending);
            self.inner.notify.notify_one();
        }
    }

    async fn worker(&self, id: usize, ctx: CancellationToken) {
        debug!(worker = id, "Team sync worker started");
        loop {
            if ctx.is_cancelled() || self.inner.closed.is_cancelled() {
                break;
            }

            let Some((slug, entry)) = self.take() else {
                tokio::select! {
                    _ = ctx.cancelled() => break,
                    _ = self.inner.closed.cancelled() => break,
                    _ = self.inner.notify.notified() => {}
                }
                continue;
            };

            let outcome = self.reconcile_team(&ctx, &slug, entry).await;
            self.finish(&slug);

            if outcome.retry {
                self.schedule_retry(&ctx, slug, entry);
            }
        }
        debug!(worker = id, "Team sync worker stopped");
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.inner
            .config
            .retry_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_BACKOFF)
    }

    fn schedule_retry(&self, ctx: &CancellationToken, slug: Slug, entry: PendingEntry) {
        if entry.attempt >= self.inner.config.max_retries {
            warn!(
                team = %slug,
                correlation_id = %entry.correlation_id,
                attempts = entry.attempt + 1,
                "Team sync retries exhausted, waiting for next sweep"
            );
            return;
        }

        let delay = self.backoff(entry.attempt);
        info!(
            team = %slug,
            correlation_id = %entry.correlation_id,
            delay_ms = delay.as_millis() as u64,
            "Rescheduling team after transient failure"
        );

        let scheduler = self.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = ctx.cancelled() => {}
                _ = scheduler.inner.closed.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    scheduler.enqueue(slug, entry.correlation_id, entry.attempt + 1);
                }
            }
        });
    }

    async fn load_team(&self, slug: &Slug) -> Result<Option<(Team, Vec<Member>)>, StorageError> {
        let slug = slug.clone();
        self.inner
            .store
            .transaction(move |tx| {
                Box::pin(async move {
                    let Some(team) = tx.get_team(&slug).await? else {
                        return Ok(None);
                    };
                    let members = tx.list_team_members(&slug).await?;
                    Ok::<_, StorageError>(Some((team, members)))
                })
            })
            .await
    }

    async fn reconcile_team(
        &self,
        ctx: &CancellationToken,
        slug: &Slug,
        entry: PendingEntry,
    ) -> TeamOutcome {
        let cid = entry.correlation_id;
        let started = Instant::now();

        let loaded = match self.load_team(slug).await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!(team = %slug, correlation_id = %cid, error = %e, "Failed to load team");
                return TeamOutcome {
                    retry: e.is_transient(),
                };
            }
        };

        let reconcilers = match self.inner.registry.enabled(&self.inner.store).await {
            Ok(reconcilers) => reconcilers,
            Err(e) => {
                error!(team = %slug, correlation_id = %cid, error = %e, "Failed to list enabled reconcilers");
                return TeamOutcome {
                    retry: e.is_transient(),
                };
            }
        };

        let outcome = match loaded {
            Some((team, members)) => {
                let input = ReconcileInput {
                    team,
                    members,
                    correlation_id: cid,
                    hints: self.inner.registry.hints().clone(),
                };
                self.run_reconcilers(ctx, &input, &reconcilers).await
            }
            None => self.run_deletes(ctx, slug, cid, &reconcilers).await,
        };

        debug!(
            team = %slug,
            correlation_id = %cid,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Team sync finished"
        );
        outcome
    }

    async fn run_reconcilers(
        &self,
        ctx: &CancellationToken,
        input: &ReconcileInput,
        reconcilers: &[DynReconciler],
    ) -> TeamOutcome {
        let mut outcome = TeamOutcome::default();
        let slug = input.slug();
        let cid = input.correlation_id;

        for reconciler in reconcilers {
            if ctx.is_cancelled() {
                info!(team = %slug, correlation_id = %cid, "Team sync cancelled");
                break;
            }

            let name = reconciler.name();
            metrics::record_started(name);
            let started = Instant::now();
            let result = reconciler.reconcile(ctx, input).await;
            metrics::record_finished(name, result.is_ok(), started.elapsed());

            match result {
                Ok(()) => {
                    debug!(team = %slug, reconciler = %name, correlation_id = %cid, "Reconcile succeeded");
                    self.clear_error(name, slug).await;
                }
                Err(ReconcileError::Cancelled) => {
                    info!(team = %slug, reconciler = %name, correlation_id = %cid, "Reconcile cancelled");
                    break;
                }
                Err(e) => {
                    outcome.retry |= e.is_transient();
                    self.record_failure(name, slug, cid, &e, "reconcile").await;
                }
            }
        }
        outcome
    }

    async fn run_deletes(
        &self,
        ctx: &CancellationToken,
        slug: &Slug,
        cid: CorrelationId,
        reconcilers: &[DynReconciler],
    ) -> TeamOutcome {
        let mut outcome = TeamOutcome::default();
        let mut failed = 0;
        info!(team = %slug, correlation_id = %cid, "Team is gone, running reconciler deletes");

        for reconciler in reconcilers.iter().rev() {
            if ctx.is_cancelled() {
                info!(team = %slug, correlation_id = %cid, "Team delete cancelled");
                return outcome;
            }

            let name = reconciler.name();
            match reconciler.delete(ctx, slug, cid).await {
                Ok(()) => {
                    if let Err(e) = self.drop_state(name, slug).await {
                        error!(team = %slug, reconciler = %name, error = %e, "Failed to remove reconciler state");
                        outcome.retry |= e.is_transient();
                        failed += 1;
                        continue;
                    }
                    self.inner
                        .audit
                        .log(
                            vec![AuditTarget::team(slug), AuditTarget::reconciler(name)],
                            AuditAction::RECONCILER_DELETE_TEAM,
                            cid,
                            format!("Reconciler {name} removed team {slug}"),
                        )
                        .await;
                }
                Err(ReconcileError::Cancelled) => return outcome,
                Err(e) => {
                    outcome.retry |= e.is_transient();
                    failed += 1;
                    self.record_failure(name, slug, cid, &e, "delete").await;
                }
            }
        }

        // Disabled reconcilers get no delete call; their rows go regardless.
        // Once every enabled delete has succeeded nothing of the team is kept.
        let enabled: HashSet<&ReconcilerName> = reconcilers.iter().map(|r| r.name()).collect();
        let disabled: Vec<ReconcilerName> = self
            .inner
            .registry
            .names()
            .into_iter()
            .filter(|name| !enabled.contains(name))
            .collect();
        match self.drop_leftover_state(slug, disabled, failed == 0).await {
            Ok(0) => {}
            Ok(removed) => {
                debug!(team = %slug, correlation_id = %cid, removed, "Removed leftover reconciler state");
            }
            Err(e) => {
                error!(team = %slug, correlation_id = %cid, error = %e, "Failed to remove leftover reconciler state");
                outcome.retry |= e.is_transient();
            }
        }
        outcome
    }

    async fn drop_state(&self, name: &ReconcilerName, slug: &Slug) -> Result<(), StorageError> {
        let name = name.clone();
        let slug = slug.clone();
        self.inner
            .store
            .transaction(move |tx| {
                Box::pin(async move {
                    tx.delete_reconciler_state(&name, &slug).await?;
                    tx.clear_reconciler_error(&name, &slug).await
                })
            })
            .await
    }

    async fn drop_leftover_state(
        &self,
        slug: &Slug,
        disabled: Vec<ReconcilerName>,
        whole_team: bool,
    ) -> Result<u64, StorageError> {
        let slug = slug.clone();
        self.inner
            .store
            .transaction(move |tx| {
                Box::pin(async move {
                    let mut removed = 0;
                    for name in &disabled {
                        removed += u64::from(tx.delete_reconciler_state(name, &slug).await?);
                        tx.clear_reconciler_error(name, &slug).await?;
                    }
                    if whole_team {
                        removed += tx.delete_team_reconciler_states(&slug).await?;
                    }
                    Ok::<_, StorageError>(removed)
                })
            })
            .await
    }

    async fn clear_error(&self, name: &ReconcilerName, slug: &Slug) {
        let reconciler = name.clone();
        let team = slug.clone();
        let result = self
            .inner
            .store
            .transaction(move |tx| {
                Box::pin(async move { tx.clear_reconciler_error(&reconciler, &team).await })
            })
            .await;
        if let Err(e) = result {
            warn!(team = %slug, reconciler = %name, error = %e, "Failed to clear reconciler error");
        }
    }

    async fn record_failure(
        &self,
        name: &ReconcilerName,
        slug: &Slug,
        cid: CorrelationId,
        err: &ReconcileError,
        operation: &str,
    ) {
        error!(
            team = %slug,
            reconciler = %name,
            correlation_id = %cid,
            transient = err.is_transient(),
            error = %err,
            "Reconciler {operation} failed"
        );

        let record = ReconcilerError {
            reconciler: name.clone(),
            team: slug.clone(),
            correlation_id: cid,
            message: err.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        let result = self
            .inner
            .store
            .transaction(move |tx| {
                Box::pin(async move { tx.record_reconciler_error(&record).await })
            })
            .await;
        if let Err(e) = result {
            warn!(team = %slug, reconciler = %name, error = %e, "Failed to record reconciler error");
        }

        self.inner
            .audit
            .log(
                vec![AuditTarget::team(slug), AuditTarget::reconciler(name)],
                AuditAction::RECONCILER_ERROR,
                cid,
                format!("Reconciler {name} {operation} failed: {err}"),
            )
            .await;
    }
}

impl std::fmt::Debug for SyncScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncScheduler")
            .field("config", &self.inner.config)
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
