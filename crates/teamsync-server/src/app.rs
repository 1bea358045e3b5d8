//! Wires the store, the reconcilers, the user synchronizer, the periodic
//! driver and the ops endpoint into one running process.

use std::net::SocketAddr;
use std::sync::Arc;

use teamsync_core::CorrelationId;
use teamsync_db_memory::MemoryStore;
use teamsync_db_postgres::{PostgresConfig, create_store};
use teamsync_reconcile::{
    HINT_TENANT_DOMAIN, ReconcileError, ReconcilerRegistry, SchedulerConfig, SyncScheduler,
};
use teamsync_storage::{DynStore, StorageError};
use teamsync_usersync::{
    DirectoryError, RunHistory, StaticDirectory, UserSyncConfig, UserSyncTrigger,
    UserSynchronizer,
};
use teamsync_webhook::{WebhookConfig, WebhookError, WebhookReconcilerFactory};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::bootstrap;
use crate::config::{AppConfig, ConfigError};
use crate::driver;
use crate::http::{self, OpsState};

/// Hint key carrying the frontend base URL.
pub const HINT_FRONTEND_URL: &str = "frontend_url";

/// Fatal runtime errors. The process exits with code 3.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("reconciler error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("webhook error: {0}")]
    Webhook(#[from] WebhookError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Opens the store named by `DATABASE_URL`.
pub async fn connect_store(config: &AppConfig) -> Result<DynStore, StorageError> {
    if config.uses_memory_store() {
        info!("Using in-memory store");
        return Ok(Arc::new(MemoryStore::new()));
    }
    create_store(
        PostgresConfig::new(config.database_url.clone()).with_pool_size(config.database_pool_size),
    )
    .await
}

/// Registers the reconcilers this process runs, in run order.
pub fn build_registry(config: &AppConfig) -> Result<ReconcilerRegistry, AppError> {
    let mut registry =
        ReconcilerRegistry::new().with_hint(HINT_TENANT_DOMAIN, config.tenant_domain.clone());
    if let Some(frontend_url) = &config.frontend_url {
        registry = registry.with_hint(HINT_FRONTEND_URL, frontend_url.clone());
    }

    if let Some(url) = &config.webhook_reconciler_url {
        let factory = WebhookReconcilerFactory::new(WebhookConfig {
            url: Some(url.clone()),
            secret: config.webhook_reconciler_secret.clone(),
            timeout: None,
        })?;
        registry.register(Arc::new(factory))?;
    }
    Ok(registry)
}

/// A started process.
pub struct App {
    store: DynStore,
    scheduler: SyncScheduler,
    history: Arc<RunHistory>,
    user_sync: Option<UserSyncTrigger>,
    local_addr: SocketAddr,
    ctx: CancellationToken,
    tasks: JoinSet<Result<(), AppError>>,
}

impl App {
    /// Bootstraps the store and starts every background task.
    pub async fn start(config: AppConfig, ctx: CancellationToken) -> Result<Self, AppError> {
        let store = connect_store(&config).await?;

        let registry = build_registry(&config)?;
        registry.initialize(&store).await?;

        let correlation_id = CorrelationId::new();
        registry
            .enable_first_run(&store, &config.first_run_reconcilers()?, correlation_id)
            .await?;
        bootstrap::log_service_accounts(&config.static_service_accounts);
        bootstrap::provision_service_accounts(
            &store,
            &config.static_service_accounts,
            correlation_id,
        )
        .await?;

        let scheduler = SyncScheduler::new(
            store.clone(),
            Arc::new(registry),
            SchedulerConfig {
                workers: config.reconciler_workers,
                retry_backoff: config.reconciler_retry_backoff,
                ..SchedulerConfig::default()
            },
        );
        let history = Arc::new(RunHistory::new(config.usersync_runs_to_store));

        let listener = TcpListener::bind(config.listen_address).await?;
        let local_addr = listener.local_addr()?;
        info!(address = %local_addr, "Ops endpoint listening");

        let mut tasks: JoinSet<Result<(), AppError>> = JoinSet::new();

        {
            let scheduler = scheduler.clone();
            let ctx = ctx.clone();
            tasks.spawn(async move {
                scheduler.run(ctx).await;
                Ok(())
            });
        }
        {
            let scheduler = scheduler.clone();
            let ctx = ctx.clone();
            tasks.spawn(async move {
                scheduler.update_metrics(ctx).await;
                Ok(())
            });
        }
        {
            // Stop accepting team syncs as soon as shutdown starts.
            let scheduler = scheduler.clone();
            let ctx = ctx.clone();
            tasks.spawn(async move {
                ctx.cancelled().await;
                scheduler.close();
                Ok(())
            });
        }
        {
            let scheduler = scheduler.clone();
            let ctx = ctx.clone();
            let interval = config.full_team_sync_interval;
            tasks.spawn(async move {
                driver::run_team_sweeps(ctx, scheduler, interval).await;
                Ok(())
            });
        }

        let user_sync = if config.usersync_enabled {
            let path = config
                .usersync_directory_file
                .clone()
                .ok_or_else(|| ConfigError::Invalid("USERSYNC_DIRECTORY_FILE is not set".into()))?;
            let directory = StaticDirectory::from_file(&path)?;
            info!(path = %path.display(), "User directory loaded");

            let synchronizer = UserSynchronizer::new(
                store.clone(),
                Arc::new(directory),
                UserSyncConfig::new(config.tenant_domain.clone())
                    .with_admin_group_prefix(config.usersync_admin_group_prefix.clone())
                    .with_timeout(config.user_sync_timeout),
                history.clone(),
            );
            let (trigger, triggers) = UserSyncTrigger::channel();
            {
                let ctx = ctx.clone();
                tasks.spawn(async move {
                    synchronizer.run(ctx, triggers).await;
                    Ok(())
                });
            }
            {
                let ctx = ctx.clone();
                let trigger = trigger.clone();
                let interval = config.user_sync_interval;
                tasks.spawn(async move {
                    driver::run_user_sync_triggers(ctx, trigger, interval).await;
                    Ok(())
                });
            }
            Some(trigger)
        } else {
            info!("User sync disabled");
            None
        };

        {
            let router = http::router(OpsState {
                store: store.clone(),
                history: history.clone(),
            });
            let ctx = ctx.clone();
            tasks.spawn(async move {
                http::serve(listener, router, ctx).await?;
                Ok(())
            });
        }

        info!(
            storage = store.backend_name(),
            tenant_domain = %config.tenant_domain,
            "teamsync started"
        );

        Ok(Self {
            store,
            scheduler,
            history,
            user_sync,
            local_addr,
            ctx,
            tasks,
        })
    }

    pub fn store(&self) -> &DynStore {
        &self.store
    }

    pub fn scheduler(&self) -> &SyncScheduler {
        &self.scheduler
    }

    pub fn history(&self) -> &Arc<RunHistory> {
        &self.history
    }

    /// Trigger for an out-of-schedule user sync, if user sync is enabled.
    pub fn user_sync(&self) -> Option<&UserSyncTrigger> {
        self.user_sync.as_ref()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits until every task has stopped.
    ///
    /// The first task failure cancels the root context so the rest shut
    /// down too, and is returned once they have.
    pub async fn wait(mut self) -> Result<(), AppError> {
        let mut first_error = None;
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined.map_err(AppError::from).and_then(|result| result) {
                error!(error = %e, "Background task failed, shutting down");
                self.ctx.cancel();
                first_error.get_or_insert(e);
            }
        }
        info!("All tasks stopped");
        first_error.map_or(Ok(()), Err)
    }
}

/// Starts the process and runs it until `ctx` is cancelled.
pub async fn run(config: AppConfig, ctx: CancellationToken) -> Result<(), AppError> {
    App::start(config, ctx).await?.wait().await
}
