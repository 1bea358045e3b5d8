//! # teamsync-reconcile
//!
//! The reconciliation machine: the [`Reconciler`] contract external
//! integrations implement, the insertion-ordered [`ReconcilerRegistry`], the
//! best-effort [`AuditLogger`] and the [`SyncScheduler`] that runs every
//! enabled reconciler for a team on a bounded worker pool.
//!
//! ## Example
//!
//! ```ignore
//! let mut registry = ReconcilerRegistry::new();
//! registry.register(Arc::new(WebhookReconcilerFactory::default()))?;
//! registry.initialize(&store).await?;
//!
//! let scheduler = SyncScheduler::new(store, Arc::new(registry), SchedulerConfig::default());
//! scheduler.schedule(slug, CorrelationId::new());
//! scheduler.run(ctx).await;
//! ```

mod audit;
mod error;
pub mod metrics;
mod reconciler;
mod registry;
mod scheduler;

pub use audit::AuditLogger;
pub use error::ReconcileError;
pub use reconciler::{
    DynReconciler, FactoryContext, ReconcileInput, Reconciler, ReconcilerFactory,
};
pub use registry::ReconcilerRegistry;
pub use scheduler::{SchedulerConfig, SyncScheduler};

/// Hint key carrying the tenant domain.
pub const HINT_TENANT_DOMAIN: &str = "tenant_domain";
