//! Reconciler contract and factories.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use teamsync_core::{ComponentName, CorrelationId, Member, ReconcilerName, Slug, Team};
use teamsync_storage::DynStore;
use tokio_util::sync::CancellationToken;

use crate::audit::AuditLogger;
use crate::error::ReconcileError;

/// Everything a reconciler sees about one team.
#[derive(Debug, Clone)]
pub struct ReconcileInput {
    pub team: Team,
    /// Full member list with roles.
    pub members: Vec<Member>,
    pub correlation_id: CorrelationId,
    /// Environment hints such as the tenant domain.
    pub hints: BTreeMap<String, String>,
}

impl ReconcileInput {
    pub fn slug(&self) -> &Slug {
        &self.team.slug
    }

    pub fn hint(&self, key: &str) -> Option<&str> {
        self.hints.get(key).map(String::as_str)
    }
}

/// Converges one external system toward the authoritative team model.
///
/// Implementations load their prior state, diff it against the input, issue
/// idempotent external operations, persist the updated state and audit each
/// externally visible change. A reconcile whose target already matches the
/// input must not write externally or emit audit records.
///
/// Permanent external failures are logged, audited and reported as `Ok`.
/// Transient failures are returned so the scheduler can retry the team.
/// Implementations must not hold a store transaction across external calls
/// or audit writes.
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &ReconcilerName;

    async fn reconcile(
        &self,
        ctx: &CancellationToken,
        input: &ReconcileInput,
    ) -> Result<(), ReconcileError>;

    /// Tears down everything the reconciler created for a removed team.
    ///
    /// The team's state row is only removed after this returns `Ok`.
    async fn delete(
        &self,
        ctx: &CancellationToken,
        slug: &Slug,
        correlation_id: CorrelationId,
    ) -> Result<(), ReconcileError>;
}

/// Shared handle to a reconciler instance.
pub type DynReconciler = Arc<dyn Reconciler>;

/// What a factory gets to build its reconciler.
#[derive(Clone)]
pub struct FactoryContext {
    pub store: DynStore,
    /// Config stored with the reconciler's descriptor.
    pub config: Value,
    pub hints: BTreeMap<String, String>,
}

impl FactoryContext {
    /// Audit logger attributed to the given reconciler.
    pub fn audit_logger(&self, name: &ReconcilerName) -> AuditLogger {
        AuditLogger::new(self.store.clone(), ComponentName::from(name))
    }
}

/// Builds a reconciler and describes it for registration.
pub trait ReconcilerFactory: Send + Sync {
    fn name(&self) -> ReconcilerName;

    fn display_name(&self) -> String;

    fn description(&self) -> String;

    fn build(&self, ctx: &FactoryContext) -> Result<DynReconciler, ReconcileError>;
}
