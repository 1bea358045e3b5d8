//! Audit logger bound to a component.
//!
//! Each call persists one [`AuditRecord`] in its own store transaction.
//! Persistence is best-effort: a failure is reported through `tracing` and
//! never reaches the caller.
//!
//! Never call [`AuditLogger::log`] while holding an open store transaction;
//! backends that serialize transactions would wait on themselves.

use teamsync_core::{AuditAction, AuditRecord, AuditTarget, ComponentName, CorrelationId};
use teamsync_storage::DynStore;
use tracing::error;

/// Writes audit records attributed to one component.
#[derive(Clone)]
pub struct AuditLogger {
    store: DynStore,
    component: ComponentName,
}

impl AuditLogger {
    pub fn new(store: DynStore, component: ComponentName) -> Self {
        Self { store, component }
    }

    pub fn component(&self) -> &ComponentName {
        &self.component
    }

    /// Appends an audit record.
    pub async fn log(
        &self,
        targets: Vec<AuditTarget>,
        action: AuditAction,
        correlation_id: CorrelationId,
        message: impl Into<String>,
    ) {
        let record = AuditRecord::new(
            self.component.clone(),
            action,
            correlation_id,
            targets,
            message,
        );
        self.append(record).await;
    }

    /// Appends an audit record attributed to an acting principal.
    pub async fn log_as(
        &self,
        actor: impl Into<String>,
        targets: Vec<AuditTarget>,
        action: AuditAction,
        correlation_id: CorrelationId,
        message: impl Into<String>,
    ) {
        let mut record = AuditRecord::new(
            self.component.clone(),
            action,
            correlation_id,
            targets,
            message,
        );
        record.actor = Some(actor.into());
        self.append(record).await;
    }

    async fn append(&self, record: AuditRecord) {
        if let Err(e) = self.store.append_audit(&record).await {
            error!(
                error = %e,
                component = %record.component,
                action = %record.action,
                correlation_id = %record.correlation_id,
                message = %record.message,
                "Failed to persist audit record"
            );
        }
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("component", &self.component)
            .field("backend", &self.store.backend_name())
            .finish()
    }
}
