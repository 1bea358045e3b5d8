//! Insertion-ordered registry of reconciler factories and their instances.
//!
//! The registry is process-local. What survives restarts is the descriptor
//! of every registered reconciler in the store: its run order, enabled flag
//! and config. A team reconcile invokes every enabled reconciler in
//! registration order; toggling the flag takes effect on the next team
//! reconcile.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value;
use teamsync_core::{
    AuditAction, AuditTarget, ComponentName, CorrelationId, ReconcilerDescriptor, ReconcilerName,
    ReconcilerRegistration,
};
use teamsync_storage::{DynStore, StorageError};
use tracing::{debug, info};

use crate::audit::AuditLogger;
use crate::error::ReconcileError;
use crate::reconciler::{DynReconciler, FactoryContext, ReconcilerFactory};

/// Registry of reconcilers, in the order they run.
pub struct ReconcilerRegistry {
    factories: Vec<Arc<dyn ReconcilerFactory>>,
    instances: RwLock<BTreeMap<ReconcilerName, DynReconciler>>,
    hints: BTreeMap<String, String>,
}

impl ReconcilerRegistry {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
            instances: RwLock::new(BTreeMap::new()),
            hints: BTreeMap::new(),
        }
    }

    /// Adds an environment hint passed to every factory and reconcile.
    pub fn with_hint(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.hints.insert(key.into(), value.into());
        self
    }

    /// Appends a factory. Its position is its run order.
    pub fn register(&mut self, factory: Arc<dyn ReconcilerFactory>) -> Result<(), ReconcileError> {
        let name = factory.name();
        if self.factories.iter().any(|f| f.name() == name) {
            return Err(ReconcileError::config(format!(
                "reconciler {name} is registered twice"
            )));
        }
        self.factories.push(factory);
        Ok(())
    }

    /// Registered names in run order.
    pub fn names(&self) -> Vec<ReconcilerName> {
        self.factories.iter().map(|f| f.name()).collect()
    }

    pub fn hints(&self) -> &BTreeMap<String, String> {
        &self.hints
    }

    pub fn contains(&self, name: &ReconcilerName) -> bool {
        self.factories.iter().any(|f| f.name() == *name)
    }

    /// Registers every descriptor with the store and builds the instances.
    ///
    /// Re-registration keeps the stored enabled flag and config.
    pub async fn initialize(&self, store: &DynStore) -> Result<(), ReconcileError> {
        let registrations: Vec<ReconcilerRegistration> = self
            .factories
            .iter()
            .enumerate()
            .map(|(index, factory)| ReconcilerRegistration {
                name: factory.name(),
                display_name: factory.display_name(),
                description: factory.description(),
                run_order: i32::try_from(index).unwrap_or(i32::MAX),
            })
            .collect();

        let descriptors = store
            .transaction(move |tx| {
                Box::pin(async move {
                    let mut descriptors = Vec::with_capacity(registrations.len());
                    for registration in &registrations {
                        descriptors.push(tx.upsert_reconciler(registration).await?);
                    }
                    Ok::<_, StorageError>(descriptors)
                })
            })
            .await?;

        let mut built = BTreeMap::new();
        for (factory, descriptor) in self.factories.iter().zip(descriptors) {
            let instance = factory.build(&self.factory_context(store, descriptor.config.clone()))?;
            debug!(
                reconciler = %descriptor.name,
                enabled = descriptor.enabled,
                run_order = descriptor.run_order,
                "Reconciler initialized"
            );
            built.insert(descriptor.name, instance);
        }

        *self.instances.write().unwrap_or_else(PoisonError::into_inner) = built;
        info!(count = self.factories.len(), "Reconcilers registered");
        Ok(())
    }

    fn factory_context(&self, store: &DynStore, config: Value) -> FactoryContext {
        FactoryContext {
            store: store.clone(),
            config,
            hints: self.hints.clone(),
        }
    }

    fn instance(&self, name: &ReconcilerName) -> Option<DynReconciler> {
        self.instances
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Enabled reconcilers in run order.
    pub async fn enabled(&self, store: &DynStore) -> Result<Vec<DynReconciler>, ReconcileError> {
        let enabled: HashSet<ReconcilerName> = store
            .list_reconcilers()
            .await?
            .into_iter()
            .filter(|descriptor| descriptor.enabled)
            .map(|descriptor| descriptor.name)
            .collect();

        Ok(self
            .factories
            .iter()
            .map(|factory| factory.name())
            .filter(|name| enabled.contains(name))
            .filter_map(|name| self.instance(&name))
            .collect())
    }

    fn require_known(&self, name: &ReconcilerName) -> Result<(), ReconcileError> {
        if self.contains(name) {
            Ok(())
        } else {
            Err(ReconcileError::unknown_reconciler(name.as_str()))
        }
    }

    /// Enables `whitelist` and completes the first run, atomically.
    ///
    /// Returns `false` without touching anything if the first run has
    /// already completed. Unknown names are rejected before anything is
    /// enabled.
    pub async fn enable_first_run(
        &self,
        store: &DynStore,
        whitelist: &[ReconcilerName],
        correlation_id: CorrelationId,
    ) -> Result<bool, ReconcileError> {
        for name in whitelist {
            self.require_known(name)?;
        }

        let names = whitelist.to_vec();
        let enabled = store
            .transaction(move |tx| {
                Box::pin(async move {
                    if !tx.first_run().await? {
                        return Ok::<_, StorageError>(None);
                    }
                    for name in &names {
                        tx.set_reconciler_enabled(name, true).await?;
                    }
                    tx.mark_first_run_complete().await?;
                    Ok(Some(names))
                })
            })
            .await?;

        let Some(enabled) = enabled else {
            debug!("First run already completed");
            return Ok(false);
        };

        let audit = AuditLogger::new(store.clone(), ComponentName::BOOTSTRAP);
        for name in &enabled {
            audit
                .log(
                    vec![AuditTarget::reconciler(name)],
                    AuditAction::RECONCILER_ENABLE,
                    correlation_id,
                    format!("Enabled reconciler {name} on first run"),
                )
                .await;
        }
        info!(enabled = ?enabled, "First run completed");
        Ok(true)
    }

    /// Durably enables or disables a reconciler.
    pub async fn set_enabled(
        &self,
        store: &DynStore,
        name: &ReconcilerName,
        enabled: bool,
        correlation_id: CorrelationId,
    ) -> Result<ReconcilerDescriptor, ReconcileError> {
        self.require_known(name)?;

        let target = name.clone();
        let descriptor = store
            .transaction(move |tx| {
                Box::pin(async move { tx.set_reconciler_enabled(&target, enabled).await })
            })
            .await?;

        let (action, verb) = if enabled {
            (AuditAction::RECONCILER_ENABLE, "Enabled")
        } else {
            (AuditAction::RECONCILER_DISABLE, "Disabled")
        };
        AuditLogger::new(store.clone(), ComponentName::from(name))
            .log(
                vec![AuditTarget::reconciler(name)],
                action,
                correlation_id,
                format!("{verb} reconciler {name}"),
            )
            .await;
        info!(reconciler = %name, enabled, "Reconciler toggled");
        Ok(descriptor)
    }

    /// Stores new config for a reconciler and rebuilds its instance.
    pub async fn configure(
        &self,
        store: &DynStore,
        name: &ReconcilerName,
        config: Value,
        correlation_id: CorrelationId,
    ) -> Result<ReconcilerDescriptor, ReconcileError> {
        let factory = self
            .factories
            .iter()
            .find(|f| f.name() == *name)
            .ok_or_else(|| ReconcileError::unknown_reconciler(name.as_str()))?;

        // Build first so a rejected config is never persisted.
        let instance = factory.build(&self.factory_context(store, config.clone()))?;

        let target = name.clone();
        let descriptor = store
            .transaction(move |tx| {
                Box::pin(async move { tx.set_reconciler_config(&target, &config).await })
            })
            .await?;

        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), instance);

        AuditLogger::new(store.clone(), ComponentName::from(name))
            .log(
                vec![AuditTarget::reconciler(name)],
                AuditAction::RECONCILER_CONFIGURE,
                correlation_id,
                format!("Configured reconciler {name}"),
            )
            .await;
        Ok(descriptor)
    }
}

impl Default for ReconcilerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReconcilerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcilerRegistry")
            .field("reconcilers", &self.names())
            .finish()
    }
}
