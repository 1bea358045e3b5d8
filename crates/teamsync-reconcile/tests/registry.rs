//! Registry integration tests against the in-memory store.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use teamsync_core::{AuditAction, AuditTarget, CorrelationId, ReconcilerName, Slug};
use teamsync_db_memory::MemoryStore;
use teamsync_reconcile::{
    DynReconciler, FactoryContext, ReconcileError, ReconcileInput, Reconciler, ReconcilerFactory,
    ReconcilerRegistry,
};
use teamsync_storage::DynStore;
use tokio_util::sync::CancellationToken;

fn name(s: &str) -> ReconcilerName {
    ReconcilerName::parse(s).unwrap()
}

struct Noop {
    name: ReconcilerName,
}

#[async_trait]
impl Reconciler for Noop {
    fn name(&self) -> &ReconcilerName {
        &self.name
    }

    async fn reconcile(
        &self,
        _ctx: &CancellationToken,
        _input: &ReconcileInput,
    ) -> Result<(), ReconcileError> {
        Ok(())
    }

    async fn delete(
        &self,
        _ctx: &CancellationToken,
        _slug: &Slug,
        _correlation_id: CorrelationId,
    ) -> Result<(), ReconcileError> {
        Ok(())
    }
}

/// Builds [`Noop`] reconcilers; rejects configs with `"valid": false`.
struct NoopFactory {
    name: ReconcilerName,
    builds: AtomicUsize,
}

impl NoopFactory {
    fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: self::name(name),
            builds: AtomicUsize::new(0),
        })
    }
}

impl ReconcilerFactory for NoopFactory {
    fn name(&self) -> ReconcilerName {
        self.name.clone()
    }

    fn display_name(&self) -> String {
        format!("Noop {}", self.name)
    }

    fn description(&self) -> String {
        "Does nothing".into()
    }

    fn build(&self, ctx: &FactoryContext) -> Result<DynReconciler, ReconcileError> {
        if ctx.config.get("valid") == Some(&Value::Bool(false)) {
            return Err(ReconcileError::config("invalid noop config"));
        }
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(Noop {
            name: self.name.clone(),
        }))
    }
}

async fn registry(store: &DynStore, names: &[&str]) -> ReconcilerRegistry {
    let mut registry = ReconcilerRegistry::new().with_hint("tenant_domain", "example.com");
    for n in names {
        registry.register(NoopFactory::new(n)).unwrap();
    }
    registry.initialize(store).await.unwrap();
    registry
}

fn enabled_names(reconcilers: &[DynReconciler]) -> Vec<String> {
    reconcilers.iter().map(|r| r.name().to_string()).collect()
}

#[tokio::test]
async fn test_initialize_registers_descriptors_in_order() {
    let store: DynStore = Arc::new(MemoryStore::new());
    let registry = registry(&store, &["workspace", "deploy", "github"]).await;

    let descriptors = store.list_reconcilers().await.unwrap();
    let names: Vec<&str> = descriptors.iter().map(|d| d.name.as_str()).collect();
    assert_eq!(names, vec!["workspace", "deploy", "github"]);
    assert_eq!(
        descriptors.iter().map(|d| d.run_order).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert!(descriptors.iter().all(|d| !d.enabled));
    assert!(registry.enabled(&store).await.unwrap().is_empty());
    assert_eq!(
        registry.hints().get("tenant_domain").map(String::as_str),
        Some("example.com")
    );
}

#[tokio::test]
async fn test_duplicate_registration_is_rejected() {
    let mut registry = ReconcilerRegistry::new();
    registry.register(NoopFactory::new("workspace")).unwrap();
    let err = registry.register(NoopFactory::new("workspace")).unwrap_err();
    assert!(matches!(err, ReconcileError::Config { .. }));
}

#[tokio::test]
async fn test_first_run_enables_whitelist_once() {
    let store: DynStore = Arc::new(MemoryStore::new());
    let registry = registry(&store, &["workspace", "deploy", "github"]).await;

    let cid = CorrelationId::new();
    let whitelist = [name("deploy"), name("workspace")];
    assert!(
        registry
            .enable_first_run(&store, &whitelist, cid)
            .await
            .unwrap()
    );
    assert!(!store.first_run().await.unwrap());

    // Registry order wins over whitelist order.
    let enabled = registry.enabled(&store).await.unwrap();
    assert_eq!(enabled_names(&enabled), vec!["workspace", "deploy"]);

    let records = store.audit_by_correlation(&cid).await.unwrap();
    assert_eq!(records.len(), 2);
    assert!(
        records
            .iter()
            .all(|r| r.action == AuditAction::RECONCILER_ENABLE)
    );

    // A second bootstrap is a no-op.
    assert!(
        !registry
            .enable_first_run(&store, &[name("github")], CorrelationId::new())
            .await
            .unwrap()
    );
    assert_eq!(registry.enabled(&store).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_first_run_rejects_unknown_names_before_enabling() {
    let store: DynStore = Arc::new(MemoryStore::new());
    let registry = registry(&store, &["workspace"]).await;

    let err = registry
        .enable_first_run(
            &store,
            &[name("workspace"), name("nonexistent")],
            CorrelationId::new(),
        )
        .await
        .unwrap_err();
    assert!(err.is_client_error());
    assert!(store.first_run().await.unwrap());
    assert!(registry.enabled(&store).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_set_enabled_is_durable_and_audited() {
    let store: DynStore = Arc::new(MemoryStore::new());
    let registry = registry(&store, &["workspace", "deploy"]).await;

    let cid = CorrelationId::new();
    registry
        .set_enabled(&store, &name("deploy"), true, cid)
        .await
        .unwrap();
    assert_eq!(
        enabled_names(&registry.enabled(&store).await.unwrap()),
        vec!["deploy"]
    );

    registry
        .set_enabled(&store, &name("deploy"), false, cid)
        .await
        .unwrap();
    assert!(registry.enabled(&store).await.unwrap().is_empty());

    let page = store
        .audit_by_target(&AuditTarget::reconciler(&name("deploy")), 10, 0)
        .await
        .unwrap();
    let actions: Vec<&str> = page.items.iter().map(|r| r.action.as_str()).collect();
    assert_eq!(actions, vec!["reconciler:disable", "reconciler:enable"]);

    // A restarted process re-registers and keeps the flag.
    registry
        .set_enabled(&store, &name("workspace"), true, cid)
        .await
        .unwrap();
    let restarted = self::registry(&store, &["workspace", "deploy"]).await;
    assert_eq!(
        enabled_names(&restarted.enabled(&store).await.unwrap()),
        vec!["workspace"]
    );

    let err = registry
        .set_enabled(&store, &name("unknown"), true, cid)
        .await
        .unwrap_err();
    assert!(matches!(err, ReconcileError::UnknownReconciler { .. }));
}

#[tokio::test]
async fn test_configure_rebuilds_instance() {
    let store: DynStore = Arc::new(MemoryStore::new());
    let factory = NoopFactory::new("workspace");
    let mut registry = ReconcilerRegistry::new();
    registry.register(factory.clone()).unwrap();
    registry.initialize(&store).await.unwrap();
    assert_eq!(factory.builds.load(Ordering::SeqCst), 1);

    let cid = CorrelationId::new();
    let descriptor = registry
        .configure(&store, &name("workspace"), json!({"org": "acme"}), cid)
        .await
        .unwrap();
    assert_eq!(descriptor.config, json!({"org": "acme"}));
    assert_eq!(factory.builds.load(Ordering::SeqCst), 2);

    let err = registry
        .configure(&store, &name("workspace"), json!({"valid": false}), cid)
        .await
        .unwrap_err();
    assert!(err.is_client_error());
    let stored = store.list_reconcilers().await.unwrap();
    assert_eq!(stored[0].config, json!({"org": "acme"}));

    let records = store.audit_by_correlation(&cid).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].action, AuditAction::RECONCILER_CONFIGURE);
}
