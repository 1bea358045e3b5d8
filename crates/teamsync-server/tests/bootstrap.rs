//! Static service account provisioning against the in-memory store.

use std::sync::Arc;

use teamsync_core::authz::authorize;
use teamsync_core::{
    AuditAction, AuditTarget, Authorization, CorrelationId, Principal, RoleAssignment, RoleName,
    ServiceAccount,
};
use teamsync_db_memory::MemoryStore;
use teamsync_server::StaticServiceAccount;
use teamsync_server::bootstrap::{hash_api_key, provision_service_accounts};
use teamsync_storage::{DynStore, StorageError};

// =============================================================================
// Test Infrastructure
// =============================================================================

fn store() -> DynStore {
    Arc::new(MemoryStore::new())
}

fn account(name: &str, api_key: &str, roles: &[RoleName]) -> StaticServiceAccount {
    StaticServiceAccount {
        name: name.to_string(),
        api_key: api_key.to_string(),
        roles: roles.to_vec(),
    }
}

async fn load(store: &DynStore, name: &str) -> (ServiceAccount, Vec<RoleAssignment>) {
    let name = name.to_string();
    store
        .transaction(move |tx| {
            Box::pin(async move {
                let sa = tx
                    .get_service_account(&name)
                    .await?
                    .expect("service account exists");
                let roles = tx
                    .list_roles_for_principal(&Principal::ServiceAccount(sa.id))
                    .await?;
                Ok::<_, StorageError>((sa, roles))
            })
        })
        .await
        .unwrap()
}

async fn provision_audits(store: &DynStore, name: &str) -> usize {
    store
        .audit_by_target(&AuditTarget::service_account(name), 100, 0)
        .await
        .unwrap()
        .items
        .iter()
        .filter(|r| r.action == AuditAction::SERVICE_ACCOUNT_PROVISION)
        .count()
}

// =============================================================================
// Provisioning
// =============================================================================

#[tokio::test]
async fn test_provision_creates_account_with_roles() {
    let store = store();
    let result = provision_service_accounts(
        &store,
        &[account("ci", "s3cret", &[RoleName::TeamCreator, RoleName::TeamViewer])],
        CorrelationId::new(),
    )
    .await
    .unwrap();

    assert_eq!(result.len(), 1);
    assert!(result[0].created);
    assert_eq!(result[0].granted.len(), 2);

    let (sa, roles) = load(&store, "ci").await;
    assert_eq!(sa.api_key_hash, hash_api_key("s3cret"));
    assert_eq!(roles.len(), 2);
    assert!(roles.iter().all(RoleAssignment::is_global));
    assert_eq!(provision_audits(&store, "ci").await, 1);
}

#[tokio::test]
async fn test_provision_is_idempotent() {
    let store = store();
    let accounts = [account("ci", "s3cret", &[RoleName::TeamViewer])];
    provision_service_accounts(&store, &accounts, CorrelationId::new())
        .await
        .unwrap();

    let second = provision_service_accounts(&store, &accounts, CorrelationId::new())
        .await
        .unwrap();
    assert!(!second[0].changed());
    assert_eq!(provision_audits(&store, "ci").await, 1);
}

#[tokio::test]
async fn test_provision_rotates_key_and_revokes_unlisted_roles() {
    let store = store();
    provision_service_accounts(
        &store,
        &[account("ci", "old", &[RoleName::Admin, RoleName::TeamViewer])],
        CorrelationId::new(),
    )
    .await
    .unwrap();

    let result = provision_service_accounts(
        &store,
        &[account("ci", "new", &[RoleName::TeamViewer])],
        CorrelationId::new(),
    )
    .await
    .unwrap();
    assert!(!result[0].created);
    assert!(result[0].key_rotated);
    assert_eq!(result[0].revoked, vec![RoleName::Admin]);
    assert!(result[0].granted.is_empty());

    let (sa, roles) = load(&store, "ci").await;
    assert_eq!(sa.api_key_hash, hash_api_key("new"));
    assert_eq!(roles.len(), 1);
    assert_eq!(roles[0].role, RoleName::TeamViewer);
    assert_eq!(provision_audits(&store, "ci").await, 2);
}

#[tokio::test]
async fn test_accounts_missing_from_config_are_kept() {
    let store = store();
    provision_service_accounts(
        &store,
        &[account("legacy", "k", &[RoleName::TeamViewer])],
        CorrelationId::new(),
    )
    .await
    .unwrap();
    provision_service_accounts(
        &store,
        &[account("ci", "k", &[RoleName::TeamViewer])],
        CorrelationId::new(),
    )
    .await
    .unwrap();

    let (_, roles) = load(&store, "legacy").await;
    assert_eq!(roles.len(), 1);
}

#[tokio::test]
async fn test_provisioned_roles_authorize() {
    let store = store();
    provision_service_accounts(
        &store,
        &[account("deployer", "k", &[RoleName::TeamViewer])],
        CorrelationId::new(),
    )
    .await
    .unwrap();

    let (_, roles) = load(&store, "deployer").await;
    assert!(authorize(&roles, Authorization::TeamsRead, None).is_ok());
    assert!(authorize(&roles, Authorization::ReconcilersEnable, None).is_err());
}

#[tokio::test]
async fn test_empty_account_list_touches_nothing() {
    let store = store();
    let result = provision_service_accounts(&store, &[], CorrelationId::new())
        .await
        .unwrap();
    assert!(result.is_empty());
}
