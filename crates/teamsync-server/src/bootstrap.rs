//! Startup provisioning of static service accounts.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};
use teamsync_core::authz::authorizations_for;
use teamsync_core::{
    AuditAction, AuditTarget, Authorization, ComponentName, CorrelationId, Principal,
    RoleAssignment, RoleName,
};
use teamsync_reconcile::AuditLogger;
use teamsync_storage::{DynStore, StorageError};
use tracing::{debug, info};

use crate::config::StaticServiceAccount;

/// Hex SHA-256 of an API key, as stored.
pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

/// What provisioning changed for one account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionedAccount {
    pub name: String,
    pub created: bool,
    pub key_rotated: bool,
    pub granted: Vec<RoleName>,
    pub revoked: Vec<RoleName>,
}

impl ProvisionedAccount {
    pub fn changed(&self) -> bool {
        self.created || self.key_rotated || !self.granted.is_empty() || !self.revoked.is_empty()
    }

    fn describe(&self) -> String {
        let mut parts = Vec::new();
        if self.created {
            parts.push("created".to_string());
        }
        if self.key_rotated {
            parts.push("api key rotated".to_string());
        }
        if !self.granted.is_empty() {
            parts.push(format!("granted {}", join(&self.granted)));
        }
        if !self.revoked.is_empty() {
            parts.push(format!("revoked {}", join(&self.revoked)));
        }
        format!("Service account {}: {}", self.name, parts.join(", "))
    }
}

fn join(roles: &[RoleName]) -> String {
    roles
        .iter()
        .map(RoleName::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Upserts each static service account and makes its global roles match
/// the configured list. Accounts missing from the list are left alone.
pub async fn provision_service_accounts(
    store: &DynStore,
    accounts: &[StaticServiceAccount],
    correlation_id: CorrelationId,
) -> Result<Vec<ProvisionedAccount>, StorageError> {
    if accounts.is_empty() {
        return Ok(Vec::new());
    }

    let accounts = accounts.to_vec();
    let provisioned = store
        .transaction(move |tx| {
            Box::pin(async move {
                let mut provisioned = Vec::with_capacity(accounts.len());
                for account in &accounts {
                    let hash = hash_api_key(&account.api_key);
                    let existing = tx.get_service_account(&account.name).await?;
                    let saved = tx.upsert_service_account(&account.name, &hash).await?;
                    let principal = Principal::ServiceAccount(saved.id);

                    let current: BTreeSet<RoleName> = tx
                        .list_roles_for_principal(&principal)
                        .await?
                        .into_iter()
                        .filter(RoleAssignment::is_global)
                        .map(|a| a.role)
                        .collect();
                    let desired: BTreeSet<RoleName> = account.roles.iter().copied().collect();

                    let mut result = ProvisionedAccount {
                        name: account.name.clone(),
                        created: existing.is_none(),
                        key_rotated: existing.is_some_and(|sa| sa.api_key_hash != hash),
                        ..Default::default()
                    };
                    for role in desired.difference(&current) {
                        tx.assign_role(&RoleAssignment::global(principal, *role))
                            .await?;
                        result.granted.push(*role);
                    }
                    for role in current.difference(&desired) {
                        tx.revoke_role(&RoleAssignment::global(principal, *role))
                            .await?;
                        result.revoked.push(*role);
                    }
                    provisioned.push(result);
                }
                Ok::<_, StorageError>(provisioned)
            })
        })
        .await?;

    let audit = AuditLogger::new(store.clone(), ComponentName::BOOTSTRAP);
    for account in provisioned.iter().filter(|a| a.changed()) {
        audit
            .log(
                vec![AuditTarget::service_account(&account.name)],
                AuditAction::SERVICE_ACCOUNT_PROVISION,
                correlation_id,
                account.describe(),
            )
            .await;
        info!(
            correlation_id = %correlation_id,
            service_account = %account.name,
            created = account.created,
            granted = account.granted.len(),
            revoked = account.revoked.len(),
            "Service account provisioned"
        );
    }
    Ok(provisioned)
}

/// Authorizations an account's roles grant, for logging.
pub fn effective_authorizations(account: &StaticServiceAccount) -> BTreeSet<Authorization> {
    account
        .roles
        .iter()
        .flat_map(|role| authorizations_for(*role).iter().copied())
        .collect()
}

pub fn log_service_accounts(accounts: &[StaticServiceAccount]) {
    for account in accounts {
        let authorizations = effective_authorizations(account);
        debug!(
            service_account = %account.name,
            roles = %join(&account.roles),
            authorizations = authorizations.len(),
            "Static service account configured"
        );
    }
}
