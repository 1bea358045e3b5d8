//! Imports the upstream directory into the store.
//!
//! One sync reads every active directory user of the tenant domain and then,
//! in a single store transaction, creates, updates and deletes local users,
//! grants the default roles and reconciles the global admin role against the
//! admin group. Audit records are written only after the transaction
//! commits, so a failed sync leaves no trace besides its run history entry.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use teamsync_core::{
    AuditAction, AuditTarget, ComponentName, CorrelationId, DEFAULT_ROLES, NewUser, Principal,
    RoleAssignment, RoleName, User, UserId, normalize_email,
};
use teamsync_reconcile::AuditLogger;
use teamsync_storage::{DynStore, StoreTransaction};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::directory::{Directory, DirectoryUser, GroupMember};
use crate::error::UserSyncError;
use crate::history::RunHistory;
use crate::metrics;

/// Default admin group prefix, joined with `@<tenant domain>`.
pub const DEFAULT_ADMIN_GROUP_PREFIX: &str = "teamsync-admins";

#[derive(Debug, Clone)]
pub struct UserSyncConfig {
    pub tenant_domain: String,
    pub admin_group_prefix: String,
    /// Budget for one sync, directory paging included.
    pub timeout: Duration,
}

impl UserSyncConfig {
    pub fn new(tenant_domain: impl Into<String>) -> Self {
        Self {
            tenant_domain: tenant_domain.into(),
            admin_group_prefix: DEFAULT_ADMIN_GROUP_PREFIX.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_admin_group_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.admin_group_prefix = prefix.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn admin_group_email(&self) -> String {
        format!("{}@{}", self.admin_group_prefix, self.tenant_domain)
    }
}

/// Counts of what a successful sync changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub admins_granted: usize,
    pub admins_revoked: usize,
}

/// An audit record held back until the transaction commits.
#[derive(Debug)]
struct PendingAudit {
    target: AuditTarget,
    action: AuditAction,
    message: String,
}

/// A remote user and the local user it was matched to.
struct Planned {
    remote: DirectoryUser,
    email: String,
    local: Option<User>,
}

/// Sender side of the single-flight sync trigger.
///
/// The channel holds at most one pending request; triggers arriving while
/// one is pending are dropped.
#[derive(Debug, Clone)]
pub struct UserSyncTrigger {
    tx: mpsc::Sender<CorrelationId>,
}

impl UserSyncTrigger {
    pub fn channel() -> (Self, mpsc::Receiver<CorrelationId>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// Requests a sync. Returns `false` if one is already pending.
    pub fn trigger(&self, correlation_id: CorrelationId) -> bool {
        match self.tx.try_send(correlation_id) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!(correlation_id = %correlation_id, "User sync already pending, dropping trigger");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(correlation_id = %correlation_id, "User synchronizer is not running");
                false
            }
        }
    }
}

/// Imports users from a [`Directory`].
pub struct UserSynchronizer {
    store: DynStore,
    directory: Arc<dyn Directory>,
    audit: AuditLogger,
    config: UserSyncConfig,
    history: Arc<RunHistory>,
}

impl UserSynchronizer {
    pub fn new(
        store: DynStore,
        directory: Arc<dyn Directory>,
        config: UserSyncConfig,
        history: Arc<RunHistory>,
    ) -> Self {
        let audit = AuditLogger::new(store.clone(), ComponentName::USERSYNC);
        Self {
            store,
            directory,
            audit,
            config,
            history,
        }
    }

    pub fn history(&self) -> &Arc<RunHistory> {
        &self.history
    }

    /// Consumes triggers until `ctx` is cancelled or every sender is gone.
    pub async fn run(&self, ctx: CancellationToken, mut triggers: mpsc::Receiver<CorrelationId>) {
        info!(
            tenant_domain = %self.config.tenant_domain,
            admin_group = %self.config.admin_group_email(),
            "User synchronizer started"
        );
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                next = triggers.recv() => match next {
                    Some(correlation_id) => {
                        // Failures are recorded in the run history and logged by `sync`.
                        let _ = self.sync(&ctx, correlation_id).await;
                    }
                    None => break,
                },
            }
        }
        info!("User synchronizer stopped");
    }

    /// Runs one sync under the configured time budget.
    ///
    /// The budget covers the directory fetch and the store transaction.
    /// Audit records of a committed sync are written after it, so a late
    /// timeout never turns a committed sync into a failure.
    pub async fn sync(
        &self,
        ctx: &CancellationToken,
        correlation_id: CorrelationId,
    ) -> Result<SyncSummary, UserSyncError> {
        let run = self.history.start(correlation_id);
        info!(correlation_id = %correlation_id, "User sync started");

        let budget = ctx.child_token();
        let timed = tokio::time::timeout(self.config.timeout, self.sync_once(&budget));
        let result = match timed.await {
            Ok(result) => result,
            Err(_) => {
                budget.cancel();
                Err(UserSyncError::Timeout(self.config.timeout))
            }
        };

        let result = match result {
            Ok((summary, audits)) => {
                for audit in audits {
                    self.audit
                        .log(vec![audit.target], audit.action, correlation_id, audit.message)
                        .await;
                }
                Ok(summary)
            }
            Err(e) => Err(e),
        };

        match &result {
            Ok(summary) => {
                run.succeed();
                metrics::record_run(true);
                info!(
                    correlation_id = %correlation_id,
                    created = summary.created,
                    updated = summary.updated,
                    deleted = summary.deleted,
                    admins_granted = summary.admins_granted,
                    admins_revoked = summary.admins_revoked,
                    "User sync completed"
                );
            }
            Err(e) => {
                run.fail(e.to_string());
                metrics::record_run(false);
                error!(correlation_id = %correlation_id, error = %e, "User sync failed");
            }
        }
        result
    }

    /// Fetches the directory and applies it in one transaction. Returns the
    /// audit records to write once the transaction has committed.
    async fn sync_once(
        &self,
        ctx: &CancellationToken,
    ) -> Result<(SyncSummary, Vec<PendingAudit>), UserSyncError> {
        let remote = self.fetch_remote_users(ctx).await?;
        debug!(count = remote.len(), "Fetched directory users");

        let directory = self.directory.clone();
        let admin_group = self.config.admin_group_email();
        let ctx = ctx.clone();
        self.store
            .transaction(move |tx| {
                Box::pin(async move {
                    apply(tx, &ctx, directory.as_ref(), &admin_group, remote).await
                })
            })
            .await
    }

    async fn fetch_remote_users(
        &self,
        ctx: &CancellationToken,
    ) -> Result<Vec<DirectoryUser>, UserSyncError> {
        let mut users = Vec::new();
        let mut token: Option<String> = None;
        loop {
            if ctx.is_cancelled() {
                return Err(UserSyncError::Cancelled);
            }
            let page = self
                .directory
                .list_users(ctx, &self.config.tenant_domain, token.as_deref())
                .await?;
            users.extend(page.items.into_iter().filter(DirectoryUser::is_active));
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => return Ok(users),
            }
        }
    }
}

/// Pages a group; a missing group has no members.
async fn fetch_group_members(
    ctx: &CancellationToken,
    directory: &dyn Directory,
    group_email: &str,
) -> Result<Vec<GroupMember>, UserSyncError> {
    let mut members = Vec::new();
    let mut token: Option<String> = None;
    loop {
        if ctx.is_cancelled() {
            return Err(UserSyncError::Cancelled);
        }
        let page = match directory
            .list_group_members(ctx, group_email, token.as_deref())
            .await
        {
            Ok(page) => page,
            Err(e) if e.is_not_found() => {
                info!(group = %group_email, "Admin group does not exist, treating it as empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        members.extend(page.items);
        match page.next_page_token {
            Some(next) => token = Some(next),
            None => return Ok(members),
        }
    }
}

/// Matches each remote user to at most one local user, by external id
/// first and then by email.
fn plan(local: &[User], remote: Vec<DirectoryUser>) -> Vec<Planned> {
    let by_external: HashMap<&str, &User> =
        local.iter().map(|u| (u.external_id.as_str(), u)).collect();
    let by_email: HashMap<&str, &User> = local.iter().map(|u| (u.email.as_str(), u)).collect();

    let mut claimed: HashSet<UserId> = HashSet::new();
    let mut seen_emails: HashSet<String> = HashSet::new();
    let mut planned = Vec::with_capacity(remote.len());

    for user in remote {
        let email = match normalize_email(&user.primary_email) {
            Ok(email) => email,
            Err(e) => {
                warn!(external_id = %user.id, error = %e, "Skipping directory user with invalid email");
                continue;
            }
        };
        if !seen_emails.insert(email.clone()) {
            warn!(email = %email, "Skipping duplicate directory user");
            continue;
        }

        let local = [
            by_external.get(user.id.as_str()),
            by_email.get(email.as_str()),
        ]
        .into_iter()
        .flatten()
        .find(|candidate| !claimed.contains(&candidate.id))
        .map(|candidate| (*candidate).clone());

        if let Some(matched) = &local {
            claimed.insert(matched.id);
        }
        planned.push(Planned {
            remote: user,
            email,
            local,
        });
    }
    planned
}

async fn apply(
    tx: &mut dyn StoreTransaction,
    ctx: &CancellationToken,
    directory: &dyn Directory,
    admin_group: &str,
    remote: Vec<DirectoryUser>,
) -> Result<(SyncSummary, Vec<PendingAudit>), UserSyncError> {
    let mut summary = SyncSummary::default();
    let mut audits = Vec::new();

    let local = tx.list_users().await?;
    let planned = plan(&local, remote);
    let matched: HashSet<UserId> = planned
        .iter()
        .filter_map(|p| p.local.as_ref().map(|u| u.id))
        .collect();

    // Deletes first so that their emails and external ids become free.
    for user in local.iter().filter(|u| !matched.contains(&u.id)) {
        tx.delete_user(&user.id).await?;
        summary.deleted += 1;
        audits.push(PendingAudit {
            target: AuditTarget::user(&user.email),
            action: AuditAction::USERSYNC_DELETE,
            message: format!("Local user deleted: {}", user.email),
        });
    }

    // Kept users, by external id and with their current email.
    let mut known: HashMap<String, (UserId, String)> = HashMap::new();

    // Updates before creates: an update may release an email a create needs.
    for p in &planned {
        let Some(existing) = &p.local else { continue };
        if existing.email != p.email
            || existing.name != p.remote.name
            || existing.external_id != p.remote.id
        {
            let updated = tx
                .update_user(&User {
                    id: existing.id,
                    email: p.email.clone(),
                    name: p.remote.name.clone(),
                    external_id: p.remote.id.clone(),
                })
                .await?;
            summary.updated += 1;
            audits.push(PendingAudit {
                target: AuditTarget::user(&updated.email),
                action: AuditAction::USERSYNC_UPDATE,
                message: format!(
                    "Local user updated: {} (name {:?}, external id {})",
                    updated.email, updated.name, updated.external_id
                ),
            });
        }
        known.insert(p.remote.id.clone(), (existing.id, p.email.clone()));
    }

    for p in planned.iter().filter(|p| p.local.is_none()) {
        let created = tx
            .create_user(&NewUser {
                email: p.email.clone(),
                name: p.remote.name.clone(),
                external_id: p.remote.id.clone(),
            })
            .await?;
        summary.created += 1;
        audits.push(PendingAudit {
            target: AuditTarget::user(&created.email),
            action: AuditAction::USERSYNC_CREATE,
            message: format!("Local user created: {}", created.email),
        });
        known.insert(p.remote.id.clone(), (created.id, created.email));
    }

    let assignments: HashSet<RoleAssignment> =
        tx.list_role_assignments(None).await?.into_iter().collect();

    for (id, _) in known.values() {
        for role in DEFAULT_ROLES {
            let assignment = RoleAssignment::global(Principal::User(*id), role);
            if !assignments.contains(&assignment) {
                tx.assign_role(&assignment).await?;
            }
        }
    }

    let emails: HashMap<UserId, &str> = known
        .values()
        .map(|(id, email)| (*id, email.as_str()))
        .collect();

    let mut desired: BTreeSet<UserId> = BTreeSet::new();
    for member in fetch_group_members(ctx, directory, admin_group).await? {
        if !member.is_active_user() {
            continue;
        }
        match known.get(&member.id) {
            Some((id, _)) => {
                desired.insert(*id);
            }
            None => warn!(
                member = %member.email,
                external_id = %member.id,
                "Admin group member is not a known user"
            ),
        }
    }

    // Admins deleted above lost the role with the user.
    let current: BTreeSet<UserId> = assignments
        .iter()
        .filter(|a| a.role == RoleName::Admin && a.is_global())
        .filter_map(|a| match a.principal {
            Principal::User(id) => Some(id),
            Principal::ServiceAccount(_) => None,
        })
        .filter(|id| emails.contains_key(id))
        .collect();

    for id in desired.difference(&current) {
        tx.assign_role(&RoleAssignment::global(Principal::User(*id), RoleName::Admin))
            .await?;
        summary.admins_granted += 1;
        let email = emails.get(id).copied().unwrap_or_default();
        audits.push(PendingAudit {
            target: AuditTarget::user(email),
            action: AuditAction::USERSYNC_ASSIGN_ADMIN,
            message: format!("Assigned admin role to {email}"),
        });
    }

    for id in current.difference(&desired) {
        tx.revoke_role(&RoleAssignment::global(Principal::User(*id), RoleName::Admin))
            .await?;
        summary.admins_revoked += 1;
        let email = emails.get(id).copied().unwrap_or_default();
        audits.push(PendingAudit {
            target: AuditTarget::user(email),
            action: AuditAction::USERSYNC_REVOKE_ADMIN,
            message: format!("Revoked admin role from {email}"),
        });
    }

    Ok((summary, audits))
}
