use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use teamsync_core::{
    AuditRecord, AuditTarget, CorrelationId, Member, NewTeam, NewUser, Principal,
    ReconcilerDescriptor, ReconcilerError, ReconcilerName, ReconcilerRegistration,
    RoleAssignment, RoleName, ServiceAccount, Slug, Team, TeamRole, TeamUpdate, User, UserId,
    normalize_email,
};
use teamsync_storage::{Page, ReconcilerStateRecord, StorageError, Store, StoreTransaction};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Mutable state a transaction works on a private copy of.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryState {
    teams: BTreeMap<Slug, Team>,
    members: BTreeMap<Slug, BTreeMap<UserId, TeamRole>>,
    users: HashMap<UserId, User>,
    roles: BTreeSet<RoleAssignment>,
    service_accounts: BTreeMap<String, ServiceAccount>,
    reconciler_states: BTreeMap<(ReconcilerName, Slug), ReconcilerStateRecord>,
    reconcilers: BTreeMap<ReconcilerName, ReconcilerDescriptor>,
    reconciler_errors: BTreeMap<(ReconcilerName, Slug), ReconcilerError>,
    first_run_complete: bool,
}

/// Everything the in-memory store holds.
///
/// The audit log is append-only and never copied: a transaction buffers its
/// appends and moves them onto the log on commit.
#[derive(Debug, Default)]
pub(crate) struct SharedState {
    state: MemoryState,
    audit: Vec<AuditRecord>,
}

/// In-memory authoritative store.
///
/// Transactions are serializable: one transaction runs at a time and works
/// on a private copy of the state that replaces the shared state on commit.
/// A task must not begin a second transaction while it holds one.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Mutex<SharedState>>,
}

impl MemoryStore {
    /// Creates a new, empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StorageError> {
        let guard = self.shared.clone().lock_owned().await;
        let working = guard.state.clone();
        Ok(Box::new(MemoryTransaction {
            guard,
            working,
            pending_audit: Vec::new(),
        }))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

/// A transaction over [`MemoryStore`].
///
/// Holds the store lock for its whole lifetime. Dropping it discards the
/// working copy and the buffered audit records.
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<SharedState>,
    working: MemoryState,
    pending_audit: Vec<AuditRecord>,
}

impl MemoryTransaction {
    /// Committed audit records followed by this transaction's, oldest first.
    fn audit_log(&self) -> impl DoubleEndedIterator<Item = &AuditRecord> {
        self.guard.audit.iter().chain(self.pending_audit.iter())
    }

    fn active_team(&self, slug: &Slug) -> Result<&Team, StorageError> {
        self.working
            .teams
            .get(slug)
            .filter(|team| !team.is_deleted())
            .ok_or_else(|| StorageError::not_found("team", slug.as_str()))
    }

    fn require_user(&self, id: &UserId) -> Result<&User, StorageError> {
        self.working
            .users
            .get(id)
            .ok_or_else(|| StorageError::not_found("user", id.to_string()))
    }

    fn require_reconciler(
        &mut self,
        name: &ReconcilerName,
    ) -> Result<&mut ReconcilerDescriptor, StorageError> {
        self.working
            .reconcilers
            .get_mut(name)
            .ok_or_else(|| StorageError::not_found("reconciler", name.as_str()))
    }

    /// Rejects email or external id collisions with users other than `except`.
    fn check_user_unique(
        &self,
        email: &str,
        external_id: &str,
        except: Option<&UserId>,
    ) -> Result<(), StorageError> {
        for user in self.working.users.values() {
            if Some(&user.id) == except {
                continue;
            }
            if user.email == email {
                return Err(StorageError::already_exists("user", email));
            }
            if user.external_id == external_id {
                return Err(StorageError::already_exists("user", external_id));
            }
        }
        Ok(())
    }

    fn principal_exists(&self, principal: &Principal) -> bool {
        match principal {
            Principal::User(id) => self.working.users.contains_key(id),
            Principal::ServiceAccount(id) => {
                self.working.service_accounts.values().any(|sa| sa.id == *id)
            }
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemoryTransaction {
            mut guard,
            working,
            mut pending_audit,
        } = *self;
        guard.state = working;
        guard.audit.append(&mut pending_audit);
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }

    // ==================== Teams ====================

    async fn create_team(&mut self, team: &NewTeam) -> Result<Team, StorageError> {
        if self.working.teams.contains_key(&team.slug) {
            return Err(StorageError::already_exists("team", team.slug.as_str()));
        }
        let created = Team {
            slug: team.slug.clone(),
            purpose: team.purpose.clone(),
            slack_channel: team.slack_channel.clone(),
            created_at: OffsetDateTime::now_utc(),
            deleted_at: None,
        };
        self.working.teams.insert(team.slug.clone(), created.clone());
        Ok(created)
    }

    async fn get_team(&mut self, slug: &Slug) -> Result<Option<Team>, StorageError> {
        Ok(self
            .working
            .teams
            .get(slug)
            .filter(|team| !team.is_deleted())
            .cloned())
    }

    async fn update_team(
        &mut self,
        slug: &Slug,
        update: &TeamUpdate,
    ) -> Result<Team, StorageError> {
        self.active_team(slug)?;
        let team = self
            .working
            .teams
            .get_mut(slug)
            .ok_or_else(|| StorageError::not_found("team", slug.as_str()))?;
        if let Some(purpose) = &update.purpose {
            team.purpose = purpose.clone();
        }
        if let Some(channel) = &update.slack_channel {
            team.slack_channel = channel.clone();
        }
        Ok(team.clone())
    }

    async fn delete_team(&mut self, slug: &Slug) -> Result<(), StorageError> {
        self.active_team(slug)?;
        if let Some(team) = self.working.teams.get_mut(slug) {
            team.deleted_at = Some(OffsetDateTime::now_utc());
        }
        self.working.members.remove(slug);
        self.working
            .roles
            .retain(|assignment| assignment.target_team.as_ref() != Some(slug));
        Ok(())
    }

    async fn list_team_slugs(&mut self) -> Result<Vec<Slug>, StorageError> {
        Ok(self
            .working
            .teams
            .values()
            .filter(|team| !team.is_deleted())
            .map(|team| team.slug.clone())
            .collect())
    }

    // ==================== Members ====================

    async fn set_team_member(
        &mut self,
        slug: &Slug,
        user_id: &UserId,
        role: TeamRole,
    ) -> Result<(), StorageError> {
        self.active_team(slug)?;
        self.require_user(user_id)?;
        self.working
            .members
            .entry(slug.clone())
            .or_default()
            .insert(*user_id, role);
        Ok(())
    }

    async fn remove_team_member(
        &mut self,
        slug: &Slug,
        user_id: &UserId,
    ) -> Result<bool, StorageError> {
        self.active_team(slug)?;
        Ok(self
            .working
            .members
            .get_mut(slug)
            .is_some_and(|members| members.remove(user_id).is_some()))
    }

    async fn list_team_members(&mut self, slug: &Slug) -> Result<Vec<Member>, StorageError> {
        self.active_team(slug)?;
        let mut members: Vec<Member> = self
            .working
            .members
            .get(slug)
            .into_iter()
            .flatten()
            .filter_map(|(id, role)| {
                self.working.users.get(id).map(|user| Member {
                    user: user.clone(),
                    role: *role,
                })
            })
            .collect();
        members.sort_by(|a, b| a.user.email.cmp(&b.user.email));
        Ok(members)
    }

    // ==================== Users ====================

    async fn create_user(&mut self, user: &NewUser) -> Result<User, StorageError> {
        let email = normalize_email(&user.email)?;
        self.check_user_unique(&email, &user.external_id, None)?;
        let created = User {
            id: UserId::new(),
            email,
            name: user.name.clone(),
            external_id: user.external_id.clone(),
        };
        self.working.users.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_user(&mut self, user: &User) -> Result<User, StorageError> {
        self.require_user(&user.id)?;
        let email = normalize_email(&user.email)?;
        self.check_user_unique(&email, &user.external_id, Some(&user.id))?;
        let updated = User {
            email,
            ..user.clone()
        };
        self.working.users.insert(updated.id, updated.clone());
        Ok(updated)
    }

    async fn delete_user(&mut self, id: &UserId) -> Result<(), StorageError> {
        if self.working.users.remove(id).is_none() {
            return Err(StorageError::not_found("user", id.to_string()));
        }
        for members in self.working.members.values_mut() {
            members.remove(id);
        }
        let principal = Principal::User(*id);
        self.working
            .roles
            .retain(|assignment| assignment.principal != principal);
        Ok(())
    }

    async fn get_user(&mut self, id: &UserId) -> Result<Option<User>, StorageError> {
        Ok(self.working.users.get(id).cloned())
    }

    async fn get_user_by_email(&mut self, email: &str) -> Result<Option<User>, StorageError> {
        let email = email.trim().to_lowercase();
        Ok(self
            .working
            .users
            .values()
            .find(|user| user.email == email)
            .cloned())
    }

    async fn get_user_by_external_id(
        &mut self,
        external_id: &str,
    ) -> Result<Option<User>, StorageError> {
        Ok(self
            .working
            .users
            .values()
            .find(|user| user.external_id == external_id)
            .cloned())
    }

    async fn list_users(&mut self) -> Result<Vec<User>, StorageError> {
        let mut users: Vec<User> = self.working.users.values().cloned().collect();
        users.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(users)
    }

    // ==================== Roles ====================

    async fn assign_role(&mut self, assignment: &RoleAssignment) -> Result<bool, StorageError> {
        if !self.principal_exists(&assignment.principal) {
            return Err(StorageError::not_found(
                assignment.principal.kind(),
                assignment.principal.id().to_string(),
            ));
        }
        if let Some(team) = &assignment.target_team {
            self.active_team(team)?;
        }
        Ok(self.working.roles.insert(assignment.clone()))
    }

    async fn revoke_role(&mut self, assignment: &RoleAssignment) -> Result<bool, StorageError> {
        Ok(self.working.roles.remove(assignment))
    }

    async fn list_roles_for_principal(
        &mut self,
        principal: &Principal,
    ) -> Result<Vec<RoleAssignment>, StorageError> {
        Ok(self
            .working
            .roles
            .iter()
            .filter(|assignment| assignment.principal == *principal)
            .cloned()
            .collect())
    }

    async fn list_role_assignments(
        &mut self,
        role: Option<RoleName>,
    ) -> Result<Vec<RoleAssignment>, StorageError> {
        Ok(self
            .working
            .roles
            .iter()
            .filter(|assignment| role.is_none_or(|role| assignment.role == role))
            .cloned()
            .collect())
    }

    // ==================== Service accounts ====================

    async fn upsert_service_account(
        &mut self,
        name: &str,
        api_key_hash: &str,
    ) -> Result<ServiceAccount, StorageError> {
        if name.trim().is_empty() {
            return Err(StorageError::invalid_input("service account name is empty"));
        }
        let account = self
            .working
            .service_accounts
            .entry(name.to_string())
            .or_insert_with(|| ServiceAccount {
                id: uuid::Uuid::new_v4(),
                name: name.to_string(),
                api_key_hash: String::new(),
            });
        account.api_key_hash = api_key_hash.to_string();
        Ok(account.clone())
    }

    async fn get_service_account(
        &mut self,
        name: &str,
    ) -> Result<Option<ServiceAccount>, StorageError> {
        Ok(self.working.service_accounts.get(name).cloned())
    }

    async fn list_service_accounts(&mut self) -> Result<Vec<ServiceAccount>, StorageError> {
        Ok(self.working.service_accounts.values().cloned().collect())
    }

    async fn delete_service_account(&mut self, name: &str) -> Result<(), StorageError> {
        let account = self
            .working
            .service_accounts
            .remove(name)
            .ok_or_else(|| StorageError::not_found("service-account", name))?;
        let principal = Principal::ServiceAccount(account.id);
        self.working
            .roles
            .retain(|assignment| assignment.principal != principal);
        Ok(())
    }

    // ==================== Reconciler state ====================

    async fn get_reconciler_state(
        &mut self,
        reconciler: &ReconcilerName,
        slug: &Slug,
    ) -> Result<Option<ReconcilerStateRecord>, StorageError> {
        Ok(self
            .working
            .reconciler_states
            .get(&(reconciler.clone(), slug.clone()))
            .cloned())
    }

    async fn set_reconciler_state(
        &mut self,
        reconciler: &ReconcilerName,
        slug: &Slug,
        schema_version: u32,
        payload: &Value,
    ) -> Result<(), StorageError> {
        let record = ReconcilerStateRecord {
            reconciler: reconciler.clone(),
            team: slug.clone(),
            schema_version,
            payload: payload.clone(),
            updated_at: OffsetDateTime::now_utc(),
        };
        self.working
            .reconciler_states
            .insert((reconciler.clone(), slug.clone()), record);
        Ok(())
    }

    async fn delete_reconciler_state(
        &mut self,
        reconciler: &ReconcilerName,
        slug: &Slug,
    ) -> Result<bool, StorageError> {
        Ok(self
            .working
            .reconciler_states
            .remove(&(reconciler.clone(), slug.clone()))
            .is_some())
    }

    async fn delete_team_reconciler_states(&mut self, slug: &Slug) -> Result<u64, StorageError> {
        let before = self.working.reconciler_states.len();
        self.working
            .reconciler_states
            .retain(|(_, team), _| team != slug);
        Ok((before - self.working.reconciler_states.len()) as u64)
    }

    async fn list_removed_team_slugs(&mut self) -> Result<Vec<Slug>, StorageError> {
        let removed: BTreeSet<&Slug> = self
            .working
            .reconciler_states
            .keys()
            .map(|(_, slug)| slug)
            .filter(|slug| {
                self.working
                    .teams
                    .get(*slug)
                    .is_none_or(|team| team.is_deleted())
            })
            .collect();
        Ok(removed.into_iter().cloned().collect())
    }

    // ==================== Reconcilers ====================

    async fn upsert_reconciler(
        &mut self,
        registration: &ReconcilerRegistration,
    ) -> Result<ReconcilerDescriptor, StorageError> {
        let descriptor = self
            .working
            .reconcilers
            .entry(registration.name.clone())
            .or_insert_with(|| ReconcilerDescriptor {
                name: registration.name.clone(),
                display_name: String::new(),
                description: String::new(),
                enabled: false,
                run_order: 0,
                config: Value::Object(Default::default()),
            });
        descriptor.display_name = registration.display_name.clone();
        descriptor.description = registration.description.clone();
        descriptor.run_order = registration.run_order;
        Ok(descriptor.clone())
    }

    async fn get_reconciler(
        &mut self,
        name: &ReconcilerName,
    ) -> Result<Option<ReconcilerDescriptor>, StorageError> {
        Ok(self.working.reconcilers.get(name).cloned())
    }

    async fn set_reconciler_enabled(
        &mut self,
        name: &ReconcilerName,
        enabled: bool,
    ) -> Result<ReconcilerDescriptor, StorageError> {
        let descriptor = self.require_reconciler(name)?;
        descriptor.enabled = enabled;
        Ok(descriptor.clone())
    }

    async fn set_reconciler_config(
        &mut self,
        name: &ReconcilerName,
        config: &Value,
    ) -> Result<ReconcilerDescriptor, StorageError> {
        let descriptor = self.require_reconciler(name)?;
        descriptor.config = config.clone();
        Ok(descriptor.clone())
    }

    async fn list_reconcilers(&mut self) -> Result<Vec<ReconcilerDescriptor>, StorageError> {
        let mut reconcilers: Vec<ReconcilerDescriptor> =
            self.working.reconcilers.values().cloned().collect();
        reconcilers.sort_by(|a, b| a.run_order.cmp(&b.run_order).then(a.name.cmp(&b.name)));
        Ok(reconcilers)
    }

    // ==================== Reconciler errors ====================

    async fn record_reconciler_error(
        &mut self,
        error: &ReconcilerError,
    ) -> Result<(), StorageError> {
        self.working.reconciler_errors.insert(
            (error.reconciler.clone(), error.team.clone()),
            error.clone(),
        );
        Ok(())
    }

    async fn clear_reconciler_error(
        &mut self,
        reconciler: &ReconcilerName,
        slug: &Slug,
    ) -> Result<(), StorageError> {
        self.working
            .reconciler_errors
            .remove(&(reconciler.clone(), slug.clone()));
        Ok(())
    }

    async fn list_reconciler_errors(
        &mut self,
        reconciler: &ReconcilerName,
    ) -> Result<Vec<ReconcilerError>, StorageError> {
        Ok(self
            .working
            .reconciler_errors
            .values()
            .filter(|error| error.reconciler == *reconciler)
            .cloned()
            .collect())
    }

    // ==================== Audit ====================

    async fn append_audit(&mut self, record: &AuditRecord) -> Result<(), StorageError> {
        self.pending_audit.push(record.clone());
        Ok(())
    }

    async fn audit_by_target(
        &mut self,
        target: &AuditTarget,
        limit: usize,
        offset: usize,
    ) -> Result<Page<AuditRecord>, StorageError> {
        let matching: Vec<AuditRecord> = self
            .audit_log()
            .rev()
            .filter(|record| record.has_target(target))
            .cloned()
            .collect();
        Ok(Page::from_ordered(matching, limit, offset))
    }

    async fn audit_by_correlation(
        &mut self,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<AuditRecord>, StorageError> {
        Ok(self
            .audit_log()
            .filter(|record| record.correlation_id == *correlation_id)
            .cloned()
            .collect())
    }

    // ==================== First run ====================

    async fn first_run(&mut self) -> Result<bool, StorageError> {
        Ok(!self.working.first_run_complete)
    }

    async fn mark_first_run_complete(&mut self) -> Result<(), StorageError> {
        self.working.first_run_complete = true;
        Ok(())
    }
}
