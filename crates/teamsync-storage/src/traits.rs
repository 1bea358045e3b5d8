//! Storage traits for the authoritative store.
//!
//! All reads and writes happen inside a [`StoreTransaction`]. The [`Store`]
//! itself only begins transactions; its provided methods are single-operation
//! conveniences that begin, run and commit a transaction.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use teamsync_core::{
    AuditRecord, AuditTarget, CorrelationId, Member, NewTeam, NewUser, Principal,
    ReconcilerDescriptor, ReconcilerError, ReconcilerName, ReconcilerRegistration,
    RoleAssignment, RoleName, ServiceAccount, Slug, Team, TeamRole, TeamUpdate, User, UserId,
};

use crate::error::StorageError;
use crate::types::{Page, ReconcilerStateRecord};

/// The authoritative store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Begins a new transaction.
    ///
    /// Dropping the returned transaction without committing rolls it back.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StorageError>;

    /// Returns the name of this storage backend.
    fn backend_name(&self) -> &'static str;

    /// Returns `true` until the first-run bootstrap has been completed.
    async fn first_run(&self) -> Result<bool, StorageError> {
        let mut tx = self.begin().await?;
        let first_run = tx.first_run().await?;
        tx.commit().await?;
        Ok(first_run)
    }

    /// Lists slugs of all non-deleted teams.
    async fn list_team_slugs(&self) -> Result<Vec<Slug>, StorageError> {
        let mut tx = self.begin().await?;
        let slugs = tx.list_team_slugs().await?;
        tx.commit().await?;
        Ok(slugs)
    }

    /// Lists slugs of deleted teams that still have reconciler state.
    async fn list_removed_team_slugs(&self) -> Result<Vec<Slug>, StorageError> {
        let mut tx = self.begin().await?;
        let slugs = tx.list_removed_team_slugs().await?;
        tx.commit().await?;
        Ok(slugs)
    }

    /// Lists registered reconcilers in run order.
    async fn list_reconcilers(&self) -> Result<Vec<ReconcilerDescriptor>, StorageError> {
        let mut tx = self.begin().await?;
        let reconcilers = tx.list_reconcilers().await?;
        tx.commit().await?;
        Ok(reconcilers)
    }

    /// Appends a single audit record in its own transaction.
    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StorageError> {
        let mut tx = self.begin().await?;
        tx.append_audit(record).await?;
        tx.commit().await
    }

    /// Reads audit records for a target, newest first.
    async fn audit_by_target(
        &self,
        target: &AuditTarget,
        limit: usize,
        offset: usize,
    ) -> Result<Page<AuditRecord>, StorageError> {
        let mut tx = self.begin().await?;
        let page = tx.audit_by_target(target, limit, offset).await?;
        tx.commit().await?;
        Ok(page)
    }

    /// Reads audit records of one logical operation, in insertion order.
    async fn audit_by_correlation(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<AuditRecord>, StorageError> {
        let mut tx = self.begin().await?;
        let records = tx.audit_by_correlation(correlation_id).await?;
        tx.commit().await?;
        Ok(records)
    }
}

impl dyn Store {
    /// Runs `f` inside a transaction.
    ///
    /// Commits when `f` returns `Ok` and rolls back when it returns `Err`.
    /// If `f` panics the transaction is dropped uncommitted, which rolls it
    /// back. Nested transactions are not supported.
    ///
    /// ```ignore
    /// let team = store
    ///     .transaction(move |tx| Box::pin(async move { tx.get_team(&slug).await }))
    ///     .await?;
    /// ```
    pub async fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'t> FnOnce(&'t mut dyn StoreTransaction) -> BoxFuture<'t, Result<T, E>> + Send,
        T: Send,
        E: From<StorageError> + Send,
    {
        let mut tx = self.begin().await?;
        let result = f(tx.as_mut()).await;
        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Transaction rollback failed");
                }
                Err(err)
            }
        }
    }
}

/// A store transaction.
///
/// Operations on a transaction are only visible to other transactions after
/// [`StoreTransaction::commit`].
#[async_trait]
pub trait StoreTransaction: Send + Sync {
    /// Commits the transaction.
    async fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Rolls back the transaction.
    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;

    // ==================== Teams ====================

    /// Creates a team. Fails with `AlreadyExists` if the slug was ever used.
    async fn create_team(&mut self, team: &NewTeam) -> Result<Team, StorageError>;

    /// Reads a non-deleted team.
    async fn get_team(&mut self, slug: &Slug) -> Result<Option<Team>, StorageError>;

    async fn update_team(&mut self, slug: &Slug, update: &TeamUpdate)
    -> Result<Team, StorageError>;

    /// Soft-deletes a team. Memberships and team-scoped roles are dropped;
    /// the slug stays reserved.
    async fn delete_team(&mut self, slug: &Slug) -> Result<(), StorageError>;

    /// Lists slugs of all non-deleted teams, sorted.
    async fn list_team_slugs(&mut self) -> Result<Vec<Slug>, StorageError>;

    // ==================== Members ====================

    /// Adds a member or changes the role of an existing member.
    async fn set_team_member(
        &mut self,
        slug: &Slug,
        user_id: &UserId,
        role: TeamRole,
    ) -> Result<(), StorageError>;

    /// Removes a member. Returns `false` if the user was not a member.
    async fn remove_team_member(
        &mut self,
        slug: &Slug,
        user_id: &UserId,
    ) -> Result<bool, StorageError>;

    /// Lists members of a team, sorted by email.
    async fn list_team_members(&mut self, slug: &Slug) -> Result<Vec<Member>, StorageError>;

    // ==================== Users ====================

    /// Creates a user. The email is stored lowercased and must be unique.
    async fn create_user(&mut self, user: &NewUser) -> Result<User, StorageError>;

    /// Updates name, email and external id of an existing user.
    async fn update_user(&mut self, user: &User) -> Result<User, StorageError>;

    /// Deletes a user together with its memberships and role assignments.
    async fn delete_user(&mut self, id: &UserId) -> Result<(), StorageError>;

    async fn get_user(&mut self, id: &UserId) -> Result<Option<User>, StorageError>;

    /// Case-insensitive lookup by email.
    async fn get_user_by_email(&mut self, email: &str) -> Result<Option<User>, StorageError>;

    async fn get_user_by_external_id(
        &mut self,
        external_id: &str,
    ) -> Result<Option<User>, StorageError>;

    /// Lists all users, sorted by email.
    async fn list_users(&mut self) -> Result<Vec<User>, StorageError>;

    // ==================== Roles ====================

    /// Assigns a role. Returns `false` if the assignment already existed.
    async fn assign_role(&mut self, assignment: &RoleAssignment) -> Result<bool, StorageError>;

    /// Revokes a role. Returns `false` if there was nothing to revoke.
    async fn revoke_role(&mut self, assignment: &RoleAssignment) -> Result<bool, StorageError>;

    async fn list_roles_for_principal(
        &mut self,
        principal: &Principal,
    ) -> Result<Vec<RoleAssignment>, StorageError>;

    /// Lists assignments of one role, or of every role when `role` is `None`.
    async fn list_role_assignments(
        &mut self,
        role: Option<RoleName>,
    ) -> Result<Vec<RoleAssignment>, StorageError>;

    // ==================== Service accounts ====================

    /// Creates the service account or replaces its API key hash.
    async fn upsert_service_account(
        &mut self,
        name: &str,
        api_key_hash: &str,
    ) -> Result<ServiceAccount, StorageError>;

    async fn get_service_account(
        &mut self,
        name: &str,
    ) -> Result<Option<ServiceAccount>, StorageError>;

    async fn list_service_accounts(&mut self) -> Result<Vec<ServiceAccount>, StorageError>;

    /// Deletes a service account and its role assignments.
    async fn delete_service_account(&mut self, name: &str) -> Result<(), StorageError>;

    // ==================== Reconciler state ====================

    async fn get_reconciler_state(
        &mut self,
        reconciler: &ReconcilerName,
        slug: &Slug,
    ) -> Result<Option<ReconcilerStateRecord>, StorageError>;

    async fn set_reconciler_state(
        &mut self,
        reconciler: &ReconcilerName,
        slug: &Slug,
        schema_version: u32,
        payload: &Value,
    ) -> Result<(), StorageError>;

    /// Returns `false` if no state existed.
    async fn delete_reconciler_state(
        &mut self,
        reconciler: &ReconcilerName,
        slug: &Slug,
    ) -> Result<bool, StorageError>;

    /// Deletes every reconciler's state for a team. Returns the number of
    /// removed rows.
    async fn delete_team_reconciler_states(&mut self, slug: &Slug) -> Result<u64, StorageError>;

    /// Slugs with reconciler state whose team is deleted or unknown, sorted.
    async fn list_removed_team_slugs(&mut self) -> Result<Vec<Slug>, StorageError>;

    // ==================== Reconcilers ====================

    /// Registers a reconciler. Re-registration updates display name,
    /// description and run order but keeps the enabled flag and config.
    async fn upsert_reconciler(
        &mut self,
        registration: &ReconcilerRegistration,
    ) -> Result<ReconcilerDescriptor, StorageError>;

    async fn get_reconciler(
        &mut self,
        name: &ReconcilerName,
    ) -> Result<Option<ReconcilerDescriptor>, StorageError>;

    async fn set_reconciler_enabled(
        &mut self,
        name: &ReconcilerName,
        enabled: bool,
    ) -> Result<ReconcilerDescriptor, StorageError>;

    async fn set_reconciler_config(
        &mut self,
        name: &ReconcilerName,
        config: &Value,
    ) -> Result<ReconcilerDescriptor, StorageError>;

    /// Lists reconcilers ordered by run order, then name.
    async fn list_reconcilers(&mut self) -> Result<Vec<ReconcilerDescriptor>, StorageError>;

    // ==================== Reconciler errors ====================

    /// Records the latest error of a reconciler for a team, replacing any
    /// previous one.
    async fn record_reconciler_error(&mut self, error: &ReconcilerError)
    -> Result<(), StorageError>;

    async fn clear_reconciler_error(
        &mut self,
        reconciler: &ReconcilerName,
        slug: &Slug,
    ) -> Result<(), StorageError>;

    async fn list_reconciler_errors(
        &mut self,
        reconciler: &ReconcilerName,
    ) -> Result<Vec<ReconcilerError>, StorageError>;

    // ==================== Audit ====================

    async fn append_audit(&mut self, record: &AuditRecord) -> Result<(), StorageError>;

    /// Reads audit records that reference `target`, newest first.
    async fn audit_by_target(
        &mut self,
        target: &AuditTarget,
        limit: usize,
        offset: usize,
    ) -> Result<Page<AuditRecord>, StorageError>;

    /// Reads audit records with the given correlation id, in insertion order.
    async fn audit_by_correlation(
        &mut self,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<AuditRecord>, StorageError>;

    // ==================== First run ====================

    async fn first_run(&mut self) -> Result<bool, StorageError>;

    async fn mark_first_run_complete(&mut self) -> Result<(), StorageError>;
}
