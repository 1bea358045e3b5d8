//! PostgreSQL implementation of the store transaction.

use async_trait::async_trait;
use serde_json::{Value, json};
use sqlx_core::query::query;
use sqlx_core::query_scalar::query_scalar;
use sqlx_postgres::{PgConnection, PgTransaction};
use teamsync_core::{
    AuditRecord, AuditTarget, CorrelationId, Member, NewTeam, NewUser, Principal,
    ReconcilerDescriptor, ReconcilerError, ReconcilerName, ReconcilerRegistration,
    RoleAssignment, RoleName, ServiceAccount, Slug, Team, TeamRole, TeamUpdate, User, UserId,
    normalize_email,
};
use teamsync_storage::{Page, ReconcilerStateRecord, StorageError, StoreTransaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{classify, internal};
use crate::rows::{self, AUDIT_COLUMNS, RECONCILER_COLUMNS, ROLE_COLUMNS, TEAM_COLUMNS, USER_COLUMNS};

/// PostgreSQL transaction wrapper.
///
/// The sqlx transaction rolls back on drop if it was not committed. The
/// mutex only provides `Sync`; every operation takes `&mut self` and reaches
/// the connection through [`Mutex::get_mut`] without locking.
pub struct PostgresTransaction {
    tx: Mutex<Option<Box<PgTransaction<'static>>>>,
}

impl PostgresTransaction {
    pub(crate) fn new(tx: PgTransaction<'static>) -> Self {
        Self {
            tx: Mutex::new(Some(Box::new(tx))),
        }
    }

    fn conn(&mut self) -> Result<&mut PgConnection, StorageError> {
        let tx = self.tx.get_mut().as_deref_mut().ok_or_else(|| {
            StorageError::transaction_error("Transaction already completed (committed or rolled back)")
        })?;
        Ok(&mut **tx)
    }

    async fn ensure_active_team(&mut self, slug: &Slug) -> Result<(), StorageError> {
        let exists: bool = query_scalar(
            "SELECT EXISTS (SELECT 1 FROM teams WHERE slug = $1 AND deleted_at IS NULL)",
        )
        .bind(slug.as_str())
        .fetch_one(self.conn()?)
        .await
        .map_err(internal)?;

        if exists {
            Ok(())
        } else {
            Err(StorageError::not_found("team", slug.as_str()))
        }
    }

    async fn principal_exists(&mut self, principal: &Principal) -> Result<bool, StorageError> {
        let sql = match principal {
            Principal::User(_) => "SELECT EXISTS (SELECT 1 FROM users WHERE id = $1)",
            Principal::ServiceAccount(_) => {
                "SELECT EXISTS (SELECT 1 FROM service_accounts WHERE id = $1)"
            }
        };
        query_scalar(sql)
            .bind(principal.id())
            .fetch_one(self.conn()?)
            .await
            .map_err(internal)
    }

    async fn delete_principal_roles(&mut self, principal: &Principal) -> Result<(), StorageError> {
        query("DELETE FROM role_assignments WHERE principal_kind = $1 AND principal_id = $2")
            .bind(principal.kind())
            .bind(principal.id())
            .execute(self.conn()?)
            .await
            .map_err(internal)?;
        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    async fn commit(mut self: Box<Self>) -> Result<(), StorageError> {
        if let Some(tx) = self.tx.get_mut().take() {
            // Serialization failures surface here and must stay retryable.
            tx.commit().await.map_err(internal)?;
            tracing::debug!("Transaction committed");
        }
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<(), StorageError> {
        if let Some(tx) = self.tx.get_mut().take() {
            tx.rollback().await.map_err(|e| {
                StorageError::transaction_error(format!("Failed to rollback transaction: {e}"))
            })?;
            tracing::debug!("Transaction rolled back");
        }
        Ok(())
    }

    // ==================== Teams ====================

    async fn create_team(&mut self, team: &NewTeam) -> Result<Team, StorageError> {
        let sql = format!(
            "INSERT INTO teams (slug, purpose, slack_channel) VALUES ($1, $2, $3)
             RETURNING {TEAM_COLUMNS}"
        );
        let row = query(&sql)
            .bind(team.slug.as_str())
            .bind(&team.purpose)
            .bind(team.slack_channel.as_deref())
            .fetch_one(self.conn()?)
            .await
            .map_err(|e| classify(e, "team", team.slug.as_str()))?;
        rows::team(&row)
    }

    async fn get_team(&mut self, slug: &Slug) -> Result<Option<Team>, StorageError> {
        let sql = format!("SELECT {TEAM_COLUMNS} FROM teams WHERE slug = $1 AND deleted_at IS NULL");
        let row = query(&sql)
            .bind(slug.as_str())
            .fetch_optional(self.conn()?)
            .await
            .map_err(internal)?;
        row.as_ref().map(rows::team).transpose()
    }

    async fn update_team(
        &mut self,
        slug: &Slug,
        update: &TeamUpdate,
    ) -> Result<Team, StorageError> {
        let sql = format!(
            "UPDATE teams
             SET purpose = COALESCE($2, purpose),
                 slack_channel = CASE WHEN $3 THEN $4 ELSE slack_channel END
             WHERE slug = $1 AND deleted_at IS NULL
             RETURNING {TEAM_COLUMNS}"
        );
        let row = query(&sql)
            .bind(slug.as_str())
            .bind(update.purpose.as_deref())
            .bind(update.slack_channel.is_some())
            .bind(update.slack_channel.clone().flatten())
            .fetch_optional(self.conn()?)
            .await
            .map_err(internal)?
            .ok_or_else(|| StorageError::not_found("team", slug.as_str()))?;
        rows::team(&row)
    }

    async fn delete_team(&mut self, slug: &Slug) -> Result<(), StorageError> {
        let result =
            query("UPDATE teams SET deleted_at = now() WHERE slug = $1 AND deleted_at IS NULL")
                .bind(slug.as_str())
                .execute(self.conn()?)
                .await
                .map_err(internal)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("team", slug.as_str()));
        }

        query("DELETE FROM team_members WHERE team_slug = $1")
            .bind(slug.as_str())
            .execute(self.conn()?)
            .await
            .map_err(internal)?;
        query("DELETE FROM role_assignments WHERE target_team = $1")
            .bind(slug.as_str())
            .execute(self.conn()?)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn list_team_slugs(&mut self) -> Result<Vec<Slug>, StorageError> {
        let raw: Vec<String> =
            query_scalar("SELECT slug FROM teams WHERE deleted_at IS NULL ORDER BY slug")
                .fetch_all(self.conn()?)
                .await
                .map_err(internal)?;
        raw.iter()
            .map(|s| Slug::parse(s).map_err(|e| StorageError::internal(e.to_string())))
            .collect()
    }

    // ==================== Members ====================

    async fn set_team_member(
        &mut self,
        slug: &Slug,
        user_id: &UserId,
        role: TeamRole,
    ) -> Result<(), StorageError> {
        self.ensure_active_team(slug).await?;
        query(
            "INSERT INTO team_members (team_slug, user_id, role) VALUES ($1, $2, $3)
             ON CONFLICT (team_slug, user_id) DO UPDATE SET role = EXCLUDED.role",
        )
        .bind(slug.as_str())
        .bind(user_id.as_uuid())
        .bind(role.as_str())
        .execute(self.conn()?)
        .await
        .map_err(|e| classify(e, "user", &user_id.to_string()))?;
        Ok(())
    }

    async fn remove_team_member(
        &mut self,
        slug: &Slug,
        user_id: &UserId,
    ) -> Result<bool, StorageError> {
        self.ensure_active_team(slug).await?;
        let result = query("DELETE FROM team_members WHERE team_slug = $1 AND user_id = $2")
            .bind(slug.as_str())
            .bind(user_id.as_uuid())
            .execute(self.conn()?)
            .await
            .map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_team_members(&mut self, slug: &Slug) -> Result<Vec<Member>, StorageError> {
        self.ensure_active_team(slug).await?;
        let found = query(
            "SELECT u.id, u.email, u.name, u.external_id, m.role
             FROM team_members m JOIN users u ON u.id = m.user_id
             WHERE m.team_slug = $1
             ORDER BY u.email",
        )
        .bind(slug.as_str())
        .fetch_all(self.conn()?)
        .await
        .map_err(internal)?;
        found.iter().map(rows::member).collect()
    }

    // ==================== Users ====================

    async fn create_user(&mut self, user: &NewUser) -> Result<User, StorageError> {
        let email = normalize_email(&user.email)?;
        let sql = format!(
            "INSERT INTO users (id, email, name, external_id) VALUES ($1, $2, $3, $4)
             RETURNING {USER_COLUMNS}"
        );
        let row = query(&sql)
            .bind(Uuid::new_v4())
            .bind(&email)
            .bind(&user.name)
            .bind(&user.external_id)
            .fetch_one(self.conn()?)
            .await
            .map_err(|e| classify(e, "user", &email))?;
        rows::user(&row)
    }

    async fn update_user(&mut self, user: &User) -> Result<User, StorageError> {
        let email = normalize_email(&user.email)?;
        let sql = format!(
            "UPDATE users SET email = $2, name = $3, external_id = $4 WHERE id = $1
             RETURNING {USER_COLUMNS}"
        );
        let row = query(&sql)
            .bind(user.id.as_uuid())
            .bind(&email)
            .bind(&user.name)
            .bind(&user.external_id)
            .fetch_optional(self.conn()?)
            .await
            .map_err(|e| classify(e, "user", &email))?
            .ok_or_else(|| StorageError::not_found("user", user.id.to_string()))?;
        rows::user(&row)
    }

    async fn delete_user(&mut self, id: &UserId) -> Result<(), StorageError> {
        let result = query("DELETE FROM users WHERE id = $1")
            .bind(id.as_uuid())
            .execute(self.conn()?)
            .await
            .map_err(internal)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::not_found("user", id.to_string()));
        }
        self.delete_principal_roles(&Principal::User(*id)).await
    }

    async fn get_user(&mut self, id: &UserId) -> Result<Option<User>, StorageError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(self.conn()?)
            .await
            .map_err(internal)?;
        row.as_ref().map(rows::user).transpose()
    }

    async fn get_user_by_email(&mut self, email: &str) -> Result<Option<User>, StorageError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE lower(email) = lower($1)");
        let row = query(&sql)
            .bind(email.trim())
            .fetch_optional(self.conn()?)
            .await
            .map_err(internal)?;
        row.as_ref().map(rows::user).transpose()
    }

    async fn get_user_by_external_id(
        &mut self,
        external_id: &str,
    ) -> Result<Option<User>, StorageError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE external_id = $1");
        let row = query(&sql)
            .bind(external_id)
            .fetch_optional(self.conn()?)
            .await
            .map_err(internal)?;
        row.as_ref().map(rows::user).transpose()
    }

    async fn list_users(&mut self) -> Result<Vec<User>, StorageError> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users ORDER BY email");
        let found = query(&sql)
            .fetch_all(self.conn()?)
            .await
            .map_err(internal)?;
        found.iter().map(rows::user).collect()
    }

    // ==================== Roles ====================

    async fn assign_role(&mut self, assignment: &RoleAssignment) -> Result<bool, StorageError> {
        let principal = &assignment.principal;
        if !self.principal_exists(principal).await? {
            return Err(StorageError::not_found(
                principal.kind(),
                principal.id().to_string(),
            ));
        }
        if let Some(team) = &assignment.target_team {
            self.ensure_active_team(team).await?;
        }

        let result = query(
            "INSERT INTO role_assignments (principal_kind, principal_id, role_name, target_team)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT DO NOTHING",
        )
        .bind(principal.kind())
        .bind(principal.id())
        .bind(assignment.role.as_str())
        .bind(assignment.target_team.as_ref().map(Slug::as_str))
        .execute(self.conn()?)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_role(&mut self, assignment: &RoleAssignment) -> Result<bool, StorageError> {
        let result = query(
            "DELETE FROM role_assignments
             WHERE principal_kind = $1 AND principal_id = $2 AND role_name = $3
               AND target_team IS NOT DISTINCT FROM $4",
        )
        .bind(assignment.principal.kind())
        .bind(assignment.principal.id())
        .bind(assignment.role.as_str())
        .bind(assignment.target_team.as_ref().map(Slug::as_str))
        .execute(self.conn()?)
        .await
        .map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_roles_for_principal(
        &mut self,
        principal: &Principal,
    ) -> Result<Vec<RoleAssignment>, StorageError> {
        let sql = format!(
            "SELECT {ROLE_COLUMNS} FROM role_assignments
             WHERE principal_kind = $1 AND principal_id = $2
             ORDER BY role_name, target_team NULLS FIRST"
        );
        let found = query(&sql)
            .bind(principal.kind())
            .bind(principal.id())
            .fetch_all(self.conn()?)
            .await
            .map_err(internal)?;
        found.iter().map(rows::role_assignment).collect()
    }

    async fn list_role_assignments(
        &mut self,
        role: Option<RoleName>,
    ) -> Result<Vec<RoleAssignment>, StorageError> {
        let sql = format!(
            "SELECT {ROLE_COLUMNS} FROM role_assignments
             WHERE ($1::text IS NULL OR role_name = $1)
             ORDER BY principal_kind, principal_id, role_name"
        );
        let found = query(&sql)
            .bind(role.map(|r| r.as_str()))
            .fetch_all(self.conn()?)
            .await
            .map_err(internal)?;
        found.iter().map(rows::role_assignment).collect()
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
        let row = query(
            "INSERT INTO service_accounts (id, name, api_key_hash) VALUES ($1, $2, $3)
             ON CONFLICT (name) DO UPDATE SET api_key_hash = EXCLUDED.api_key_hash
             RETURNING id, name, api_key_hash",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(api_key_hash)
        .fetch_one(self.conn()?)
        .await
        .map_err(|e| classify(e, "service-account", name))?;
        rows::service_account(&row)
    }

    async fn get_service_account(
        &mut self,
        name: &str,
    ) -> Result<Option<ServiceAccount>, StorageError> {
        let row = query("SELECT id, name, api_key_hash FROM service_accounts WHERE name = $1")
            .bind(name)
            .fetch_optional(self.conn()?)
            .await
            .map_err(internal)?;
        row.as_ref().map(rows::service_account).transpose()
    }

    async fn list_service_accounts(&mut self) -> Result<Vec<ServiceAccount>, StorageError> {
        let found = query("SELECT id, name, api_key_hash FROM service_accounts ORDER BY name")
            .fetch_all(self.conn()?)
            .await
            .map_err(internal)?;
        found.iter().map(rows::service_account).collect()
    }

    async fn delete_service_account(&mut self, name: &str) -> Result<(), StorageError> {
        let id: Option<Uuid> = query_scalar("DELETE FROM service_accounts WHERE name = $1 RETURNING id")
            .bind(name)
            .fetch_optional(self.conn()?)
            .await
            .map_err(internal)?;
        let id = id.ok_or_else(|| StorageError::not_found("service-account", name))?;
        self.delete_principal_roles(&Principal::ServiceAccount(id))
            .await
    }

    // ==================== Reconciler state ====================

    async fn get_reconciler_state(
        &mut self,
        reconciler: &ReconcilerName,
        slug: &Slug,
    ) -> Result<Option<ReconcilerStateRecord>, StorageError> {
        let row = query(
            "SELECT reconciler, team_slug, schema_version, payload, updated_at
             FROM reconciler_states WHERE reconciler = $1 AND team_slug = $2",
        )
        .bind(reconciler.as_str())
        .bind(slug.as_str())
        .fetch_optional(self.conn()?)
        .await
        .map_err(internal)?;
        row.as_ref().map(rows::reconciler_state).transpose()
    }

    async fn set_reconciler_state(
        &mut self,
        reconciler: &ReconcilerName,
        slug: &Slug,
        schema_version: u32,
        payload: &Value,
    ) -> Result<(), StorageError> {
        let schema_version = i32::try_from(schema_version)
            .map_err(|_| StorageError::invalid_input("schema version out of range"))?;
        query(
            "INSERT INTO reconciler_states (reconciler, team_slug, schema_version, payload, updated_at)
             VALUES ($1, $2, $3, $4, now())
             ON CONFLICT (reconciler, team_slug) DO UPDATE
             SET schema_version = EXCLUDED.schema_version,
                 payload = EXCLUDED.payload,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(reconciler.as_str())
        .bind(slug.as_str())
        .bind(schema_version)
        .bind(payload)
        .execute(self.conn()?)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn delete_reconciler_state(
        &mut self,
        reconciler: &ReconcilerName,
        slug: &Slug,
    ) -> Result<bool, StorageError> {
        let result = query("DELETE FROM reconciler_states WHERE reconciler = $1 AND team_slug = $2")
            .bind(reconciler.as_str())
            .bind(slug.as_str())
            .execute(self.conn()?)
            .await
            .map_err(internal)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_team_reconciler_states(&mut self, slug: &Slug) -> Result<u64, StorageError> {
        let result = query("DELETE FROM reconciler_states WHERE team_slug = $1")
            .bind(slug.as_str())
            .execute(self.conn()?)
            .await
            .map_err(internal)?;
        Ok(result.rows_affected())
    }

    async fn list_removed_team_slugs(&mut self) -> Result<Vec<Slug>, StorageError> {
        let raw: Vec<String> = query_scalar(
            "SELECT DISTINCT s.team_slug FROM reconciler_states s \
             LEFT JOIN teams t ON t.slug = s.team_slug \
             WHERE t.slug IS NULL OR t.deleted_at IS NOT NULL \
             ORDER BY s.team_slug",
        )
        .fetch_all(self.conn()?)
        .await
        .map_err(internal)?;
        raw.iter()
            .map(|s| Slug::parse(s).map_err(|e| StorageError::internal(e.to_string())))
            .collect()
    }

    // ==================== Reconcilers ====================

    async fn upsert_reconciler(
        &mut self,
        registration: &ReconcilerRegistration,
    ) -> Result<ReconcilerDescriptor, StorageError> {
        let sql = format!(
            "INSERT INTO reconcilers (name, display_name, description, run_order)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (name) DO UPDATE
             SET display_name = EXCLUDED.display_name,
                 description = EXCLUDED.description,
                 run_order = EXCLUDED.run_order
             RETURNING {RECONCILER_COLUMNS}"
        );
        let row = query(&sql)
            .bind(registration.name.as_str())
            .bind(&registration.display_name)
            .bind(&registration.description)
            .bind(registration.run_order)
            .fetch_one(self.conn()?)
            .await
            .map_err(|e| classify(e, "reconciler", registration.name.as_str()))?;
        rows::reconciler(&row)
    }

    async fn get_reconciler(
        &mut self,
        name: &ReconcilerName,
    ) -> Result<Option<ReconcilerDescriptor>, StorageError> {
        let sql = format!("SELECT {RECONCILER_COLUMNS} FROM reconcilers WHERE name = $1");
        let row = query(&sql)
            .bind(name.as_str())
            .fetch_optional(self.conn()?)
            .await
            .map_err(internal)?;
        row.as_ref().map(rows::reconciler).transpose()
    }

    async fn set_reconciler_enabled(
        &mut self,
        name: &ReconcilerName,
        enabled: bool,
    ) -> Result<ReconcilerDescriptor, StorageError> {
        let sql = format!(
            "UPDATE reconcilers SET enabled = $2 WHERE name = $1 RETURNING {RECONCILER_COLUMNS}"
        );
        let row = query(&sql)
            .bind(name.as_str())
            .bind(enabled)
            .fetch_optional(self.conn()?)
            .await
            .map_err(internal)?
            .ok_or_else(|| StorageError::not_found("reconciler", name.as_str()))?;
        rows::reconciler(&row)
    }

    async fn set_reconciler_config(
        &mut self,
        name: &ReconcilerName,
        config: &Value,
    ) -> Result<ReconcilerDescriptor, StorageError> {
        let sql = format!(
            "UPDATE reconcilers SET config = $2 WHERE name = $1 RETURNING {RECONCILER_COLUMNS}"
        );
        let row = query(&sql)
            .bind(name.as_str())
            .bind(config)
            .fetch_optional(self.conn()?)
            .await
            .map_err(internal)?
            .ok_or_else(|| StorageError::not_found("reconciler", name.as_str()))?;
        rows::reconciler(&row)
    }

    async fn list_reconcilers(&mut self) -> Result<Vec<ReconcilerDescriptor>, StorageError> {
        let sql = format!("SELECT {RECONCILER_COLUMNS} FROM reconcilers ORDER BY run_order, name");
        let found = query(&sql)
            .fetch_all(self.conn()?)
            .await
            .map_err(internal)?;
        found.iter().map(rows::reconciler).collect()
    }

    // ==================== Reconciler errors ====================

    async fn record_reconciler_error(
        &mut self,
        error: &ReconcilerError,
    ) -> Result<(), StorageError> {
        query(
            "INSERT INTO reconciler_errors (reconciler, team_slug, correlation_id, message, created_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (reconciler, team_slug) DO UPDATE
             SET correlation_id = EXCLUDED.correlation_id,
                 message = EXCLUDED.message,
                 created_at = EXCLUDED.created_at",
        )
        .bind(error.reconciler.as_str())
        .bind(error.team.as_str())
        .bind(error.correlation_id.as_uuid())
        .bind(&error.message)
        .bind(error.created_at)
        .execute(self.conn()?)
        .await
        .map_err(internal)?;
        Ok(())
    }

    async fn clear_reconciler_error(
        &mut self,
        reconciler: &ReconcilerName,
        slug: &Slug,
    ) -> Result<(), StorageError> {
        query("DELETE FROM reconciler_errors WHERE reconciler = $1 AND team_slug = $2")
            .bind(reconciler.as_str())
            .bind(slug.as_str())
            .execute(self.conn()?)
            .await
            .map_err(internal)?;
        Ok(())
    }

    async fn list_reconciler_errors(
        &mut self,
        reconciler: &ReconcilerName,
    ) -> Result<Vec<ReconcilerError>, StorageError> {
        let found = query(
            "SELECT reconciler, team_slug, correlation_id, message, created_at
             FROM reconciler_errors WHERE reconciler = $1 ORDER BY team_slug",
        )
        .bind(reconciler.as_str())
        .fetch_all(self.conn()?)
        .await
        .map_err(internal)?;
        found.iter().map(rows::reconciler_error).collect()
    }

    // ==================== Audit ====================

    async fn append_audit(&mut self, record: &AuditRecord) -> Result<(), StorageError> {
        let targets = serde_json::to_value(&record.targets)
            .map_err(|e| StorageError::internal(format!("Failed to encode audit targets: {e}")))?;
        query(
            "INSERT INTO audit_logs
             (id, created_at, component, action, correlation_id, actor, targets, message)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(record.id)
        .bind(record.created_at)
        .bind(record.component.as_str())
        .bind(record.action.as_str())
        .bind(record.correlation_id.as_uuid())
        .bind(record.actor.as_deref())
        .bind(&targets)
        .bind(&record.message)
        .execute(self.conn()?)
        .await
        .map_err(|e| classify(e, "audit", &record.id.to_string()))?;
        Ok(())
    }

    async fn audit_by_target(
        &mut self,
        target: &AuditTarget,
        limit: usize,
        offset: usize,
    ) -> Result<Page<AuditRecord>, StorageError> {
        let filter = json!([target]);

        let total: i64 = query_scalar("SELECT COUNT(*) FROM audit_logs WHERE targets @> $1")
            .bind(&filter)
            .fetch_one(self.conn()?)
            .await
            .map_err(internal)?;

        let sql = format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_logs WHERE targets @> $1
             ORDER BY seq DESC LIMIT $2 OFFSET $3"
        );
        let found = query(&sql)
            .bind(&filter)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(i64::try_from(offset).unwrap_or(i64::MAX))
            .fetch_all(self.conn()?)
            .await
            .map_err(internal)?;

        Ok(Page {
            items: found
                .iter()
                .map(rows::audit_record)
                .collect::<Result<_, _>>()?,
            total: u64::try_from(total).unwrap_or_default(),
            limit,
            offset,
        })
    }

    async fn audit_by_correlation(
        &mut self,
        correlation_id: &CorrelationId,
    ) -> Result<Vec<AuditRecord>, StorageError> {
        let sql =
            format!("SELECT {AUDIT_COLUMNS} FROM audit_logs WHERE correlation_id = $1 ORDER BY seq");
        let found = query(&sql)
            .bind(correlation_id.as_uuid())
            .fetch_all(self.conn()?)
            .await
            .map_err(internal)?;
        found.iter().map(rows::audit_record).collect()
    }

    // ==================== First run ====================

    async fn first_run(&mut self) -> Result<bool, StorageError> {
        let complete: Option<bool> =
            query_scalar("SELECT value FROM system_flags WHERE key = 'first_run_complete'")
                .fetch_optional(self.conn()?)
                .await
                .map_err(internal)?;
        Ok(!complete.unwrap_or(false))
    }

    async fn mark_first_run_complete(&mut self) -> Result<(), StorageError> {
        query(
            "INSERT INTO system_flags (key, value) VALUES ('first_run_complete', true)
             ON CONFLICT (key) DO UPDATE SET value = true",
        )
        .execute(self.conn()?)
        .await
        .map_err(internal)?;
        Ok(())
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        if self.tx.get_mut().is_some() {
            tracing::debug!("PostgresTransaction dropped without commit, rolling back");
        }
    }
}
