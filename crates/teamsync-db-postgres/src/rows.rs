//! Row decoding helpers.

use serde_json::Value;
use sqlx_core::row::Row;
use sqlx_postgres::PgRow;
use teamsync_core::{
    AuditAction, AuditRecord, AuditTarget, ComponentName, CorrelationId, Member, Principal,
    ReconcilerDescriptor, ReconcilerError, ReconcilerName, RoleAssignment, RoleName,
    ServiceAccount, Slug, Team, TeamRole, User, UserId,
};
use teamsync_storage::{ReconcilerStateRecord, StorageError};
use time::OffsetDateTime;
use uuid::Uuid;

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StorageError>
where
    T: sqlx_core::decode::Decode<'r, sqlx_postgres::Postgres>
        + sqlx_core::types::Type<sqlx_postgres::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StorageError::internal(format!("Failed to decode column {column}: {e}")))
}

fn slug(row: &PgRow, column: &str) -> Result<Slug, StorageError> {
    let raw: String = get(row, column)?;
    Slug::parse(&raw).map_err(|e| StorageError::internal(e.to_string()))
}

fn reconciler_name(row: &PgRow, column: &str) -> Result<ReconcilerName, StorageError> {
    let raw: String = get(row, column)?;
    ReconcilerName::parse(&raw).map_err(|e| StorageError::internal(e.to_string()))
}

pub(crate) const TEAM_COLUMNS: &str = "slug, purpose, slack_channel, created_at, deleted_at";

pub(crate) fn team(row: &PgRow) -> Result<Team, StorageError> {
    Ok(Team {
        slug: slug(row, "slug")?,
        purpose: get(row, "purpose")?,
        slack_channel: get(row, "slack_channel")?,
        created_at: get(row, "created_at")?,
        deleted_at: get(row, "deleted_at")?,
    })
}

pub(crate) const USER_COLUMNS: &str = "id, email, name, external_id";

pub(crate) fn user(row: &PgRow) -> Result<User, StorageError> {
    Ok(User {
        id: UserId::from_uuid(get(row, "id")?),
        email: get(row, "email")?,
        name: get(row, "name")?,
        external_id: get(row, "external_id")?,
    })
}

pub(crate) fn member(row: &PgRow) -> Result<Member, StorageError> {
    let role: String = get(row, "role")?;
    Ok(Member {
        user: user(row)?,
        role: role
            .parse::<TeamRole>()
            .map_err(|e| StorageError::internal(e.to_string()))?,
    })
}

pub(crate) const ROLE_COLUMNS: &str = "principal_kind, principal_id, role_name, target_team";

pub(crate) fn role_assignment(row: &PgRow) -> Result<RoleAssignment, StorageError> {
    let kind: String = get(row, "principal_kind")?;
    let id: Uuid = get(row, "principal_id")?;
    let role: String = get(row, "role_name")?;
    let target_team: Option<String> = get(row, "target_team")?;

    Ok(RoleAssignment {
        principal: Principal::from_parts(&kind, id)
            .ok_or_else(|| StorageError::internal(format!("Unknown principal kind: {kind}")))?,
        role: role
            .parse::<RoleName>()
            .map_err(|e| StorageError::internal(e.to_string()))?,
        target_team: target_team
            .map(|raw| Slug::parse(&raw))
            .transpose()
            .map_err(|e| StorageError::internal(e.to_string()))?,
    })
}

pub(crate) fn service_account(row: &PgRow) -> Result<ServiceAccount, StorageError> {
    Ok(ServiceAccount {
        id: get(row, "id")?,
        name: get(row, "name")?,
        api_key_hash: get(row, "api_key_hash")?,
    })
}

pub(crate) fn reconciler_state(row: &PgRow) -> Result<ReconcilerStateRecord, StorageError> {
    let schema_version: i32 = get(row, "schema_version")?;
    Ok(ReconcilerStateRecord {
        reconciler: reconciler_name(row, "reconciler")?,
        team: slug(row, "team_slug")?,
        schema_version: u32::try_from(schema_version)
            .map_err(|_| StorageError::internal("Negative reconciler state schema version"))?,
        payload: get(row, "payload")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub(crate) const RECONCILER_COLUMNS: &str =
    "name, display_name, description, enabled, run_order, config";

pub(crate) fn reconciler(row: &PgRow) -> Result<ReconcilerDescriptor, StorageError> {
    Ok(ReconcilerDescriptor {
        name: reconciler_name(row, "name")?,
        display_name: get(row, "display_name")?,
        description: get(row, "description")?,
        enabled: get(row, "enabled")?,
        run_order: get(row, "run_order")?,
        config: get(row, "config")?,
    })
}

pub(crate) fn reconciler_error(row: &PgRow) -> Result<ReconcilerError, StorageError> {
    let correlation_id: Uuid = get(row, "correlation_id")?;
    Ok(ReconcilerError {
        reconciler: reconciler_name(row, "reconciler")?,
        team: slug(row, "team_slug")?,
        correlation_id: CorrelationId::from_uuid(correlation_id),
        message: get(row, "message")?,
        created_at: get(row, "created_at")?,
    })
}

pub(crate) const AUDIT_COLUMNS: &str =
    "id, created_at, component, action, correlation_id, actor, targets, message";

pub(crate) fn audit_record(row: &PgRow) -> Result<AuditRecord, StorageError> {
    let component: String = get(row, "component")?;
    let action: String = get(row, "action")?;
    let correlation_id: Uuid = get(row, "correlation_id")?;
    let targets: Value = get(row, "targets")?;
    let created_at: OffsetDateTime = get(row, "created_at")?;

    Ok(AuditRecord {
        id: get(row, "id")?,
        created_at,
        component: ComponentName::new(component),
        action: AuditAction::new(action),
        correlation_id: CorrelationId::from_uuid(correlation_id),
        actor: get(row, "actor")?,
        targets: serde_json::from_value::<Vec<AuditTarget>>(targets)
            .map_err(|e| StorageError::internal(format!("Failed to decode audit targets: {e}")))?,
        message: get(row, "message")?,
    })
}
