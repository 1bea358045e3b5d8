//! Role-based authorization.
//!
//! Authorization is a pure function of the actor's role assignments and the
//! requested authorization. Roles do not inherit from each other; every
//! authorization a role grants is listed explicitly in [`authorizations_for`].

use std::fmt;

use thiserror::Error;

use crate::id::Slug;
use crate::model::{RoleAssignment, RoleName};

/// A single permission that can be checked against a role set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Authorization {
    AuditLogsRead,
    ReconcilersRead,
    ReconcilersUpdate,
    ReconcilersEnable,
    ReconcilersDisable,
    ServiceAccountsCreate,
    ServiceAccountsDelete,
    ServiceAccountsRead,
    ServiceAccountsUpdate,
    SystemStatesDelete,
    TeamsCreate,
    TeamsDelete,
    TeamsList,
    TeamsRead,
    TeamsUpdate,
    TeamsSynchronize,
    UsersList,
    UsersUpdate,
    UsersyncSynchronize,
}

impl Authorization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Authorization::AuditLogsRead => "audit_logs:read",
            Authorization::ReconcilersRead => "reconcilers:read",
            Authorization::ReconcilersUpdate => "reconcilers:update",
            Authorization::ReconcilersEnable => "reconcilers:enable",
            Authorization::ReconcilersDisable => "reconcilers:disable",
            Authorization::ServiceAccountsCreate => "service_accounts:create",
            Authorization::ServiceAccountsDelete => "service_accounts:delete",
            Authorization::ServiceAccountsRead => "service_accounts:read",
            Authorization::ServiceAccountsUpdate => "service_accounts:update",
            Authorization::SystemStatesDelete => "system_states:delete",
            Authorization::TeamsCreate => "teams:create",
            Authorization::TeamsDelete => "teams:delete",
            Authorization::TeamsList => "teams:list",
            Authorization::TeamsRead => "teams:read",
            Authorization::TeamsUpdate => "teams:update",
            Authorization::TeamsSynchronize => "teams:synchronize",
            Authorization::UsersList => "users:list",
            Authorization::UsersUpdate => "users:update",
            Authorization::UsersyncSynchronize => "usersync:synchronize",
        }
    }
}

impl fmt::Display for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authorization failures. Never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("Missing authorization: {authorization}")]
    Unauthorized { authorization: Authorization },

    #[error("Missing authorization {authorization} for team {team}")]
    UnauthorizedForTeam {
        authorization: Authorization,
        team: Slug,
    },
}

/// Authorizations granted by a role, without inheritance.
pub fn authorizations_for(role: RoleName) -> &'static [Authorization] {
    use Authorization::*;

    match role {
        RoleName::Admin => &[
            AuditLogsRead,
            ReconcilersRead,
            ReconcilersUpdate,
            ReconcilersEnable,
            ReconcilersDisable,
            ServiceAccountsCreate,
            ServiceAccountsDelete,
            ServiceAccountsRead,
            ServiceAccountsUpdate,
            SystemStatesDelete,
            TeamsCreate,
            TeamsDelete,
            TeamsList,
            TeamsRead,
            TeamsUpdate,
            TeamsSynchronize,
            UsersList,
            UsersUpdate,
            UsersyncSynchronize,
        ],
        RoleName::ServiceAccountCreator => &[ServiceAccountsCreate],
        RoleName::ServiceAccountOwner => &[
            ServiceAccountsDelete,
            ServiceAccountsRead,
            ServiceAccountsUpdate,
        ],
        RoleName::Synchronizer => &[TeamsSynchronize, UsersyncSynchronize],
        RoleName::TeamCreator => &[TeamsCreate],
        RoleName::TeamMember => &[AuditLogsRead, TeamsRead],
        RoleName::TeamOwner => &[
            AuditLogsRead,
            TeamsDelete,
            TeamsRead,
            TeamsUpdate,
            TeamsSynchronize,
        ],
        RoleName::TeamViewer => &[AuditLogsRead, TeamsList, TeamsRead],
        RoleName::UserAdmin => &[UsersList, UsersUpdate],
        RoleName::UserViewer => &[UsersList],
    }
}

/// Checks whether `roles` grant `authorization`.
///
/// Without a target team only global assignments count. With a target team,
/// global assignments and assignments scoped to that exact team count.
pub fn authorize(
    roles: &[RoleAssignment],
    authorization: Authorization,
    target_team: Option<&Slug>,
) -> Result<(), AuthzError> {
    let granted = roles.iter().any(|assignment| {
        let in_scope = match (&assignment.target_team, target_team) {
            (None, _) => true,
            (Some(scoped), Some(target)) => scoped == target,
            (Some(_), None) => false,
        };
        in_scope && authorizations_for(assignment.role).contains(&authorization)
    });

    if granted {
        return Ok(());
    }

    Err(match target_team {
        Some(team) => AuthzError::UnauthorizedForTeam {
            authorization,
            team: team.clone(),
        },
        None => AuthzError::Unauthorized { authorization },
    })
}
