//! Authoritative domain model: teams, users, memberships, roles and
//! reconciler descriptors.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::CoreError;
use crate::id::{ReconcilerName, Slug, UserId};

/// A team. The slug is immutable and never reused, even after deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub slug: Slug,
    pub purpose: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack_channel: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

impl Team {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Input for creating a team.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTeam {
    pub slug: Slug,
    pub purpose: String,
    pub slack_channel: Option<String>,
}

/// Partial update of a team's mutable fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeamUpdate {
    pub purpose: Option<String>,
    /// `Some(None)` clears the channel.
    pub slack_channel: Option<Option<String>>,
}

/// A user known to the system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    /// Always stored lowercased.
    pub email: String,
    pub name: String,
    pub external_id: String,
}

/// Input for creating a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUser {
    pub email: String,
    pub name: String,
    pub external_id: String,
}

/// Role of a user within a team.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TeamRole {
    Owner,
    Member,
}

impl TeamRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeamRole::Owner => "owner",
            TeamRole::Member => "member",
        }
    }
}

impl fmt::Display for TeamRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TeamRole {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(TeamRole::Owner),
            "member" => Ok(TeamRole::Member),
            other => Err(CoreError::UnknownTeamRole(other.to_string())),
        }
    }
}

/// A team member together with their role in the team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub user: User,
    pub role: TeamRole,
}

/// Named roles. Authorization is derived from these without inheritance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoleName {
    Admin,
    ServiceAccountCreator,
    ServiceAccountOwner,
    Synchronizer,
    TeamCreator,
    TeamMember,
    TeamOwner,
    TeamViewer,
    UserAdmin,
    UserViewer,
}

/// Roles granted globally to every user imported by the user synchronizer.
pub const DEFAULT_ROLES: [RoleName; 4] = [
    RoleName::TeamCreator,
    RoleName::TeamViewer,
    RoleName::UserViewer,
    RoleName::ServiceAccountCreator,
];

impl RoleName {
    pub const ALL: [RoleName; 10] = [
        RoleName::Admin,
        RoleName::ServiceAccountCreator,
        RoleName::ServiceAccountOwner,
        RoleName::Synchronizer,
        RoleName::TeamCreator,
        RoleName::TeamMember,
        RoleName::TeamOwner,
        RoleName::TeamViewer,
        RoleName::UserAdmin,
        RoleName::UserViewer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RoleName::Admin => "admin",
            RoleName::ServiceAccountCreator => "service-account-creator",
            RoleName::ServiceAccountOwner => "service-account-owner",
            RoleName::Synchronizer => "synchronizer",
            RoleName::TeamCreator => "team-creator",
            RoleName::TeamMember => "team-member",
            RoleName::TeamOwner => "team-owner",
            RoleName::TeamViewer => "team-viewer",
            RoleName::UserAdmin => "user-admin",
            RoleName::UserViewer => "user-viewer",
        }
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleName {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RoleName::ALL
            .iter()
            .copied()
            .find(|role| role.as_str() == s)
            .ok_or_else(|| CoreError::UnknownRole(s.to_string()))
    }
}

/// The holder of a role assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "kebab-case")]
pub enum Principal {
    User(UserId),
    ServiceAccount(Uuid),
}

impl Principal {
    pub fn kind(&self) -> &'static str {
        match self {
            Principal::User(_) => "user",
            Principal::ServiceAccount(_) => "service-account",
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Principal::User(id) => *id.as_uuid(),
            Principal::ServiceAccount(id) => *id,
        }
    }

    pub fn from_parts(kind: &str, id: Uuid) -> Option<Self> {
        match kind {
            "user" => Some(Principal::User(UserId::from_uuid(id))),
            "service-account" => Some(Principal::ServiceAccount(id)),
            _ => None,
        }
    }
}

/// (principal, role, optional target team). Global when `target_team` is
/// absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleAssignment {
    pub principal: Principal,
    pub role: RoleName,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_team: Option<Slug>,
}

impl RoleAssignment {
    pub fn global(principal: Principal, role: RoleName) -> Self {
        Self {
            principal,
            role,
            target_team: None,
        }
    }

    pub fn for_team(principal: Principal, role: RoleName, team: Slug) -> Self {
        Self {
            principal,
            role,
            target_team: Some(team),
        }
    }

    pub fn is_global(&self) -> bool {
        self.target_team.is_none()
    }
}

/// A non-human principal authenticating with an API key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccount {
    pub id: Uuid,
    pub name: String,
    #[serde(skip_serializing)]
    pub api_key_hash: String,
}

/// Durable registration of a reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerDescriptor {
    pub name: ReconcilerName,
    pub display_name: String,
    pub description: String,
    pub enabled: bool,
    pub run_order: i32,
    /// Opaque, reconciler-defined configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Registration input; the enabled flag and config survive re-registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerRegistration {
    pub name: ReconcilerName,
    pub display_name: String,
    pub description: String,
    pub run_order: i32,
}

/// The last error a reconciler produced for a team.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilerError {
    pub reconciler: ReconcilerName,
    pub team: Slug,
    pub correlation_id: crate::id::CorrelationId,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_name_roundtrip() {
        for role in RoleName::ALL {
            assert_eq!(role.as_str().parse::<RoleName>().unwrap(), role);
        }
        assert!("superuser".parse::<RoleName>().is_err());
    }

    #[test]
    fn test_role_name_serde_matches_as_str() {
        for role in RoleName::ALL {
            let json = serde_json::to_string(&role).unwrap();
            assert_eq!(json, format!("\"{}\"", role.as_str()));
        }
    }

    #[test]
    fn test_principal_parts() {
        let user = Principal::User(UserId::new());
        assert_eq!(Principal::from_parts(user.kind(), user.id()), Some(user));
        assert_eq!(Principal::from_parts("robot", Uuid::new_v4()), None);
    }

    #[test]
    fn test_team_role_parse() {
        assert_eq!("owner".parse::<TeamRole>().unwrap(), TeamRole::Owner);
        assert_eq!("member".parse::<TeamRole>().unwrap(), TeamRole::Member);
        assert!("admin".parse::<TeamRole>().is_err());
    }
}
