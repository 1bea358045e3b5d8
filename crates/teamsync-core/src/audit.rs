//! Audit record model.
//!
//! Audit records are append-only. Each record is attributed to a component,
//! a correlation id and a set of typed targets.

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::id::{CorrelationId, ReconcilerName, Slug, UserId};

/// Kind of entity an audit record refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    Team,
    User,
    Reconciler,
    System,
    ServiceAccount,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Team => "team",
            TargetKind::User => "user",
            TargetKind::Reconciler => "reconciler",
            TargetKind::System => "system",
            TargetKind::ServiceAccount => "service-account",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "team" => Some(TargetKind::Team),
            "user" => Some(TargetKind::User),
            "reconciler" => Some(TargetKind::Reconciler),
            "system" => Some(TargetKind::System),
            "service-account" => Some(TargetKind::ServiceAccount),
            _ => None,
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed audit target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditTarget {
    pub kind: TargetKind,
    pub identifier: String,
}

impl AuditTarget {
    pub fn team(slug: &Slug) -> Self {
        Self {
            kind: TargetKind::Team,
            identifier: slug.to_string(),
        }
    }

    /// Users are targeted by email, which is what operators search for.
    pub fn user(email: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::User,
            identifier: email.into(),
        }
    }

    pub fn user_id(id: &UserId) -> Self {
        Self {
            kind: TargetKind::User,
            identifier: id.to_string(),
        }
    }

    pub fn reconciler(name: &ReconcilerName) -> Self {
        Self {
            kind: TargetKind::Reconciler,
            identifier: name.to_string(),
        }
    }

    pub fn system() -> Self {
        Self {
            kind: TargetKind::System,
            identifier: "system".to_string(),
        }
    }

    pub fn service_account(name: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::ServiceAccount,
            identifier: name.into(),
        }
    }
}

/// Stable action code of an audit record, e.g. `usersync:delete`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditAction(Cow<'static, str>);

impl AuditAction {
    pub const USERSYNC_CREATE: AuditAction = AuditAction::from_static("usersync:create");
    pub const USERSYNC_UPDATE: AuditAction = AuditAction::from_static("usersync:update");
    pub const USERSYNC_DELETE: AuditAction = AuditAction::from_static("usersync:delete");
    pub const USERSYNC_ASSIGN_ADMIN: AuditAction =
        AuditAction::from_static("usersync:assign-admin-role");
    pub const USERSYNC_REVOKE_ADMIN: AuditAction =
        AuditAction::from_static("usersync:revoke-admin-role");
    pub const RECONCILER_ERROR: AuditAction = AuditAction::from_static("reconciler:error");
    pub const RECONCILER_ENABLE: AuditAction = AuditAction::from_static("reconciler:enable");
    pub const RECONCILER_DISABLE: AuditAction = AuditAction::from_static("reconciler:disable");
    pub const RECONCILER_CONFIGURE: AuditAction =
        AuditAction::from_static("reconciler:configure");
    pub const RECONCILER_DELETE_TEAM: AuditAction =
        AuditAction::from_static("reconciler:delete-team");
    pub const SERVICE_ACCOUNT_PROVISION: AuditAction =
        AuditAction::from_static("service-account:provision");

    pub const fn from_static(code: &'static str) -> Self {
        Self(Cow::Borrowed(code))
    }

    /// Reconciler-specific action codes, e.g. `webhook:add-member`.
    pub fn new(code: impl Into<String>) -> Self {
        Self(Cow::Owned(code.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of the component an audit logger is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentName(Cow<'static, str>);

impl ComponentName {
    pub const USERSYNC: ComponentName = ComponentName::from_static("usersync");
    pub const TEAM_SYNC: ComponentName = ComponentName::from_static("team-sync");
    pub const BOOTSTRAP: ComponentName = ComponentName::from_static("bootstrap");

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&ReconcilerName> for ComponentName {
    fn from(name: &ReconcilerName) -> Self {
        Self::new(name.as_str())
    }
}

impl fmt::Display for ComponentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An append-only audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub component: ComponentName,
    pub action: AuditAction,
    pub correlation_id: CorrelationId,
    /// Email or service-account name of the acting principal, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    pub targets: Vec<AuditTarget>,
    pub message: String,
}

impl AuditRecord {
    pub fn new(
        component: ComponentName,
        action: AuditAction,
        correlation_id: CorrelationId,
        targets: Vec<AuditTarget>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: OffsetDateTime::now_utc(),
            component,
            action,
            correlation_id,
            actor: None,
            targets,
            message: message.into(),
        }
    }

    pub fn has_target(&self, target: &AuditTarget) -> bool {
        self.targets.iter().any(|t| t == target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_constants_are_borrowed() {
        assert_eq!(AuditAction::USERSYNC_DELETE.as_str(), "usersync:delete");
        assert_eq!(
            AuditAction::new("webhook:add-member"),
            AuditAction::from_static("webhook:add-member")
        );
    }

    #[test]
    fn test_target_kind_parse() {
        for kind in [
            TargetKind::Team,
            TargetKind::User,
            TargetKind::Reconciler,
            TargetKind::System,
            TargetKind::ServiceAccount,
        ] {
            assert_eq!(TargetKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TargetKind::parse("galaxy"), None);
    }

    #[test]
    fn test_record_has_target() {
        let slug = Slug::parse("alpha").unwrap();
        let record = AuditRecord::new(
            ComponentName::TEAM_SYNC,
            AuditAction::RECONCILER_ERROR,
            CorrelationId::new(),
            vec![AuditTarget::team(&slug)],
            "boom",
        );
        assert!(record.has_target(&AuditTarget::team(&slug)));
        assert!(!record.has_target(&AuditTarget::system()));
    }
}
