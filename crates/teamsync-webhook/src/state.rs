//! What the webhook endpoint last acknowledged, and how a team differs
//! from it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use teamsync_core::{Member, Team, TeamRole};
use teamsync_storage::ReconcilerState;

/// Team as last delivered to the endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookState {
    /// Member email to team role.
    #[serde(default)]
    pub members: BTreeMap<String, TeamRole>,
    #[serde(default)]
    pub purpose: Option<String>,
    #[serde(default)]
    pub slack_channel: Option<String>,
}

impl ReconcilerState for WebhookState {
    const SCHEMA_VERSION: u32 = 1;
}

impl WebhookState {
    pub fn desired(team: &Team, members: &[Member]) -> Self {
        Self {
            members: members
                .iter()
                .map(|m| (m.user.email.clone(), m.role))
                .collect(),
            purpose: Some(team.purpose.clone()),
            slack_channel: team.slack_channel.clone(),
        }
    }

    /// Changes that turn `self` into `desired`. Team changes come first,
    /// then member changes ordered by email.
    pub fn diff(&self, desired: &WebhookState) -> Vec<Change> {
        let mut changes = Vec::new();

        if self.purpose != desired.purpose || self.slack_channel != desired.slack_channel {
            changes.push(Change::UpdateTeam {
                purpose: desired.purpose.clone(),
                slack_channel: desired.slack_channel.clone(),
            });
        }

        for (email, role) in &desired.members {
            match self.members.get(email) {
                None => changes.push(Change::AddMember {
                    email: email.clone(),
                    role: *role,
                }),
                Some(current) if current != role => changes.push(Change::UpdateMemberRole {
                    email: email.clone(),
                    role: *role,
                }),
                Some(_) => {}
            }
        }

        for email in self.members.keys() {
            if !desired.members.contains_key(email) {
                changes.push(Change::RemoveMember {
                    email: email.clone(),
                });
            }
        }

        changes
    }
}

/// One externally visible change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Change {
    #[serde(rename_all = "camelCase")]
    UpdateTeam {
        purpose: Option<String>,
        slack_channel: Option<String>,
    },
    AddMember { email: String, role: TeamRole },
    UpdateMemberRole { email: String, role: TeamRole },
    RemoveMember { email: String },
}

impl Change {
    /// Suffix of the audit action, `<reconciler>:<kind>`.
    pub fn kind(&self) -> &'static str {
        match self {
            Change::UpdateTeam { .. } => "update-team",
            Change::AddMember { .. } => "add-member",
            Change::UpdateMemberRole { .. } => "update-member-role",
            Change::RemoveMember { .. } => "remove-member",
        }
    }

    pub fn describe(&self, team: &str) -> String {
        match self {
            Change::UpdateTeam {
                purpose,
                slack_channel,
            } => format!(
                "Updated team {team}: purpose {:?}, channel {:?}",
                purpose.as_deref().unwrap_or_default(),
                slack_channel.as_deref().unwrap_or_default()
            ),
            Change::AddMember { email, role } => {
                format!("Added {email} to team {team} as {role}")
            }
            Change::UpdateMemberRole { email, role } => {
                format!("Changed role of {email} in team {team} to {role}")
            }
            Change::RemoveMember { email } => format!("Removed {email} from team {team}"),
        }
    }

    /// Email of the member this change concerns, if any.
    pub fn member(&self) -> Option<&str> {
        match self {
            Change::AddMember { email, .. }
            | Change::UpdateMemberRole { email, .. }
            | Change::RemoveMember { email } => Some(email),
            Change::UpdateTeam { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(members: &[(&str, TeamRole)], purpose: &str) -> WebhookState {
        WebhookState {
            members: members
                .iter()
                .map(|(email, role)| (email.to_string(), *role))
                .collect(),
            purpose: Some(purpose.into()),
            slack_channel: None,
        }
    }

    #[test]
    fn test_no_changes_when_equal() {
        let current = state(&[("a@example.com", TeamRole::Owner)], "ops");
        assert!(current.diff(&current.clone()).is_empty());
    }

    #[test]
    fn test_first_delivery_includes_team_and_members() {
        let desired = state(&[("a@example.com", TeamRole::Owner)], "ops");
        let changes = WebhookState::default().diff(&desired);
        assert_eq!(
            changes.iter().map(Change::kind).collect::<Vec<_>>(),
            vec!["update-team", "add-member"]
        );
    }

    #[test]
    fn test_member_changes() {
        let current = state(
            &[
                ("a@example.com", TeamRole::Member),
                ("b@example.com", TeamRole::Member),
            ],
            "ops",
        );
        let desired = state(
            &[
                ("a@example.com", TeamRole::Owner),
                ("c@example.com", TeamRole::Member),
            ],
            "ops",
        );
        assert_eq!(
            current.diff(&desired),
            vec![
                Change::UpdateMemberRole {
                    email: "a@example.com".into(),
                    role: TeamRole::Owner
                },
                Change::AddMember {
                    email: "c@example.com".into(),
                    role: TeamRole::Member
                },
                Change::RemoveMember {
                    email: "b@example.com".into()
                },
            ]
        );
    }

    #[test]
    fn test_state_ignores_unknown_fields() {
        let decoded: WebhookState = serde_json::from_value(serde_json::json!({
            "members": {"a@example.com": "owner"},
            "purpose": "ops",
            "futureField": 1
        }))
        .unwrap();
        assert_eq!(decoded.members["a@example.com"], TeamRole::Owner);
        assert!(decoded.slack_channel.is_none());
    }

    #[test]
    fn test_change_serializes_tagged() {
        let json = serde_json::to_value(Change::UpdateTeam {
            purpose: Some("ops".into()),
            slack_channel: Some("#ops".into()),
        })
        .unwrap();
        assert_eq!(json["type"], "update-team");
        assert_eq!(json["slackChannel"], "#ops");
    }
}
