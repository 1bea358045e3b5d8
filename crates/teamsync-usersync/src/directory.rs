//! Upstream user directory.
//!
//! The synchronizer only needs two paged reads: the users of a domain and
//! the members of a group. [`StaticDirectory`] serves both from an in-memory
//! snapshot, optionally loaded from a JSON file.

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Errors returned by a [`Directory`].
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// The requested group or domain does not exist.
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Directory unavailable: {message}")]
    Unavailable { message: String },

    #[error("Invalid page token: {token}")]
    InvalidPageToken { token: String },

    #[error("Directory request cancelled")]
    Cancelled,

    #[error("Failed to read directory snapshot: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse directory snapshot: {0}")]
    Parse(#[from] serde_json::Error),
}

impl DirectoryError {
    #[must_use]
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// A user as the directory reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryUser {
    /// Directory-side identifier, stored as the user's external id.
    pub id: String,
    pub primary_email: String,
    pub name: String,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl DirectoryUser {
    pub fn is_active(&self) -> bool {
        !self.suspended && !self.deleted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberKind {
    User,
    Group,
    Customer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MemberStatus {
    Active,
    Suspended,
}

/// A member of a directory group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    /// Directory id of the member; for users, their external id.
    pub id: String,
    pub email: String,
    #[serde(rename = "type")]
    pub kind: MemberKind,
    pub status: MemberStatus,
}

impl GroupMember {
    pub fn is_active_user(&self) -> bool {
        self.kind == MemberKind::User && self.status == MemberStatus::Active
    }
}

/// One page of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryPage<T> {
    pub items: Vec<T>,
    pub next_page_token: Option<String>,
}

/// Paged, read-only access to the upstream directory.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Lists active, non-deleted users whose primary email is in `domain`.
    async fn list_users(
        &self,
        ctx: &CancellationToken,
        domain: &str,
        page_token: Option<&str>,
    ) -> Result<DirectoryPage<DirectoryUser>, DirectoryError>;

    /// Lists the direct members of a group.
    ///
    /// Returns [`DirectoryError::NotFound`] if the group does not exist.
    async fn list_group_members(
        &self,
        ctx: &CancellationToken,
        group_email: &str,
        page_token: Option<&str>,
    ) -> Result<DirectoryPage<GroupMember>, DirectoryError>;
}

/// Directory contents loaded from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySnapshot {
    #[serde(default)]
    pub users: Vec<DirectoryUser>,
    /// Group email to its members.
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<GroupMember>>,
}

/// In-memory directory serving a fixed snapshot.
#[derive(Debug, Clone)]
pub struct StaticDirectory {
    snapshot: DirectorySnapshot,
    page_size: usize,
}

const DEFAULT_PAGE_SIZE: usize = 100;

impl StaticDirectory {
    pub fn new(snapshot: DirectorySnapshot) -> Self {
        Self {
            snapshot,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Sets the number of items per page. Zero is treated as one.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Loads a snapshot from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(Self::new(serde_json::from_str(&raw)?))
    }

    fn page<T: Clone>(
        &self,
        items: Vec<&T>,
        page_token: Option<&str>,
    ) -> Result<DirectoryPage<T>, DirectoryError> {
        let start = match page_token {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .ok()
                .filter(|offset| *offset <= items.len())
                .ok_or_else(|| DirectoryError::InvalidPageToken {
                    token: token.to_string(),
                })?,
        };
        let end = (start + self.page_size).min(items.len());
        Ok(DirectoryPage {
            items: items[start..end].iter().map(|item| (*item).clone()).collect(),
            next_page_token: (end < items.len()).then(|| end.to_string()),
        })
    }
}

fn in_domain(email: &str, domain: &str) -> bool {
    email
        .rsplit_once('@')
        .is_some_and(|(_, d)| d.eq_ignore_ascii_case(domain))
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn list_users(
        &self,
        ctx: &CancellationToken,
        domain: &str,
        page_token: Option<&str>,
    ) -> Result<DirectoryPage<DirectoryUser>, DirectoryError> {
        if ctx.is_cancelled() {
            return Err(DirectoryError::Cancelled);
        }
        let users: Vec<&DirectoryUser> = self
            .snapshot
            .users
            .iter()
            .filter(|user| user.is_active() && in_domain(&user.primary_email, domain))
            .collect();
        self.page(users, page_token)
    }

    async fn list_group_members(
        &self,
        ctx: &CancellationToken,
        group_email: &str,
        page_token: Option<&str>,
    ) -> Result<DirectoryPage<GroupMember>, DirectoryError> {
        if ctx.is_cancelled() {
            return Err(DirectoryError::Cancelled);
        }
        let members = self
            .snapshot
            .groups
            .iter()
            .find(|(email, _)| email.eq_ignore_ascii_case(group_email))
            .map(|(_, members)| members)
            .ok_or_else(|| DirectoryError::not_found(format!("group {group_email}")))?;
        self.page(members.iter().collect(), page_token)
    }
}
