//! # teamsync-usersync
//!
//! Keeps the local user table in line with the upstream [`Directory`]:
//! users are created, updated and deleted to match the directory, every
//! imported user holds the default global roles, and the global admin role
//! follows membership of the admin group.
//!
//! Runs are single-flight. Triggers go through a [`UserSyncTrigger`] whose
//! channel holds at most one pending request, and the outcome of the most
//! recent runs is kept in a bounded [`RunHistory`].

mod directory;
mod error;
mod history;
pub mod metrics;
mod synchronizer;

pub use directory::{
    Directory, DirectoryError, DirectoryPage, DirectorySnapshot, DirectoryUser, GroupMember,
    MemberKind, MemberStatus, StaticDirectory,
};
pub use error::UserSyncError;
pub use history::{DEFAULT_CAPACITY, RunHistory, RunSnapshot, RunStatus, UserSyncRun};
pub use synchronizer::{
    DEFAULT_ADMIN_GROUP_PREFIX, SyncSummary, UserSyncConfig, UserSyncTrigger, UserSynchronizer,
};
