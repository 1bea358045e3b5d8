use std::time::Duration;

use teamsync_storage::StorageError;

use crate::directory::DirectoryError;

/// Errors that fail a user-sync run.
#[derive(Debug, thiserror::Error)]
pub enum UserSyncError {
    #[error("Directory error: {0}")]
    Directory(#[from] DirectoryError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("User sync timed out after {0:?}")]
    Timeout(Duration),

    #[error("User sync cancelled")]
    Cancelled,
}
