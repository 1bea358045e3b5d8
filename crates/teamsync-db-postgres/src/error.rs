//! Error types for the PostgreSQL store backend.

use sqlx_core::error::Error as SqlxError;
use teamsync_storage::StorageError;

/// PostgreSQL error code for unique violations (23505).
pub const PG_UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL error code for foreign key violations (23503).
pub const PG_FOREIGN_KEY_VIOLATION: &str = "23503";

/// PostgreSQL error code for check constraint violations (23514).
pub const PG_CHECK_VIOLATION: &str = "23514";

/// PostgreSQL error code for serialization failures (40001).
pub const PG_SERIALIZATION_FAILURE: &str = "40001";

/// PostgreSQL error code for detected deadlocks (40P01).
pub const PG_DEADLOCK_DETECTED: &str = "40P01";

/// Returns the PostgreSQL error code of a sqlx error, if any.
pub fn pg_error_code(err: &SqlxError) -> Option<String> {
    if let SqlxError::Database(db_err) = err {
        db_err.code().map(|code| code.into_owned())
    } else {
        None
    }
}

/// Maps a sqlx error onto the store's error taxonomy.
///
/// `entity` and `id` name the row being written, for conflict and missing
/// reference errors.
pub fn classify(err: SqlxError, entity: &str, id: &str) -> StorageError {
    match pg_error_code(&err).as_deref() {
        Some(PG_UNIQUE_VIOLATION) => return StorageError::already_exists(entity, id),
        Some(PG_FOREIGN_KEY_VIOLATION) => return StorageError::not_found(entity, id),
        Some(PG_CHECK_VIOLATION) => return StorageError::invalid_input(err.to_string()),
        Some(PG_SERIALIZATION_FAILURE) | Some(PG_DEADLOCK_DETECTED) => {
            return StorageError::serialization_conflict(err.to_string());
        }
        _ => {}
    }

    match err {
        SqlxError::Io(e) => StorageError::connection_error(e.to_string()),
        SqlxError::PoolTimedOut => StorageError::connection_error("connection pool timed out"),
        SqlxError::PoolClosed => StorageError::connection_error("connection pool closed"),
        other => StorageError::internal(other.to_string()),
    }
}

/// Maps a sqlx error that is not tied to a particular row.
pub fn internal(err: SqlxError) -> StorageError {
    classify(err, "row", "")
}

/// Errors specific to the PostgreSQL store backend.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database connection error.
    #[error("Database connection error: {0}")]
    Connection(#[from] sqlx_core::error::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl PostgresError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}

impl From<PostgresError> for StorageError {
    fn from(err: PostgresError) -> Self {
        match err {
            PostgresError::Connection(e) => StorageError::connection_error(e.to_string()),
            PostgresError::Migration(e) => StorageError::internal(format!("Migration error: {e}")),
            PostgresError::Config { message } => {
                StorageError::internal(format!("Configuration error: {message}"))
            }
        }
    }
}

/// Result type alias for PostgreSQL operations.
pub type Result<T> = std::result::Result<T, PostgresError>;
