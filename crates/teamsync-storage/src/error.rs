//! Storage error types for the authoritative store.
//!
//! Every backend maps its native failures onto [`StorageError`], and every
//! caller classifies them through [`StorageError::category`].

use std::fmt;

/// Errors that can occur during storage operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// The requested entity was not found.
    #[error("Not found: {entity}/{id}")]
    NotFound {
        /// The kind of entity that was not found.
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Attempted to create an entity that already exists.
    #[error("Already exists: {entity}/{id}")]
    AlreadyExists {
        /// The kind of entity that already exists.
        entity: String,
        /// The conflicting identifier.
        id: String,
    },

    /// The input was rejected by the store.
    #[error("Invalid input: {message}")]
    InvalidInput {
        /// Description of why the input is invalid.
        message: String,
    },

    /// A concurrent transaction made this one impossible to serialize.
    #[error("Serialization conflict: {message}")]
    SerializationConflict {
        /// Description of the conflict.
        message: String,
    },

    /// An error occurred while beginning, committing or rolling back.
    #[error("Transaction error: {message}")]
    TransactionError {
        /// Description of the transaction error.
        message: String,
    },

    /// Failed to connect to the storage backend.
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Description of the connection error.
        message: String,
    },

    /// An internal storage error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a new `AlreadyExists` error.
    #[must_use]
    pub fn already_exists(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::AlreadyExists {
            entity: entity.into(),
            id: id.into(),
        }
    }

    /// Creates a new `InvalidInput` error.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Creates a new `SerializationConflict` error.
    #[must_use]
    pub fn serialization_conflict(message: impl Into<String>) -> Self {
        Self::SerializationConflict {
            message: message.into(),
        }
    }

    /// Creates a new `TransactionError` error.
    #[must_use]
    pub fn transaction_error(message: impl Into<String>) -> Self {
        Self::TransactionError {
            message: message.into(),
        }
    }

    /// Creates a new `ConnectionError` error.
    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a not found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns `true` if this is an already exists error.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns `true` if the caller may retry the whole transaction.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    /// Returns the error category used for retry decisions and logging.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::Client,
            Self::AlreadyExists { .. } => ErrorCategory::Client,
            Self::InvalidInput { .. } => ErrorCategory::Client,
            Self::SerializationConflict { .. } => ErrorCategory::Transient,
            Self::ConnectionError { .. } => ErrorCategory::Transient,
            Self::TransactionError { .. } => ErrorCategory::Internal,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

impl From<teamsync_core::CoreError> for StorageError {
    fn from(err: teamsync_core::CoreError) -> Self {
        Self::invalid_input(err.to_string())
    }
}

/// Categories of storage errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Invalid input; rejected, never retried.
    Client,
    /// Concurrency or connectivity problem; the caller may retry.
    Transient,
    /// Anything else.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Transient => write!(f, "transient"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::not_found("team", "alpha");
        assert_eq!(err.to_string(), "Not found: team/alpha");

        let err = StorageError::already_exists("user", "a@example.com");
        assert_eq!(err.to_string(), "Already exists: user/a@example.com");
    }

    #[test]
    fn test_error_predicates() {
        let err = StorageError::not_found("team", "alpha");
        assert!(err.is_not_found());
        assert!(!err.is_already_exists());
        assert!(!err.is_transient());

        assert!(StorageError::serialization_conflict("40001").is_transient());
        assert!(StorageError::connection_error("refused").is_transient());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(
            StorageError::invalid_input("bad slug").category(),
            ErrorCategory::Client
        );
        assert_eq!(
            StorageError::serialization_conflict("retry").category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            StorageError::internal("boom").category(),
            ErrorCategory::Internal
        );
        assert_eq!(ErrorCategory::Transient.to_string(), "transient");
    }

    #[test]
    fn test_core_error_is_client_error() {
        let err: StorageError = teamsync_core::CoreError::invalid_slug("NOPE").into();
        assert_eq!(err.category(), ErrorCategory::Client);
    }
}
