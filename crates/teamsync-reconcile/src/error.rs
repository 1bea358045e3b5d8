//! Reconcile error types.

use teamsync_storage::{ErrorCategory, StorageError};

/// Errors produced by reconcilers, the registry and the scheduler.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReconcileError {
    /// The external system or the store failed in a way that may succeed on
    /// retry (network, 5xx, rate limit, serialization conflict).
    #[error("Transient failure: {message}")]
    Transient { message: String },

    /// The external system rejected the request. Retrying will not help.
    #[error("Permanent failure: {message}")]
    Permanent { message: String },

    /// The worker context was cancelled mid-flight.
    #[error("Reconcile cancelled")]
    Cancelled,

    /// A non-transient store failure.
    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Unknown reconciler: {name}")]
    UnknownReconciler { name: String },

    /// A reconciler factory could not build its instance.
    #[error("Invalid reconciler configuration: {message}")]
    Config { message: String },
}

impl ReconcileError {
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    #[must_use]
    pub fn unknown_reconciler(name: impl Into<String>) -> Self {
        Self::UnknownReconciler { name: name.into() }
    }

    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Returns `true` if the scheduler should retry the team.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` for errors caused by the caller's input.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::UnknownReconciler { .. } | Self::Config { .. } => true,
            Self::Storage(e) => e.category() == ErrorCategory::Client,
            _ => false,
        }
    }
}

impl From<StorageError> for ReconcileError {
    fn from(err: StorageError) -> Self {
        match err.category() {
            ErrorCategory::Transient => Self::transient(err.to_string()),
            _ => Self::Storage(err),
        }
    }
}
