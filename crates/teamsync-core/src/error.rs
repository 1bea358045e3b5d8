use thiserror::Error;

/// Core error types for teamsync identifiers and model validation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid team slug: {0}")]
    InvalidSlug(String),

    #[error("Invalid reconciler name: {0}")]
    InvalidReconcilerName(String),

    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    #[error("Invalid correlation id: {0}")]
    InvalidCorrelationId(String),

    #[error("Unknown role: {0}")]
    UnknownRole(String),

    #[error("Unknown team role: {0}")]
    UnknownTeamRole(String),
}

impl CoreError {
    /// Create a new InvalidSlug error
    pub fn invalid_slug(slug: impl Into<String>) -> Self {
        Self::InvalidSlug(slug.into())
    }

    /// Create a new InvalidReconcilerName error
    pub fn invalid_reconciler_name(name: impl Into<String>) -> Self {
        Self::InvalidReconcilerName(name.into())
    }

    /// Create a new InvalidEmail error
    pub fn invalid_email(email: impl Into<String>) -> Self {
        Self::InvalidEmail(email.into())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
