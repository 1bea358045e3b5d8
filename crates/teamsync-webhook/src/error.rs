use reqwest::StatusCode;
use teamsync_reconcile::ReconcileError;

/// Errors from delivering a webhook.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("Webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Webhook endpoint returned {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("Failed to encode webhook payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Invalid webhook configuration: {0}")]
    Config(String),

    #[error("Webhook request cancelled")]
    Cancelled,
}

impl WebhookError {
    /// Whether retrying the same request later may succeed.
    ///
    /// Network failures, 429 and 5xx are transient. Other statuses mean the
    /// endpoint rejected the payload and will keep doing so.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(e) => !e.is_builder() && !e.is_redirect(),
            Self::Status { status, .. } => is_transient_status(*status),
            Self::Encode(_) | Self::Config(_) | Self::Cancelled => false,
        }
    }

    /// Whether the endpoint answered and refused the event for good.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Status { status, .. } if !is_transient_status(*status))
    }
}

pub(crate) fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

impl From<WebhookError> for ReconcileError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::Config(message) => ReconcileError::config(message),
            WebhookError::Cancelled => ReconcileError::Cancelled,
            err if err.is_transient() => ReconcileError::transient(err.to_string()),
            err => ReconcileError::permanent(err.to_string()),
        }
    }
}
