//! # teamsync-webhook
//!
//! A reconciler that mirrors teams to an HTTP endpoint. Events are JSON,
//! signed with HMAC-SHA256 in the `X-Signature-256` header when a secret is
//! configured:
//!
//! ```text
//! POST <url>
//! X-Teamsync-Event: team.reconciled
//! X-Signature-256: sha256=<hex>
//!
//! {"event": "team.reconciled", "team": "alpha", "members": [...], "changes": [...]}
//! ```
//!
//! The reconciler keeps a [`WebhookState`] per team with what the endpoint
//! last acknowledged and only sends when the team differs from it.

mod error;
mod reconciler;
mod state;

pub use error::WebhookError;
pub use reconciler::{
    EVENT_HEADER, EVENT_TEAM_DELETED, EVENT_TEAM_RECONCILED, SIGNATURE_HEADER,
    WEBHOOK_RECONCILER_NAME, WebhookConfig, WebhookReconciler, WebhookReconcilerFactory,
    sign_payload,
};
pub use state::{Change, WebhookState};
