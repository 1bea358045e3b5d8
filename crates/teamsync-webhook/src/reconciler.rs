//! Webhook reconciler.
//!
//! Every reconcile compares the team against what the endpoint last
//! acknowledged and, if anything changed, POSTs one signed JSON event
//! carrying the full team and the list of changes. Nothing is sent when the
//! endpoint is already up to date.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use teamsync_core::{AuditAction, AuditTarget, CorrelationId, ReconcilerName, Slug, TeamRole};
use teamsync_reconcile::{
    AuditLogger, DynReconciler, FactoryContext, HINT_TENANT_DOMAIN, ReconcileError,
    ReconcileInput, Reconciler, ReconcilerFactory,
};
use teamsync_storage::{DynStore, load_state, save_state};
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::WebhookError;
use crate::state::{Change, WebhookState};

type HmacSha256 = Hmac<Sha256>;

pub const WEBHOOK_RECONCILER_NAME: &str = "webhook";

pub const SIGNATURE_HEADER: &str = "X-Signature-256";
pub const EVENT_HEADER: &str = "X-Teamsync-Event";

pub const EVENT_TEAM_RECONCILED: &str = "team.reconciled";
pub const EVENT_TEAM_DELETED: &str = "team.deleted";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Signs a payload with HMAC-SHA256 and returns the hex digest.
pub fn sign_payload(payload: &str, secret: &str) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::Config(format!("invalid signing secret: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Endpoint settings. Fields left unset fall back to the factory defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, skip_serializing)]
    pub secret: Option<String>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
}

impl WebhookConfig {
    /// Reads the config stored with the reconciler descriptor.
    pub fn from_value(value: &Value) -> Result<Self, WebhookError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|e| WebhookError::Config(format!("invalid webhook config: {e}")))
    }

    fn overridden_by(&self, other: WebhookConfig) -> Self {
        Self {
            url: other.url.or_else(|| self.url.clone()),
            secret: other.secret.or_else(|| self.secret.clone()),
            timeout: other.timeout.or(self.timeout),
        }
    }
}

/// Builds [`WebhookReconciler`]s from process-level defaults and the stored
/// descriptor config.
#[derive(Debug, Clone)]
pub struct WebhookReconcilerFactory {
    name: ReconcilerName,
    defaults: WebhookConfig,
}

impl WebhookReconcilerFactory {
    pub fn new(defaults: WebhookConfig) -> Result<Self, WebhookError> {
        let name = ReconcilerName::parse(WEBHOOK_RECONCILER_NAME)
            .map_err(|e| WebhookError::Config(e.to_string()))?;
        Ok(Self { name, defaults })
    }
}

impl ReconcilerFactory for WebhookReconcilerFactory {
    fn name(&self) -> ReconcilerName {
        self.name.clone()
    }

    fn display_name(&self) -> String {
        "Webhook".to_string()
    }

    fn description(&self) -> String {
        "Posts signed team membership events to an HTTP endpoint.".to_string()
    }

    fn build(&self, ctx: &FactoryContext) -> Result<DynReconciler, ReconcileError> {
        let config = self
            .defaults
            .overridden_by(WebhookConfig::from_value(&ctx.config)?);

        let url = config
            .url
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| WebhookError::Config("webhook url is not set".into()))?;
        let url = Url::parse(&url)
            .map_err(|e| WebhookError::Config(format!("invalid webhook url {url}: {e}")))?;

        let client = Client::builder()
            .timeout(config.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .build()
            .map_err(WebhookError::from)?;

        Ok(Arc::new(WebhookReconciler {
            name: self.name.clone(),
            client,
            url,
            secret: config.secret.filter(|s| !s.is_empty()),
            tenant_domain: ctx.hints.get(HINT_TENANT_DOMAIN).cloned(),
            store: ctx.store.clone(),
            audit: ctx.audit_logger(&self.name),
        }))
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MemberPayload<'a> {
    email: &'a str,
    role: TeamRole,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TeamEvent<'a> {
    event: &'static str,
    team: &'a str,
    purpose: &'a str,
    slack_channel: Option<&'a str>,
    members: Vec<MemberPayload<'a>>,
    changes: &'a [Change],
    correlation_id: CorrelationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_domain: Option<&'a str>,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DeletedEvent<'a> {
    event: &'static str,
    team: &'a str,
    correlation_id: CorrelationId,
    #[serde(skip_serializing_if = "Option::is_none")]
    tenant_domain: Option<&'a str>,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

/// Mirrors teams to a webhook endpoint.
pub struct WebhookReconciler {
    name: ReconcilerName,
    client: Client,
    url: Url,
    secret: Option<String>,
    tenant_domain: Option<String>,
    store: DynStore,
    audit: AuditLogger,
}

impl WebhookReconciler {
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// POSTs one event. 2xx, 409 and any status in `accepted` count as
    /// delivered.
    async fn deliver<T: Serialize + Sync>(
        &self,
        ctx: &CancellationToken,
        event: &str,
        payload: &T,
        accepted: &[StatusCode],
    ) -> Result<(), WebhookError> {
        let body = serde_json::to_string(payload)?;

        let mut request = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, "application/json")
            .header(EVENT_HEADER, event);
        if let Some(secret) = &self.secret {
            let signature = sign_payload(&body, secret)?;
            request = request.header(SIGNATURE_HEADER, format!("sha256={signature}"));
        }

        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(WebhookError::Cancelled),
            response = request.body(body).send() => response?,
        };

        let status = response.status();
        if status.is_success() || status == StatusCode::CONFLICT || accepted.contains(&status) {
            debug!(reconciler = %self.name, event, status = %status, "Webhook delivered");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(WebhookError::Status { status, body })
    }

    /// Logs and audits an event the endpoint refused for good.
    async fn reject(&self, slug: &Slug, correlation_id: CorrelationId, err: &WebhookError) {
        warn!(
            reconciler = %self.name,
            team = %slug,
            correlation_id = %correlation_id,
            error = %err,
            "Webhook endpoint rejected event"
        );
        self.audit
            .log(
                vec![AuditTarget::team(slug), AuditTarget::reconciler(&self.name)],
                self.action("rejected"),
                correlation_id,
                format!("Webhook endpoint rejected event for team {slug}: {err}"),
            )
            .await;
    }

    fn action(&self, kind: &str) -> AuditAction {
        AuditAction::new(format!("{}:{kind}", self.name))
    }
}

#[async_trait]
impl Reconciler for WebhookReconciler {
    fn name(&self) -> &ReconcilerName {
        &self.name
    }

    async fn reconcile(
        &self,
        ctx: &CancellationToken,
        input: &ReconcileInput,
    ) -> Result<(), ReconcileError> {
        let slug = input.slug().clone();
        let name = self.name.clone();
        let current: WebhookState = self
            .store
            .transaction(move |tx| {
                Box::pin(async move { load_state::<WebhookState>(tx, &name, &slug).await })
            })
            .await?
            .unwrap_or_default();

        let desired = WebhookState::desired(&input.team, &input.members);
        let changes = current.diff(&desired);
        if changes.is_empty() {
            debug!(reconciler = %self.name, team = %input.slug(), "Webhook endpoint up to date");
            return Ok(());
        }

        let event = TeamEvent {
            event: EVENT_TEAM_RECONCILED,
            team: input.slug().as_str(),
            purpose: &input.team.purpose,
            slack_channel: input.team.slack_channel.as_deref(),
            members: input
                .members
                .iter()
                .map(|m| MemberPayload {
                    email: &m.user.email,
                    role: m.role,
                })
                .collect(),
            changes: &changes,
            correlation_id: input.correlation_id,
            tenant_domain: self.tenant_domain.as_deref(),
            timestamp: OffsetDateTime::now_utc(),
        };

        match self.deliver(ctx, EVENT_TEAM_RECONCILED, &event, &[]).await {
            Ok(()) => {}
            Err(e) if e.is_rejection() => {
                self.reject(input.slug(), input.correlation_id, &e).await;
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let slug = input.slug().clone();
        let name = self.name.clone();
        self.store
            .transaction(move |tx| {
                Box::pin(async move { save_state(tx, &name, &slug, &desired).await })
            })
            .await?;

        for change in &changes {
            let mut targets = vec![AuditTarget::team(input.slug())];
            if let Some(email) = change.member() {
                targets.push(AuditTarget::user(email));
            }
            self.audit
                .log(
                    targets,
                    self.action(change.kind()),
                    input.correlation_id,
                    change.describe(input.slug().as_str()),
                )
                .await;
        }

        info!(
            reconciler = %self.name,
            team = %input.slug(),
            correlation_id = %input.correlation_id,
            changes = changes.len(),
            "Team delivered to webhook"
        );
        Ok(())
    }

    async fn delete(
        &self,
        ctx: &CancellationToken,
        slug: &Slug,
        correlation_id: CorrelationId,
    ) -> Result<(), ReconcileError> {
        let event = DeletedEvent {
            event: EVENT_TEAM_DELETED,
            team: slug.as_str(),
            correlation_id,
            tenant_domain: self.tenant_domain.as_deref(),
            timestamp: OffsetDateTime::now_utc(),
        };

        // The endpoint may have forgotten the team already.
        let gone = [StatusCode::NOT_FOUND, StatusCode::GONE];
        match self.deliver(ctx, EVENT_TEAM_DELETED, &event, &gone).await {
            Ok(()) => {
                info!(reconciler = %self.name, team = %slug, correlation_id = %correlation_id, "Team deletion delivered to webhook");
                Ok(())
            }
            Err(e) if e.is_rejection() => {
                self.reject(slug, correlation_id, &e).await;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl std::fmt::Debug for WebhookReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookReconciler")
            .field("name", &self.name)
            .field("url", &self.url.as_str())
            .field("signed", &self.secret.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_stable_hex() {
        let a = sign_payload(r#"{"test": "data"}"#, "secret123").unwrap();
        let b = sign_payload(r#"{"test": "data"}"#, "secret123").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, sign_payload(r#"{"test": "data"}"#, "other").unwrap());
    }

    #[test]
    fn test_config_override() {
        let defaults = WebhookConfig {
            url: Some("http://default".into()),
            secret: Some("s".into()),
            timeout: None,
        };
        let stored = WebhookConfig::from_value(&serde_json::json!({
            "url": "http://stored",
            "timeout": "2s"
        }))
        .unwrap();
        let merged = defaults.overridden_by(stored);
        assert_eq!(merged.url.as_deref(), Some("http://stored"));
        assert_eq!(merged.secret.as_deref(), Some("s"));
        assert_eq!(merged.timeout, Some(Duration::from_secs(2)));

        assert_eq!(
            WebhookConfig::from_value(&Value::Null).unwrap(),
            WebhookConfig::default()
        );
        assert!(WebhookConfig::from_value(&serde_json::json!({"timeout": "soon"})).is_err());
    }
}
