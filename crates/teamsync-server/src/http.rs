//! Ops HTTP endpoint: liveness, Prometheus metrics and user-sync history.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use teamsync_storage::DynStore;
use teamsync_usersync::{RunHistory, RunSnapshot};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::metrics::render_metrics;

#[derive(Clone)]
pub struct OpsState {
    pub store: DynStore,
    pub history: Arc<RunHistory>,
}

pub fn router(state: OpsState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/usersync/runs", get(usersync_runs))
        .with_state(state)
}

async fn healthz(State(state): State<OpsState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "storage": state.store.backend_name(),
    }))
}

async fn metrics() -> Response {
    match render_metrics() {
        Some(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}

async fn usersync_runs(State(state): State<OpsState>) -> Json<Vec<RunSnapshot>> {
    Json(state.history.snapshots())
}

/// Serves `router` until `ctx` is cancelled.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    ctx: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { ctx.cancelled().await })
        .await
}
