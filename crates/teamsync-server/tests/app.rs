//! End-to-end startup against the in-memory store, driven through the ops
//! endpoint.

use std::io::Write;
use std::time::Duration;

use serde_json::Value;
use teamsync_core::ReconcilerName;
use teamsync_server::app::App;
use teamsync_server::config::loader::load_from;
use teamsync_server::{AppConfig, metrics};
use teamsync_storage::StorageError;
use teamsync_usersync::RunStatus;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Test Infrastructure
// =============================================================================

const DIRECTORY: &str = r#"{
    "users": [
        {"id": "g-1", "primaryEmail": "alice@example.com", "name": "Alice"},
        {"id": "g-2", "primaryEmail": "bob@example.com", "name": "Bob"},
        {"id": "g-3", "primaryEmail": "carol@other.org", "name": "Carol"}
    ],
    "groups": {
        "teamsync-admins@example.com": [
            {"id": "g-1", "email": "alice@example.com", "type": "USER", "status": "ACTIVE"}
        ]
    }
}"#;

fn directory_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(DIRECTORY.as_bytes()).unwrap();
    file
}

fn config(extra: &[(&str, &str)]) -> AppConfig {
    let mut pairs: Vec<(String, String)> = vec![
        ("DATABASE_URL".into(), "memory://".into()),
        ("TENANT_DOMAIN".into(), "example.com".into()),
        ("LISTEN_ADDRESS".into(), "127.0.0.1:0".into()),
    ];
    pairs.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    load_from(Some(pairs.into_iter().collect())).unwrap()
}

async fn get_json(app: &App, path: &str) -> (u16, Value) {
    let url = format!("http://{}{}", app.local_addr(), path);
    let response = reqwest::get(url).await.unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

async fn wait_for_run(app: &App) -> RunStatus {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(run) = app.history().runs().first()
                && run.status() != RunStatus::InProgress
            {
                return run.status();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("user sync did not finish in time")
}

// =============================================================================
// Startup and shutdown
// =============================================================================

#[tokio::test]
async fn test_starts_and_stops_on_cancel() {
    let ctx = CancellationToken::new();
    let app = App::start(config(&[]), ctx.clone()).await.unwrap();

    let (status, body) = get_json(&app, "/healthz").await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["storage"], app.store().backend_name());
    assert!(app.user_sync().is_none());

    ctx.cancel();
    tokio::time::timeout(Duration::from_secs(5), app.wait())
        .await
        .expect("shutdown in time")
        .unwrap();
}

#[tokio::test]
async fn test_scheduler_closes_on_shutdown() {
    let ctx = CancellationToken::new();
    let app = App::start(config(&[]), ctx.clone()).await.unwrap();
    let scheduler = app.scheduler().clone();
    assert!(!scheduler.is_closed());

    ctx.cancel();
    app.wait().await.unwrap();
    assert!(scheduler.is_closed());
}

#[tokio::test]
async fn test_first_run_enables_webhook_reconciler() {
    let ctx = CancellationToken::new();
    let app = App::start(
        config(&[
            ("WEBHOOK_RECONCILER_URL", "http://127.0.0.1:9/hooks"),
            ("FIRST_RUN_ENABLE_RECONCILERS", "webhook"),
        ]),
        ctx.clone(),
    )
    .await
    .unwrap();

    let reconcilers = app.store().list_reconcilers().await.unwrap();
    let webhook = reconcilers
        .iter()
        .find(|r| r.name == ReconcilerName::parse("webhook").unwrap())
        .expect("webhook reconciler registered");
    assert!(webhook.enabled);

    ctx.cancel();
    app.wait().await.unwrap();
}

#[tokio::test]
async fn test_unknown_first_run_reconciler_fails_startup() {
    let result = App::start(
        config(&[("FIRST_RUN_ENABLE_RECONCILERS", "webhook")]),
        CancellationToken::new(),
    )
    .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_missing_directory_file_fails_startup() {
    let result = App::start(
        config(&[
            ("USERSYNC_ENABLED", "true"),
            ("USERSYNC_DIRECTORY_FILE", "/nonexistent/teamsync/directory.json"),
        ]),
        CancellationToken::new(),
    )
    .await;
    assert!(result.is_err());
}

// =============================================================================
// User sync
// =============================================================================

#[tokio::test]
async fn test_user_sync_runs_on_start() {
    let file = directory_file();
    let path = file.path().to_string_lossy().into_owned();
    let ctx = CancellationToken::new();
    let app = App::start(
        config(&[
            ("USERSYNC_ENABLED", "true"),
            ("USERSYNC_DIRECTORY_FILE", path.as_str()),
        ]),
        ctx.clone(),
    )
    .await
    .unwrap();

    assert_eq!(wait_for_run(&app).await, RunStatus::Success);

    let users = app
        .store()
        .transaction(|tx| Box::pin(async move { Ok::<_, StorageError>(tx.list_users().await?) }))
        .await
        .unwrap();
    let mut emails: Vec<&str> = users.iter().map(|u| u.email.as_str()).collect();
    emails.sort();
    assert_eq!(emails, vec!["alice@example.com", "bob@example.com"]);

    let (status, body) = get_json(&app, "/usersync/runs").await;
    assert_eq!(status, 200);
    assert_eq!(body[0]["status"], "success");

    ctx.cancel();
    app.wait().await.unwrap();
}

#[tokio::test]
async fn test_metrics_endpoint() {
    metrics::init_metrics();
    let ctx = CancellationToken::new();
    let app = App::start(config(&[]), ctx.clone()).await.unwrap();

    let url = format!("http://{}/metrics", app.local_addr());
    let response = reqwest::get(url).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);

    ctx.cancel();
    app.wait().await.unwrap();
}
