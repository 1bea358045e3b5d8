use std::process::ExitCode;

use teamsync_server::config::loader::load_config;
use teamsync_server::{app, metrics, observability, shutdown};
use tokio_util::sync::CancellationToken;

/// Configuration could not be loaded or failed validation.
const EXIT_CONFIG: u8 = 1;
/// The logger could not be initialized.
const EXIT_LOGGING: u8 = 2;
/// A fatal error at startup or while running.
const EXIT_RUNTIME: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (before anything else)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist - it's optional
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {e}");
        }
    }

    let cfg = match load_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if let Err(e) = observability::init_tracing(&cfg.log_level, cfg.log_format) {
        eprintln!("Logger initialization failed: {e}");
        return ExitCode::from(EXIT_LOGGING);
    }

    metrics::init_metrics();

    let root = CancellationToken::new();
    shutdown::cancel_on_signal(root.clone());

    match app::run(cfg, root).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "teamsync stopped with a fatal error");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}
