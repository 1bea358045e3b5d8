// Tracing initialization from LOG_LEVEL / LOG_FORMAT, with RUST_LOG taking
// precedence when set.
use serde::Deserialize;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const LEVELS: [&str; 6] = ["trace", "debug", "info", "warn", "error", "off"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logger initialization errors. The process exits with code 2.
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log level {level:?}: {message}")]
    InvalidLevel { level: String, message: String },

    #[error("failed to install tracing subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Builds the filter for `level`, or for `RUST_LOG` if that is set.
///
/// A bare word must be a known level; anything with a target or a list of
/// directives is handed to [`EnvFilter`] as is.
pub fn build_filter(level: &str) -> Result<EnvFilter, LoggingError> {
    let directives = std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| level.to_string());

    let bare = !directives.contains(['=', ',', ':']);
    if bare && !LEVELS.contains(&directives.to_ascii_lowercase().as_str()) {
        return Err(LoggingError::InvalidLevel {
            level: directives,
            message: format!("expected one of {LEVELS:?}"),
        });
    }

    EnvFilter::try_new(&directives).map_err(|e| LoggingError::InvalidLevel {
        level: directives.clone(),
        message: e.to_string(),
    })
}

pub fn init_tracing(level: &str, format: LogFormat) -> Result<(), LoggingError> {
    let filter = build_filter(level)?;
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).try_init()?,
        LogFormat::Json => registry.with(fmt::layer().json()).try_init()?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_levels_are_accepted() {
        // RUST_LOG is not set under `cargo test` unless the caller sets it.
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        for level in LEVELS {
            assert!(build_filter(level).is_ok(), "{level}");
        }
        assert!(build_filter("INFO").is_ok());
        assert!(build_filter("info,teamsync_reconcile=debug").is_ok());
    }

    #[test]
    fn test_unknown_level_is_rejected() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        assert!(matches!(
            build_filter("verbose"),
            Err(LoggingError::InvalidLevel { .. })
        ));
    }
}
