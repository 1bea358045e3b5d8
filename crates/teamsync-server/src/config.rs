use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use teamsync_core::{ReconcilerName, RoleName};

use crate::observability::LogFormat;

/// Configuration errors. Any of these exits the process with code 1.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// A service account provisioned at every startup.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticServiceAccount {
    pub name: String,
    pub api_key: String,
    #[serde(default)]
    pub roles: Vec<RoleName>,
}

impl std::fmt::Debug for StaticServiceAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticServiceAccount")
            .field("name", &self.name)
            .field("roles", &self.roles)
            .finish_non_exhaustive()
    }
}

/// Process configuration, read from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// `memory://` selects the in-memory store; anything else is a
    /// PostgreSQL URL.
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_pool_size")]
    pub database_pool_size: u32,
    #[serde(default)]
    pub tenant_domain: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,
    #[serde(default)]
    pub frontend_url: Option<String>,
    #[serde(default)]
    pub first_run_enable_reconcilers: Vec<String>,
    /// JSON array of `{"name", "apiKey", "roles"}`.
    #[serde(default, deserialize_with = "json_list")]
    pub static_service_accounts: Vec<StaticServiceAccount>,
    #[serde(default)]
    pub usersync_enabled: bool,
    #[serde(default = "default_admin_group_prefix")]
    pub usersync_admin_group_prefix: String,
    #[serde(default = "default_runs_to_store")]
    pub usersync_runs_to_store: usize,
    /// JSON directory snapshot served to the user synchronizer.
    #[serde(default)]
    pub usersync_directory_file: Option<PathBuf>,
    #[serde(default = "default_workers")]
    pub reconciler_workers: usize,
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub reconciler_retry_backoff: Duration,
    #[serde(default = "default_full_team_sync_interval", with = "humantime_serde")]
    pub full_team_sync_interval: Duration,
    #[serde(default = "default_user_sync_interval", with = "humantime_serde")]
    pub user_sync_interval: Duration,
    #[serde(default = "default_user_sync_timeout", with = "humantime_serde")]
    pub user_sync_timeout: Duration,
    #[serde(default)]
    pub webhook_reconciler_url: Option<String>,
    #[serde(default)]
    pub webhook_reconciler_secret: Option<String>,
}

fn default_pool_size() -> u32 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

fn default_admin_group_prefix() -> String {
    teamsync_usersync::DEFAULT_ADMIN_GROUP_PREFIX.to_string()
}

fn default_runs_to_store() -> usize {
    teamsync_usersync::DEFAULT_CAPACITY
}

fn default_workers() -> usize {
    10
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(5)
}

fn default_full_team_sync_interval() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_user_sync_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_user_sync_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Reads a JSON array out of a single string value.
fn json_list<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = String::deserialize(deserializer)?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(&raw).map_err(serde::de::Error::custom)
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(invalid("DATABASE_URL must be set"));
        }
        if self.tenant_domain.trim().is_empty() {
            return Err(invalid("TENANT_DOMAIN must be set"));
        }
        if self.database_pool_size == 0 {
            return Err(invalid("DATABASE_POOL_SIZE must be > 0"));
        }
        if self.reconciler_workers == 0 {
            return Err(invalid("RECONCILER_WORKERS must be > 0"));
        }
        if self.usersync_runs_to_store == 0 {
            return Err(invalid("USERSYNC_RUNS_TO_STORE must be > 0"));
        }
        for (name, value) in [
            ("FULL_TEAM_SYNC_INTERVAL", self.full_team_sync_interval),
            ("USER_SYNC_INTERVAL", self.user_sync_interval),
            ("USER_SYNC_TIMEOUT", self.user_sync_timeout),
        ] {
            if value.is_zero() {
                return Err(invalid(format!("{name} must be > 0")));
            }
        }
        if self.usersync_enabled && self.usersync_directory_file.is_none() {
            return Err(invalid(
                "USERSYNC_ENABLED=true requires USERSYNC_DIRECTORY_FILE",
            ));
        }
        if self.usersync_admin_group_prefix.trim().is_empty() {
            return Err(invalid("USERSYNC_ADMIN_GROUP_PREFIX must not be empty"));
        }
        if self
            .webhook_reconciler_url
            .as_deref()
            .is_some_and(|url| url.trim().is_empty())
        {
            return Err(invalid("WEBHOOK_RECONCILER_URL must not be empty when set"));
        }

        let mut seen = std::collections::HashSet::new();
        for account in &self.static_service_accounts {
            if account.name.trim().is_empty() || account.api_key.is_empty() {
                return Err(invalid(
                    "static service accounts need a name and an apiKey",
                ));
            }
            if !seen.insert(account.name.as_str()) {
                return Err(invalid(format!(
                    "static service account {} is listed twice",
                    account.name
                )));
            }
        }

        self.first_run_reconcilers()?;
        Ok(())
    }

    /// Reconcilers enabled on the very first start.
    pub fn first_run_reconcilers(&self) -> Result<Vec<ReconcilerName>, ConfigError> {
        self.first_run_enable_reconcilers
            .iter()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty())
            .map(|name| {
                ReconcilerName::parse(name).map_err(|e| {
                    invalid(format!("FIRST_RUN_ENABLE_RECONCILERS: {e}"))
                })
            })
            .collect()
    }

    pub fn uses_memory_store(&self) -> bool {
        self.database_url.starts_with("memory://")
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

pub mod loader {
    use config::{Config, Environment, Map};

    use super::{AppConfig, ConfigError};

    const LIST_KEYS: [&str; 1] = ["first_run_enable_reconcilers"];

    /// Loads configuration from the process environment.
    pub fn load_config() -> Result<AppConfig, ConfigError> {
        load_from(None)
    }

    /// Loads configuration from `source` instead of the process environment.
    pub fn load_from(source: Option<Map<String, String>>) -> Result<AppConfig, ConfigError> {
        let mut environment = Environment::default()
            .try_parsing(true)
            .list_separator(",")
            .source(source);
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }

        let cfg = Config::builder().add_source(environment).build()?;
        let merged: AppConfig = cfg.try_deserialize()?;
        merged.validate()?;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::loader::load_from;
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> config::Map<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn minimal() -> Vec<(&'static str, &'static str)> {
        vec![
            ("DATABASE_URL", "memory://"),
            ("TENANT_DOMAIN", "example.com"),
        ]
    }

    #[test]
    fn test_defaults() {
        let cfg = load_from(Some(env(&minimal()))).unwrap();
        assert!(cfg.uses_memory_store());
        assert_eq!(cfg.reconciler_workers, 10);
        assert_eq!(cfg.full_team_sync_interval, Duration::from_secs(1800));
        assert_eq!(cfg.user_sync_interval, Duration::from_secs(900));
        assert_eq!(cfg.user_sync_timeout, Duration::from_secs(30));
        assert_eq!(cfg.reconciler_retry_backoff, Duration::from_secs(5));
        assert_eq!(cfg.usersync_runs_to_store, 5);
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert!(!cfg.usersync_enabled);
        assert!(cfg.first_run_reconcilers().unwrap().is_empty());
    }

    #[test]
    fn test_parses_lists_durations_and_accounts() {
        let mut pairs = minimal();
        pairs.extend([
            ("FIRST_RUN_ENABLE_RECONCILERS", "webhook,google:workspace-admin"),
            ("FULL_TEAM_SYNC_INTERVAL", "5m"),
            ("RECONCILER_WORKERS", "3"),
            ("LOG_FORMAT", "json"),
            ("LISTEN_ADDRESS", "0.0.0.0:8080"),
            (
                "STATIC_SERVICE_ACCOUNTS",
                r#"[{"name": "ci", "apiKey": "k", "roles": ["admin", "team-viewer"]}]"#,
            ),
        ]);
        let cfg = load_from(Some(env(&pairs))).unwrap();
        let names: Vec<String> = cfg
            .first_run_reconcilers()
            .unwrap()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(names, vec!["webhook", "google:workspace-admin"]);
        assert_eq!(cfg.full_team_sync_interval, Duration::from_secs(300));
        assert_eq!(cfg.reconciler_workers, 3);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.listen_address.port(), 8080);
        assert_eq!(cfg.static_service_accounts[0].roles, vec![RoleName::Admin, RoleName::TeamViewer]);
    }

    #[test]
    fn test_rejects_missing_tenant_domain() {
        let err = load_from(Some(env(&[("DATABASE_URL", "memory://")]))).unwrap_err();
        assert!(err.to_string().contains("TENANT_DOMAIN"));
    }

    #[test]
    fn test_rejects_unknown_role() {
        let mut pairs = minimal();
        pairs.push((
            "STATIC_SERVICE_ACCOUNTS",
            r#"[{"name": "ci", "apiKey": "k", "roles": ["superuser"]}]"#,
        ));
        assert!(load_from(Some(env(&pairs))).is_err());
    }

    #[test]
    fn test_usersync_requires_directory_file() {
        let mut pairs = minimal();
        pairs.push(("USERSYNC_ENABLED", "true"));
        let err = load_from(Some(env(&pairs))).unwrap_err();
        assert!(err.to_string().contains("USERSYNC_DIRECTORY_FILE"));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let mut pairs = minimal();
        pairs.push(("USER_SYNC_INTERVAL", "0s"));
        assert!(load_from(Some(env(&pairs))).is_err());
    }

    #[test]
    fn test_service_account_debug_hides_key() {
        let account = StaticServiceAccount {
            name: "ci".into(),
            api_key: "hunter2".into(),
            roles: vec![],
        };
        assert!(!format!("{account:?}").contains("hunter2"));
    }
}
