//! Connection pool for the PostgreSQL store.

use std::str::FromStr;

use sqlx_core::pool::PoolOptions;
use sqlx_postgres::{PgConnectOptions, PgPool, Postgres};
use tracing::{debug, info, instrument};

use crate::config::PostgresConfig;
use crate::error::{PostgresError, Result};

/// Opens the pool every store transaction draws from.
///
/// Connections are not tested before use; a dead connection surfaces as a
/// transient error on the transaction that got it.
#[instrument(skip(config), fields(url = %mask_password(&config.url)))]
pub async fn create_pool(config: &PostgresConfig) -> Result<PgPool> {
    if config.pool_size == 0 {
        return Err(PostgresError::config("DATABASE_POOL_SIZE must be at least 1"));
    }
    let connect = PgConnectOptions::from_str(&config.url)
        .map_err(|e| PostgresError::config(format!("invalid DATABASE_URL: {e}")))?
        .application_name(&config.application_name);

    let min_idle = config.effective_min_idle();
    info!(
        pool_size = config.pool_size,
        min_idle,
        acquire_timeout = ?config.acquire_timeout,
        "Opening store connection pool"
    );

    let mut options = PoolOptions::<Postgres>::new()
        .max_connections(config.pool_size)
        .min_connections(min_idle)
        .acquire_timeout(config.acquire_timeout)
        .test_before_acquire(false);
    if let Some(idle_timeout) = config.idle_timeout {
        options = options.idle_timeout(idle_timeout);
    }

    let pool = options.connect_with(connect).await?;
    debug!("Store connection pool ready");
    Ok(pool)
}

/// Hides the password of a connection URL.
pub(crate) fn mask_password(url: &str) -> String {
    let Some(at) = url.find('@') else {
        return url.to_string();
    };
    let userinfo_start = url.find("://").map_or(0, |p| p + 3);
    match url[userinfo_start..at].find(':') {
        Some(colon) => {
            let colon = userinfo_start + colon;
            format!("{}:****{}", &url[..colon], &url[at..])
        }
        None => url.to_string(),
    }
}
