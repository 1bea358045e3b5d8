//! Schema migrations compiled into the binary.
//!
//! Applied versions are recorded in `_sqlx_migrations`; the migrator holds
//! an advisory lock so two processes starting together apply each version
//! once. New files go under `migrations/` and into [`SCHEMA`], oldest first.

use std::borrow::Cow;

use sqlx_core::migrate::{Migration, MigrationType, Migrator};
use sqlx_postgres::PgPool;
use tracing::{info, instrument};

use crate::error::{PostgresError, Result};

/// `(version, description, sql)` of every schema version.
const SCHEMA: &[(i64, &str, &str)] = &[(
    20250301000001,
    "teams, users, roles, reconcilers and audit log",
    include_str!("../migrations/20250301000001_initial_schema.sql"),
)];

fn migrations() -> Vec<Migration> {
    SCHEMA
        .iter()
        .map(|&(version, description, sql)| Migration {
            version,
            description: Cow::Borrowed(description),
            migration_type: MigrationType::Simple,
            sql: Cow::Borrowed(sql),
            checksum: Cow::Borrowed(&[]),
            no_tx: false,
        })
        .collect()
}

/// Brings the schema up to the latest version.
#[instrument(skip(pool))]
pub async fn run(pool: &PgPool) -> Result<()> {
    let migrator = Migrator {
        migrations: Cow::Owned(migrations()),
        ignore_missing: false,
        locking: true,
        no_tx: false,
    };
    migrator
        .run(pool)
        .await
        .map_err(|e| PostgresError::Migration(e.to_string()))?;

    info!(schema_versions = SCHEMA.len(), "Store schema is up to date");
    Ok(())
}
