//! PostgreSQL implementation of the `Store` trait.

use async_trait::async_trait;
use sqlx_postgres::PgPool;
use teamsync_storage::{StorageError, Store, StoreTransaction};

use crate::config::PostgresConfig;
use crate::error::internal;
use crate::migrations;
use crate::pool;
use crate::transaction::PostgresTransaction;

/// PostgreSQL authoritative store.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Creates a new `PostgresStore` with the given configuration.
    ///
    /// Creates the connection pool and runs the embedded migrations if
    /// configured.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection pool cannot be created or if
    /// migrations fail.
    pub async fn new(config: PostgresConfig) -> Result<Self, StorageError> {
        let pool = pool::create_pool(&config).await?;

        if config.run_migrations {
            migrations::run(&pool).await?;
        }

        Ok(Self { pool })
    }

    /// Creates a new `PostgresStore` from an existing connection pool.
    ///
    /// Migrations are not run automatically when using this constructor.
    #[must_use]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StorageError> {
        let tx = self.pool.begin().await.map_err(internal)?;
        Ok(Box::new(PostgresTransaction::new(tx)))
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
