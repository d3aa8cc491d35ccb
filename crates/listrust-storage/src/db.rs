//! List store connection

use listrust_common::config::DatabaseConfig;
use listrust_common::{Error, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

/// PostgreSQL pool behind [`crate::DbMailingListRepository`]
#[derive(Clone)]
pub struct DatabasePool(PgPool);

impl DatabasePool {
    /// Connect and bring the `mailing_lists` schema up to date
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let url = database_url(config)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(url)
            .await
            .map_err(|e| Error::Database(format!("Failed to connect to list store: {}", e)))?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| Error::Database(format!("List store migration failed: {}", e)))?;

        info!(max_connections = config.max_connections, "List store ready");

        Ok(Self(pool))
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.0
    }
}

fn database_url(config: &DatabaseConfig) -> Result<&str> {
    if config.backend != "postgres" {
        return Err(Error::Config(format!(
            "Unsupported list store backend: {}",
            config.backend
        )));
    }
    config
        .url
        .as_deref()
        .ok_or_else(|| Error::Config("database.url is required".to_string()))
}
