//! Database layer
//!
//! Provides:
//! - SeaORM entity models for documents and document states
//! - Connection pool management

pub mod models;

use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::time::Duration;
use tracing::info;

/// Database connection wrapper
#[derive(Clone)]
pub struct DbPool {
    conn: DatabaseConnection,
}

impl DbPool {
    /// Create a new database pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to database...");

        let mut opts = ConnectOptions::new(&config.url);
        opts.max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .sqlx_logging(false);

        let conn = Database::connect(opts)
            .await
            .map_err(|e| AppError::StoreFatal {
                message: format!("failed to connect to database: {e}"),
            })?;

        info!("Database connection established");

        Ok(Self { conn })
    }

    /// Access the underlying connection
    pub fn conn(&self) -> &DatabaseConnection {
        &self.conn
    }

    /// Run a raw statement (schema bootstrap, collection overwrite)
    pub async fn execute_raw(&self, sql: &str) -> Result<()> {
        use sea_orm::ConnectionTrait;

        self.conn
            .execute_unprepared(sql)
            .await
            .map_err(|e| AppError::StoreFatal {
                message: format!("raw statement failed: {e}"),
            })?;
        Ok(())
    }

    /// Ping the database to check connectivity
    pub async fn ping(&self) -> Result<()> {
        use sea_orm::ConnectionTrait;

        self.conn
            .execute_unprepared("SELECT 1")
            .await
            .map_err(|e| AppError::StoreTransient {
                message: format!("ping failed: {e}"),
            })?;

        Ok(())
    }
}
