//! Persistence Layer
//!
//! Optional SQLite audit trail of finished recovery jobs, via sqlx.
//!
//! # Database Schema
//!
//! ## recovery_jobs
//! - job_id: Job identifier (primary key)
//! - trigger_source: "watchdog" or "external"
//! - status: "succeeded" or "failed"
//! - failure_reason: Optional human-readable reason
//! - started_at / finished_at: Timestamps
//! - job_json: Full serialized `RecoveryJob`

pub mod recovery_audit;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Database initialization error
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite://data/mtbridge.db")
    pub url: String,

    /// Maximum number of connections in the pool
    pub max_connections: u32,

    /// Enable query logging
    pub log_queries: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://data/mtbridge.db".to_string(),
            max_connections: 5,
            log_queries: cfg!(debug_assertions),
        }
    }
}

impl DatabaseConfig {
    pub fn with_url(url: impl Into<String>) -> Self {
        let url = url.into();
        // Every connection to an in-memory database is a separate database
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        Self {
            url,
            max_connections,
            ..Self::default()
        }
    }
}

/// Initialize the database connection pool and run migrations
pub async fn init_database(config: &DatabaseConfig) -> Result<DbPool, DatabaseError> {
    info!("Initializing audit database: {}", config.url);

    if let Some(db_path) = config.url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
                })?;
            }
        }
    }

    let mut options = SqliteConnectOptions::from_str(&config.url)?.create_if_missing(true);
    options = if config.log_queries {
        options.log_statements(tracing::log::LevelFilter::Debug)
    } else {
        options.disable_statement_logging()
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("✓ Audit database initialized");

    Ok(pool)
}

/// Run database migrations
async fn run_migrations(pool: &DbPool) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recovery_jobs (
            job_id TEXT PRIMARY KEY,
            trigger_source TEXT NOT NULL CHECK(trigger_source IN ('watchdog', 'external')),
            status TEXT NOT NULL CHECK(status IN ('succeeded', 'failed')),
            failure_reason TEXT,
            started_at DATETIME NOT NULL,
            finished_at DATETIME NOT NULL,
            job_json TEXT NOT NULL,
            created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        DatabaseError::MigrationError(format!("Failed to create recovery_jobs table: {}", e))
    })?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_recovery_jobs_started_at ON recovery_jobs(started_at)",
    )
    .execute(pool)
    .await
    .map_err(|e| DatabaseError::MigrationError(format!("Failed to create index: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_migrations() {
        let pool = init_database(&DatabaseConfig::with_url("sqlite::memory:"))
            .await
            .unwrap();

        let result: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name = 'recovery_jobs'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        assert_eq!(result.0, 1);
    }

    #[test]
    fn test_database_config() {
        assert_eq!(DatabaseConfig::default().max_connections, 5);
        assert_eq!(DatabaseConfig::with_url("sqlite::memory:").max_connections, 1);
        assert_eq!(
            DatabaseConfig::with_url("sqlite://data/audit.db").max_connections,
            5
        );
    }
}
