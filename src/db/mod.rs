//! SQLite connection pool bootstrap

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::config::StoreConfig;
use crate::dialect::DatabaseDriver;
use crate::store::DbPool;

/// Create a connection pool for `url` with at most `max_connections`
/// connections
pub async fn connect(url: &str, max_connections: u32) -> Result<DbPool> {
    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("Invalid database URL `{}`", url))?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options)
        .await
        .context("Failed to connect to database")?;

    tracing::info!(max_connections, "Database connected");
    Ok(pool)
}

/// Create the pool described by `config`
///
/// Only SQLite URLs can be opened; statement text for the other drivers is
/// available through their dialects.
pub async fn connect_from_config(config: &StoreConfig) -> Result<DbPool> {
    if config.driver != DatabaseDriver::Sqlite {
        bail!("Cannot open a {} pool; only sqlite is linked", config.driver);
    }
    connect(&config.database_url, config.max_connections).await
}

/// In-memory database on a single connection, so every statement sees the
/// same data
pub async fn connect_in_memory() -> Result<DbPool> {
    connect("sqlite::memory:", 1).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_pool() {
        let pool = connect_in_memory().await.unwrap();
        let (one,): (i64,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await.unwrap();
        assert_eq!(one, 1);
    }

    #[tokio::test]
    async fn test_creates_missing_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        let url = format!("sqlite://{}", path.display());

        let pool = connect(&url, 2).await.unwrap();
        sqlx::query("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_rejects_unlinked_driver() {
        let config = StoreConfig {
            driver: DatabaseDriver::Postgres,
            ..Default::default()
        };
        assert!(connect_from_config(&config).await.is_err());
    }
}
