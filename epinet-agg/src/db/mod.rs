//! SQLite access to a tenant's funnels, raw events and content
//!
//! The aggregation service only ever reads these tables, so connections are
//! opened read-only.

use epinet_common::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use tracing::info;

mod source;

pub use source::{SqliteSource, SqliteSourceProvider};

/// Open `db_path` in read-only mode
pub async fn connect_readonly(db_path: &Path) -> Result<SqlitePool> {
    if !db_path.exists() {
        return Err(Error::NotFound(format!(
            "Database not found: {}",
            db_path.display()
        )));
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .read_only(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    info!("Opened {} read-only", db_path.display());
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_database_is_not_found() {
        let dir = TempDir::new().unwrap();
        let result = connect_readonly(&dir.path().join("absent.db")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_readonly_connection_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tenant.db");

        let writable = SqlitePool::connect_with(
            SqliteConnectOptions::new().filename(&path).create_if_missing(true),
        )
        .await
        .unwrap();
        sqlx::query("CREATE TABLE epinets (id TEXT PRIMARY KEY, title TEXT, options_payload TEXT)")
            .execute(&writable)
            .await
            .unwrap();
        writable.close().await;

        let pool = connect_readonly(&path).await.unwrap();
        let write = sqlx::query("INSERT INTO epinets (id, title) VALUES ('f1', 'x')")
            .execute(&pool)
            .await;
        assert!(write.is_err(), "write through a read-only pool must fail");
    }
}
