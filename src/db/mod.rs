//! SQL storage (§3, §6 "Storage").
//!
//! A single sqlite database holds everything the daemon needs to persist:
//! key records, KeyUsers, signing conditions, requests, connection tokens,
//! policies, and the audit log. Everything else (the ACL cache, pending
//! notifications, relay status) is derived, in-memory state.

pub mod models;
pub mod key_repo;
pub mod keyuser_repo;
pub mod request_repo;
pub mod token_repo;
pub mod log_repo;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::error::Result;

/// Open (creating if absent) the sqlite database at `database_url` and run
/// pending migrations. `database_url` is either a bare file path or a
/// `sqlite:` URL; both forms are accepted the way `DATABASE_URL` is
/// documented in §6.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let opts = SqliteConnectOptions::from_str(database_url)
        .or_else(|_| SqliteConnectOptions::from_str(&format!("sqlite:{database_url}")))
        .map_err(|e| crate::error::SignetError::Config(e.to_string()))?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new().max_connections(8).connect_with(opts).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

/// Open an in-memory database for tests, with migrations applied.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_apply_cleanly() {
        let pool = connect_in_memory().await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM keys").fetch_one(&pool).await.unwrap();
        assert_eq!(row.0, 0);
    }
}
