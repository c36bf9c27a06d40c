//! SQLite pool construction and migrations for chunk/job metadata.

use std::str::FromStr;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::error::{Result, StoreError};

/// Open (or create) the SQLite database and run migrations.
///
/// Enables foreign key constraints at connection level.
///
/// # Errors
///
/// Returns an error if the database cannot be opened or migrations fail.
pub async fn open_pool(path: &str) -> Result<SqlitePool> {
    let url = if path == ":memory:" {
        "sqlite::memory:".to_owned()
    } else {
        format!("sqlite:{path}?mode=rwc")
    };

    let opts = SqliteConnectOptions::from_str(&url)
        .map_err(StoreError::Sqlite)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(opts)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}
