//! Database pool setup.

use std::str::FromStr as _;

use anyhow::Context as _;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};

pub(crate) mod pagination;

/// The database pool shared by every handler.
pub type Db = sqlx::SqlitePool;

/// Open the pool for `url`, creating the database file if needed, and apply pending migrations.
#[tracing::instrument(skip_all)]
pub async fn establish_pool(url: &str) -> anyhow::Result<Db> {
    tracing::debug!("establishing database connection pool");

    let opts = SqliteConnectOptions::from_str(url)
        .context("failed to parse database options")?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true);

    let db = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(opts)
        .await
        .with_context(|| format!("failed to connect to {url:?}"))?;

    sqlx::migrate!()
        .run(&db)
        .await
        .context("failed to apply migrations")?;

    Ok(db)
}

/// Generate a new row identifier.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A private in-memory database for unit tests. One connection keeps every query on the same database.
#[cfg(test)]
pub(crate) async fn memory_pool() -> anyhow::Result<Db> {
    let db = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .context("failed to open in-memory database")?;

    sqlx::migrate!()
        .run(&db)
        .await
        .context("failed to apply migrations")?;

    Ok(db)
}
