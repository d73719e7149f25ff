//! SQLite connection setup and schema creation.

use crate::error::Result;
use anyhow::Context as _;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::path::Path;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS bots (
    name TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    config TEXT NOT NULL,
    started_at TEXT,
    stopped_at TEXT,
    crashed_at TEXT,
    exit_code INTEGER
);

CREATE TABLE IF NOT EXISTS schedules (
    bot_name TEXT PRIMARY KEY,
    raw_interval TEXT NOT NULL,
    interval_minutes INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    last_run TEXT
);
"#;

/// Open (creating if needed) the supervisor database at the given path.
pub async fn connect(path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Open an in-memory database. Used by tests.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .context("failed to open in-memory database")?;

    migrate(&pool).await?;
    Ok(pool)
}

async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .await
        .context("failed to create schema")?;
    Ok(())
}
