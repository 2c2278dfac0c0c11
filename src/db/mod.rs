//! Access to the relational store.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

use crate::{conf::Config, err::Result, shadow};

pub mod models;

/// The embedded schema, applied idempotently by `init_schema`.
pub const SCHEMA: &str = include_str!("schema.sql");

/// Open a pool on the SQLite database at `url`, creating the file if needed.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(std::time::Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    tracing::debug!("connected to {}", url);
    Ok(pool)
}

/// Open a pool on a private in-memory database.
///
/// The pool holds exactly one connection that never expires, otherwise the
/// database would vanish with the connection.
pub async fn connect_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Create all tables, indexes and triggers.
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// Create the schema and bring the frequency shadow in line with `config`.
pub async fn init(pool: &SqlitePool, config: &Config) -> Result<()> {
    init_schema(pool).await?;
    let changed = shadow::sync_frequency_declarations(pool, &config.frequencies).await?;
    if changed {
        tracing::info!("frequency shadow declaration changed, shadow rows recomputed");
    }
    Ok(())
}
