use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

static DEVICE_MIGRATOR: Migrator = sqlx::migrate!("./migrations/device");
static AUTHORITY_MIGRATOR: Migrator = sqlx::migrate!("./migrations/authority");

/// Authority database pool.
pub async fn create_pool(config: &Config) -> anyhow::Result<PgPool> {
    let database_url = config.require_database_url()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await?;
    Ok(pool)
}

pub async fn migrate_authority(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    AUTHORITY_MIGRATOR.run(pool).await
}

/// Device database pool. Writes are committed with `synchronous = FULL` so a
/// returned write survives power loss.
pub async fn create_device_pool(path: impl AsRef<Path>) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full)
        .busy_timeout(Duration::from_secs(5));

    // The device store has a single writer.
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
}

/// Throwaway device database. The pool pins its only connection so the
/// database lives as long as the pool.
pub async fn create_memory_device_pool() -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
}

pub async fn migrate_device(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    DEVICE_MIGRATOR.run(pool).await
}
