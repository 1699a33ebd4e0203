use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;

use crate::constants::EXPECTED_DB_VERSION;
use crate::error::{ProctorError, Result};
use crate::queries::{ddl, metadata};

/// Open a file-based database pool for production use
/// Enables WAL mode and foreign keys, creates the file if missing
pub async fn open_database(db_path: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;
    init_schema(&pool).await?;
    info!("[Db] SQLite database: {}", db_path.display());
    Ok(pool)
}

/// Create an in-memory database pool for testing
/// A single connection keeps every query on the same in-memory database
pub async fn open_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;
    init_schema(&pool).await?;
    Ok(pool)
}

/// Create tables (idempotent) and verify the schema version
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for sql in ddl::all_statements() {
        sqlx::query(&sql).execute(pool).await?;
    }

    let existing = sqlx::query(&metadata::select_schema_version())
        .fetch_optional(pool)
        .await?
        .map(|row| row.try_get::<String, _>("value"))
        .transpose()?;

    match existing {
        Some(version) if version != EXPECTED_DB_VERSION => Err(ProctorError::Config(format!(
            "database has unsupported schema version '{}' (expected '{}')",
            version, EXPECTED_DB_VERSION
        ))),
        Some(_) => Ok(()),
        None => {
            sqlx::query(&metadata::stamp_schema_version(EXPECTED_DB_VERSION))
                .execute(pool)
                .await?;
            Ok(())
        }
    }
}
