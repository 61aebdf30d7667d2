//! Storage layer: SQLite pool setup and the versioned migration runner.
//!
//! The catalogue serializes every read and write through a single connection,
//! so the pool is always opened with `max_connections(1)`.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, SqlitePool};
use std::str::FromStr;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StorageError {
    /// The database was written by a newer build and there is no migration
    /// path from it. Fatal at open time.
    #[error("unknown schema version {0} (latest known is {latest})", latest = SCHEMA_VERSION)]
    UnknownSchemaVersion(i64),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

/// Highest schema version this build understands.
pub const SCHEMA_VERSION: i64 = 2;

/// Forward-only migration steps, applied in order. Step `n` brings the
/// database from version `n - 1` to version `n`.
const MIGRATIONS: &[&str] = &[
    // 1: the files table.
    r#"
    CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY,
        uuid TEXT NOT NULL,
        owner TEXT NOT NULL,
        path TEXT NOT NULL,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        modified_at INTEGER NOT NULL
    );
    CREATE UNIQUE INDEX IF NOT EXISTS files_owner_path ON files (owner, path);
    CREATE INDEX IF NOT EXISTS files_path ON files (path);
    "#,
    // 2: tags and the files-to-tags join table.
    r#"
    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY,
        source INTEGER NOT NULL,
        name TEXT NOT NULL,
        UNIQUE (source, name)
    );
    CREATE TABLE IF NOT EXISTS file_tags (
        id INTEGER PRIMARY KEY,
        file_id INTEGER NOT NULL,
        tag_id INTEGER NOT NULL,
        UNIQUE (file_id, tag_id),
        FOREIGN KEY (file_id) REFERENCES files (id) ON DELETE CASCADE,
        FOREIGN KEY (tag_id) REFERENCES tags (id) ON DELETE CASCADE
    );
    "#,
];

/// Opens (creating if necessary) the database at `database_url`, which may be
/// a `sqlite:` URL or a plain filesystem path.
pub async fn connect(database_url: &str) -> Result<SqlitePool, StorageError> {
    let mut url = database_url.to_string();
    if !database_url.starts_with("sqlite:") {
        let path = std::path::PathBuf::from(database_url);
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let norm = path.to_string_lossy().replace('\\', "/");
        if path.is_absolute() {
            url = format!("sqlite:///{}", norm.trim_start_matches('/'));
        } else {
            url = format!("sqlite://{}", norm);
        }
    }
    let opts = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .foreign_keys(true);
    // One connection: the pool is the store's logical writer.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(opts)
        .await?;
    Ok(pool)
}

/// Applies every missing migration step inside one transaction.
///
/// A stored version newer than [`SCHEMA_VERSION`] has no migration path and
/// fails with [`StorageError::UnknownSchemaVersion`].
pub async fn migrate(pool: &SqlitePool) -> Result<(), StorageError> {
    let mut tx = pool.begin().await?;
    let current: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(&mut *tx)
        .await?;
    if current > SCHEMA_VERSION {
        return Err(StorageError::UnknownSchemaVersion(current));
    }
    if current == SCHEMA_VERSION {
        return Ok(());
    }
    for version in (current + 1)..=SCHEMA_VERSION {
        info!(version, "migrating schema");
        let step = MIGRATIONS[(version - 1) as usize];
        (&mut *tx).execute(step).await?;
        (&mut *tx)
            .execute(format!("PRAGMA user_version = {version}").as_str())
            .await?;
    }
    tx.commit().await?;
    Ok(())
}
