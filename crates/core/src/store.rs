//! The persistent index: a durable catalogue of files with transactional
//! mutation and observer fan-out.
//!
//! Every read and write is serialized through the single-connection pool
//! owned by the store; callers only ever interact with it from async
//! context, never from a foreground thread. Observer registration is guarded
//! by its own lock, distinct from the writer, so notification never holds up
//! mutation and vice versa.

use crate::filter::{Filter, Sort};
use crate::models::{FileKind, FileRecord, Identifier, Tag, TagSource};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The database was written by a newer build. Fatal at open time.
    #[error("unknown schema version {0}")]
    UnknownSchemaVersion(i64),
    /// A unique or foreign-key violation. The idempotent-insert contract
    /// means this indicates a programming error, not a user condition.
    #[error("constraint violation: {0}")]
    Constraint(sqlx::Error),
    #[error(transparent)]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        use sqlx::error::ErrorKind;
        let constraint = error
            .as_database_error()
            .map(|db| {
                matches!(
                    db.kind(),
                    ErrorKind::UniqueViolation
                        | ErrorKind::ForeignKeyViolation
                        | ErrorKind::CheckViolation
                        | ErrorKind::NotNullViolation
                )
            })
            .unwrap_or(false);
        if constraint {
            StoreError::Constraint(error)
        } else {
            StoreError::Database(error)
        }
    }
}

impl From<storage::StorageError> for StoreError {
    fn from(error: storage::StorageError) -> Self {
        match error {
            storage::StorageError::UnknownSchemaVersion(version) => {
                StoreError::UnknownSchemaVersion(version)
            }
            storage::StorageError::Database(error) => error.into(),
        }
    }
}

/// Receives change notifications after each committed transaction.
///
/// Callbacks fire off the store's writer, after commit; implementations
/// should hand work off quickly (typically by sending on a channel).
/// Callbacks run while the observer lock is held: calling
/// [`Store::add_observer`] or [`Store::remove_observer`] from inside a
/// callback deadlocks. Issuing store queries or mutations from a callback
/// is fine.
pub trait StoreObserver: Send + Sync + 'static {
    fn files_inserted(&self, _files: &[FileRecord]) {}
    fn files_updated(&self, _files: &[FileRecord]) {}
    fn files_removed(&self, _identifiers: &[Identifier]) {}
    fn tags_inserted(&self, _tags: &[Tag]) {}
    fn tags_removed(&self, _tags: &[Tag]) {}
}

/// Opaque registration token returned by [`Store::add_observer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObserverHandle(u64);

#[derive(Default)]
struct ObserverList {
    next_id: u64,
    entries: Vec<(u64, Arc<dyn StoreObserver>)>,
}

/// The set of changes one transaction produced, accumulated for fan-out.
#[derive(Debug, Clone, Default)]
struct Changes {
    inserted: Vec<FileRecord>,
    updated: Vec<FileRecord>,
    removed: Vec<Identifier>,
    tags_inserted: Vec<Tag>,
    tags_removed: Vec<Tag>,
}

impl Changes {
    fn is_empty(&self) -> bool {
        self.inserted.is_empty()
            && self.updated.is_empty()
            && self.removed.is_empty()
            && self.tags_inserted.is_empty()
            && self.tags_removed.is_empty()
    }
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    observers: Arc<Mutex<ObserverList>>,
}

impl Store {
    /// Opens the catalogue at `database_url`, applying any pending
    /// migrations. A database written by a newer schema is a fatal error.
    pub async fn open(database_url: &str) -> Result<Store, StoreError> {
        let pool = storage::connect(database_url).await?;
        storage::migrate(&pool).await?;
        Ok(Store {
            pool,
            observers: Arc::new(Mutex::new(ObserverList::default())),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn StoreObserver>) -> ObserverHandle {
        let mut list = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        let id = list.next_id;
        list.next_id += 1;
        list.entries.push((id, observer));
        ObserverHandle(id)
    }

    /// Deregisters an observer. Notification fan-out runs while holding the
    /// observer lock, so once this returns the observer receives no further
    /// callbacks. Removing an unknown handle is a no-op. Must not be called
    /// from inside an observer callback (see [`StoreObserver`]).
    pub fn remove_observer(&self, handle: ObserverHandle) {
        let mut list = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        list.entries.retain(|(id, _)| *id != handle.0);
    }

    /// Inserts records not already present by `(owner, path)`; duplicates are
    /// silently skipped. Tags are normalized into their own table and linked.
    /// Observers are notified once with the records actually inserted.
    pub async fn insert(&self, files: Vec<FileRecord>) -> Result<(), StoreError> {
        if files.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let mut changes = Changes::default();
        for file in files {
            let existing = sqlx::query_scalar::<_, i64>(
                "SELECT id FROM files WHERE owner = ? AND path = ?",
            )
            .bind(path_str(&file.owner))
            .bind(path_str(&file.path))
            .fetch_optional(&mut *tx)
            .await?;
            if existing.is_some() {
                continue;
            }
            let result = sqlx::query(
                "INSERT INTO files (uuid, owner, path, name, kind, modified_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(file.uuid.to_string())
            .bind(path_str(&file.owner))
            .bind(path_str(&file.path))
            .bind(&file.name)
            .bind(file.kind.as_str())
            .bind(file.modified_at)
            .execute(&mut *tx)
            .await?;
            let file_id = result.last_insert_rowid();

            if let Some(tags) = &file.tags {
                for tag in tags {
                    let (tag_id, is_new) = fetch_or_insert_tag(&mut tx, tag).await?;
                    sqlx::query(
                        "INSERT OR REPLACE INTO file_tags (file_id, tag_id) VALUES (?, ?)",
                    )
                    .bind(file_id)
                    .bind(tag_id)
                    .execute(&mut *tx)
                    .await?;
                    if is_new {
                        changes.tags_inserted.push(tag.clone());
                    }
                }
            }
            changes.inserted.push(file);
        }
        tx.commit().await?;
        self.dispatch(changes);
        Ok(())
    }

    /// Updates mutable columns of existing rows, matched by `(owner, path)`.
    /// Observers are notified with the subset that actually changed a row.
    pub async fn update(&self, files: Vec<FileRecord>) -> Result<(), StoreError> {
        if files.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let mut changes = Changes::default();
        for file in files {
            let result = sqlx::query(
                "UPDATE files SET uuid = ?, name = ?, kind = ?, modified_at = ? \
                 WHERE owner = ? AND path = ?",
            )
            .bind(file.uuid.to_string())
            .bind(&file.name)
            .bind(file.kind.as_str())
            .bind(file.modified_at)
            .bind(path_str(&file.owner))
            .bind(path_str(&file.path))
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() > 0 {
                changes.updated.push(file);
            } else {
                warn!(path = %file.path.display(), "update target not present, skipping");
            }
        }
        tx.commit().await?;
        self.dispatch(changes);
        Ok(())
    }

    /// Removes rows by identifier, pruning any tags left without
    /// associations in the same transaction.
    pub async fn remove(&self, identifiers: Vec<Identifier>) -> Result<(), StoreError> {
        if identifiers.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        let mut changes = Changes::default();
        for identifier in identifiers {
            let result = sqlx::query("DELETE FROM files WHERE owner = ? AND path = ?")
                .bind(path_str(&identifier.owner))
                .bind(path_str(&identifier.path))
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                changes.removed.push(identifier);
            }
        }
        if !changes.removed.is_empty() {
            changes.tags_removed = prune_tags(&mut tx).await?;
        }
        tx.commit().await?;
        self.dispatch(changes);
        Ok(())
    }

    /// Removes every record under `owner`. The affected set is computed
    /// first so observers receive the full list of removed identifiers.
    pub async fn remove_owner(&self, owner: &Path) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT owner, path FROM files WHERE owner = ?")
            .bind(path_str(owner))
            .fetch_all(&mut *tx)
            .await?;
        let removed: Vec<Identifier> = rows
            .iter()
            .map(|row| {
                Identifier::new(
                    row.get::<String, _>("owner"),
                    row.get::<String, _>("path"),
                )
            })
            .collect();
        sqlx::query("DELETE FROM files WHERE owner = ?")
            .bind(path_str(owner))
            .execute(&mut *tx)
            .await?;
        let mut changes = Changes {
            removed,
            ..Changes::default()
        };
        if !changes.removed.is_empty() {
            changes.tags_removed = prune_tags(&mut tx).await?;
        }
        tx.commit().await?;
        self.dispatch(changes);
        Ok(())
    }

    /// Returns the full, ordered set of records matching `filter`. Tags are
    /// not inflated; returned records carry `tags: None`.
    pub async fn files(&self, filter: &Filter, sort: Sort) -> Result<Vec<FileRecord>, StoreError> {
        let fragment = filter.to_sql();
        let sql = format!(
            "SELECT uuid, owner, path, name, kind, modified_at FROM files \
             WHERE {} ORDER BY {}",
            fragment.sql,
            sort.to_sql()
        );
        let mut query = sqlx::query(&sql);
        for binding in &fragment.bindings {
            query = query.bind(binding);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(record_from_row).collect())
    }

    /// All known tags in alphabetic order.
    pub async fn tags(&self) -> Result<Vec<Tag>, StoreError> {
        let rows = sqlx::query(
            "SELECT source, name FROM tags ORDER BY name COLLATE NOCASE ASC, source ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                let source = TagSource::from_raw(row.get::<i64, _>("source"))?;
                Some(Tag {
                    source,
                    name: row.get::<String, _>("name"),
                })
            })
            .collect())
    }

    /// Fans a committed change set out to observers. The recipient set is
    /// snapshotted here, at commit, so an observer registered afterwards
    /// never sees this transaction. The spawned task holds the observer lock
    /// while delivering, which is what lets [`Store::remove_observer`]
    /// guarantee quiescence on return; snapshotted entries that have been
    /// removed by delivery time are skipped.
    fn dispatch(&self, changes: Changes) {
        if changes.is_empty() {
            return;
        }
        let snapshot: Vec<(u64, Arc<dyn StoreObserver>)> = {
            let list = self.observers.lock().unwrap_or_else(|e| e.into_inner());
            list.entries.clone()
        };
        if snapshot.is_empty() {
            return;
        }
        let observers = Arc::clone(&self.observers);
        tokio::spawn(async move {
            let list = observers.lock().unwrap_or_else(|e| e.into_inner());
            for (id, observer) in &snapshot {
                if !list.entries.iter().any(|(live, _)| live == id) {
                    continue;
                }
                if !changes.inserted.is_empty() {
                    observer.files_inserted(&changes.inserted);
                }
                if !changes.updated.is_empty() {
                    observer.files_updated(&changes.updated);
                }
                if !changes.removed.is_empty() {
                    observer.files_removed(&changes.removed);
                }
                if !changes.tags_inserted.is_empty() {
                    observer.tags_inserted(&changes.tags_inserted);
                }
                if !changes.tags_removed.is_empty() {
                    observer.tags_removed(&changes.tags_removed);
                }
            }
        });
    }
}

async fn fetch_or_insert_tag(
    tx: &mut Transaction<'_, Sqlite>,
    tag: &Tag,
) -> Result<(i64, bool), StoreError> {
    let existing =
        sqlx::query_scalar::<_, i64>("SELECT id FROM tags WHERE source = ? AND name = ?")
            .bind(tag.source.as_raw())
            .bind(&tag.name)
            .fetch_optional(&mut **tx)
            .await?;
    if let Some(id) = existing {
        return Ok((id, false));
    }
    let result = sqlx::query("INSERT INTO tags (source, name) VALUES (?, ?)")
        .bind(tag.source.as_raw())
        .bind(&tag.name)
        .execute(&mut **tx)
        .await?;
    Ok((result.last_insert_rowid(), true))
}

/// Deletes tags that no longer have any file associations, returning the
/// pruned set for the notification.
async fn prune_tags(tx: &mut Transaction<'_, Sqlite>) -> Result<Vec<Tag>, StoreError> {
    let rows = sqlx::query(
        "SELECT source, name FROM tags \
         WHERE id NOT IN (SELECT tag_id FROM file_tags)",
    )
    .fetch_all(&mut **tx)
    .await?;
    let pruned: Vec<Tag> = rows
        .iter()
        .filter_map(|row| {
            let source = TagSource::from_raw(row.get::<i64, _>("source"))?;
            Some(Tag {
                source,
                name: row.get::<String, _>("name"),
            })
        })
        .collect();
    if pruned.is_empty() {
        return Ok(pruned);
    }
    sqlx::query("DELETE FROM tags WHERE id NOT IN (SELECT tag_id FROM file_tags)")
        .execute(&mut **tx)
        .await?;
    Ok(pruned)
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> FileRecord {
    FileRecord {
        uuid: Uuid::parse_str(&row.get::<String, _>("uuid")).unwrap_or_default(),
        owner: row.get::<String, _>("owner").into(),
        path: row.get::<String, _>("path").into(),
        name: row.get::<String, _>("name"),
        kind: FileKind::from_str_lossy(&row.get::<String, _>("kind")),
        modified_at: row.get::<i64, _>("modified_at"),
        tags: None,
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
