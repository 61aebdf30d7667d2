//! Per-root orchestration: bootstraps the store from an initial scan, then
//! streams live scanner events into it.
//!
//! Forwarding failures are logged and the event dropped; the catalogue may
//! drift from the filesystem until the next full reconciliation (typically
//! the next start), which is an accepted limitation rather than a retry.

use crate::filter::{Filter, Sort};
use crate::scanner::{self, DirectoryScanner, ScanEvent, SnapshotSource};
use crate::store::Store;
use async_trait::async_trait;
use globset::GlobSet;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::warn;

/// Loads the previously-known records for one owner out of the store.
struct OwnerSnapshot {
    store: Store,
    owner: PathBuf,
}

#[async_trait]
impl SnapshotSource for OwnerSnapshot {
    async fn snapshot(&self) -> anyhow::Result<Vec<crate::models::FileRecord>> {
        let records = self
            .store
            .files(&Filter::owner(&self.owner), Sort::DisplayNameAscending)
            .await?;
        Ok(records)
    }
}

/// Owns one scanner and keeps the store synchronized with one root.
pub struct StoreUpdater {
    store: Store,
    owner: PathBuf,
    scanner: DirectoryScanner,
    forward: Option<JoinHandle<()>>,
}

impl StoreUpdater {
    pub fn new(store: Store, owner: impl Into<PathBuf>, excludes: GlobSet) -> Self {
        let owner = owner.into();
        let scanner = DirectoryScanner::new(owner.clone(), excludes);
        Self {
            store,
            owner,
            scanner,
            forward: None,
        }
    }

    pub fn owner(&self) -> &Path {
        &self.owner
    }

    /// Starts the scanner with the store's record set as the previously-known
    /// snapshot, and forwards its events as store mutations. The scanner
    /// never blocks on store I/O; events buffer in the channel between them.
    pub fn start(&mut self) -> anyhow::Result<()> {
        let snapshot = Arc::new(OwnerSnapshot {
            store: self.store.clone(),
            owner: self.owner.clone(),
        });
        let (tx, mut rx) = mpsc::channel::<ScanEvent>(256);
        self.scanner.start(snapshot, tx)?;

        let store = self.store.clone();
        self.forward = Some(tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let result = match event {
                    ScanEvent::Created(files) => store.insert(files).await,
                    ScanEvent::Updated(files) => store.update(files).await,
                    ScanEvent::Removed(identifiers) => store.remove(identifiers).await,
                };
                if let Err(error) = result {
                    warn!(%error, "store mutation failed, dropping filesystem event");
                }
            }
        }));
        Ok(())
    }

    /// Stops the scanner and drains the forwarding task. Idempotent; no
    /// store mutations are issued after this returns.
    pub async fn stop(&mut self) {
        self.scanner.stop().await;
        if let Some(forward) = self.forward.take() {
            if let Err(error) = forward.await {
                warn!(%error, "forwarding task ended abnormally");
            }
        }
    }
}

/// Counts of changes applied by a one-shot reconciliation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub inserted: usize,
    pub removed: usize,
}

/// Performs the startup diff once, without watching: lists the root, diffs
/// against the store, and applies the difference. Used for batch indexing.
pub async fn reconcile(
    store: &Store,
    owner: &Path,
    excludes: &GlobSet,
) -> anyhow::Result<ReconcileSummary> {
    let listing = {
        let owner = owner.to_path_buf();
        let excludes = excludes.clone();
        task::spawn_blocking(move || scanner::list_directory(&owner, &owner, &excludes)).await?
    };
    let known = store
        .files(&Filter::owner(owner), Sort::DisplayNameAscending)
        .await?;

    let mut known: HashMap<PathBuf, crate::models::FileRecord> = known
        .into_iter()
        .map(|record| (record.path.clone(), record))
        .collect();
    let mut created = Vec::new();
    for record in listing {
        if known.remove(&record.path).is_none() {
            created.push(record);
        }
    }
    let removed: Vec<_> = known.into_values().map(|r| r.identifier()).collect();

    let summary = ReconcileSummary {
        inserted: created.len(),
        removed: removed.len(),
    };
    store.insert(created).await?;
    store.remove(removed).await?;
    Ok(summary)
}
