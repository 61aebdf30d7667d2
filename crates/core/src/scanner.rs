//! Watches one root directory and reconciles low-level filesystem events
//! into create/update/remove notifications.
//!
//! Startup ordering matters: the watcher starts queuing events first, then a
//! full recursive listing establishes ground truth, then the listing is
//! diffed against the previously-known snapshot, and only then are the
//! queued events drained, each checked against the working cache so entries
//! already covered by the initial diff are not reported twice.

use crate::extractor;
use crate::models::{modified_millis, FileKind, FileRecord, Identifier};
use async_trait::async_trait;
use globset::GlobSet;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, trace, warn};
use walkdir::WalkDir;

/// The low-level event kinds the OS watcher can report. Delivery is
/// at-least-once with no ordering guarantee relative to a concurrent
/// listing, which is why the startup protocol above exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawEventKind {
    Created,
    Renamed,
    Removed,
    MetadataChanged,
    Cloned,
    Other,
}

#[derive(Debug, Clone)]
pub struct RawEvent {
    pub kind: RawEventKind,
    pub path: PathBuf,
}

/// High-level, reconciled change notifications produced by the scanner.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Created(Vec<FileRecord>),
    Updated(Vec<FileRecord>),
    Removed(Vec<Identifier>),
}

/// Supplies the previously-known record set used for the startup diff.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn snapshot(&self) -> anyhow::Result<Vec<FileRecord>>;
}

/// The reconciliation core: the working identifier cache plus the rules for
/// turning raw events into [`ScanEvent`]s. Mutated only on the scanner's own
/// task; kept separate from the watcher so the rules are testable.
pub struct ScannerState {
    owner: PathBuf,
    excludes: GlobSet,
    cache: HashMap<PathBuf, FileRecord>,
}

impl ScannerState {
    pub fn new(owner: impl Into<PathBuf>, excludes: GlobSet) -> Self {
        Self {
            owner: owner.into(),
            excludes,
            cache: HashMap::new(),
        }
    }

    /// Seeds the cache from a fresh listing and diffs it against the
    /// previously-known snapshot: new paths are reported created, missing
    /// paths removed. Cached entries for known paths keep the snapshot's
    /// record so row identity survives restarts.
    pub fn reconcile(
        &mut self,
        listing: Vec<FileRecord>,
        snapshot: Vec<FileRecord>,
    ) -> Vec<ScanEvent> {
        let mut known: HashMap<PathBuf, FileRecord> = snapshot
            .into_iter()
            .map(|record| (record.path.clone(), record))
            .collect();

        let mut created = Vec::new();
        for record in listing {
            match known.remove(&record.path) {
                Some(existing) => {
                    self.cache.insert(existing.path.clone(), existing);
                }
                None => {
                    self.cache.insert(record.path.clone(), record.clone());
                    created.push(record);
                }
            }
        }
        // Anything left over no longer exists on disk.
        let removed: Vec<Identifier> = known.into_values().map(|r| r.identifier()).collect();

        let mut events = Vec::new();
        if !created.is_empty() {
            events.push(ScanEvent::Created(created));
        }
        if !removed.is_empty() {
            events.push(ScanEvent::Removed(removed));
        }
        events
    }

    /// Applies one raw event against the working cache.
    pub fn handle(&mut self, event: RawEvent) -> Vec<ScanEvent> {
        let path = event.path;
        if self.is_ignored(&path) {
            return Vec::new();
        }
        match event.kind {
            RawEventKind::Created => {
                if self.cache.contains_key(&path) {
                    // Already covered by the initial diff or an earlier
                    // event; only a real content change is interesting.
                    self.refresh(&path)
                } else {
                    wrap_created(self.add_path(&path))
                }
            }
            RawEventKind::Removed => wrap_removed(self.remove_path(&path)),
            RawEventKind::Renamed => {
                // A rename notification carries only the new path; whether it
                // is an addition, a removal, or a replacement depends on what
                // is actually there now.
                if fs::symlink_metadata(&path).is_ok() {
                    if self.cache.contains_key(&path) {
                        // Rename over an existing entry is indistinguishable
                        // from delete-then-create, so report it as one.
                        let mut events = wrap_removed(self.remove_path(&path));
                        events.extend(wrap_created(self.add_path(&path)));
                        events
                    } else {
                        wrap_created(self.add_path(&path))
                    }
                } else {
                    wrap_removed(self.remove_path(&path))
                }
            }
            RawEventKind::MetadataChanged => {
                if self.cache.contains_key(&path) {
                    self.refresh(&path)
                } else {
                    // Same resolution as an inbound rename of an untracked
                    // path: treat it as a fresh add.
                    wrap_created(self.add_path(&path))
                }
            }
            RawEventKind::Cloned => Vec::new(),
            RawEventKind::Other => {
                trace!(path = %path.display(), "unhandled filesystem event");
                Vec::new()
            }
        }
    }

    fn is_ignored(&self, path: &Path) -> bool {
        if path == self.owner {
            return true;
        }
        if self.excludes.is_match(path) {
            return true;
        }
        match path.strip_prefix(&self.owner) {
            Ok(relative) => relative
                .components()
                .any(|c| c.as_os_str().to_string_lossy().starts_with('.')),
            // Not under our root at all.
            Err(_) => true,
        }
    }

    /// Adds a path to the cache; for directories the entire contents come
    /// too, since no events arrive for a moved directory's pre-existing
    /// children.
    fn add_path(&mut self, path: &Path) -> Vec<FileRecord> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(error) => {
                // The entry raced away between notification and lookup.
                debug!(path = %path.display(), %error, "attribute lookup failed, dropping event");
                return Vec::new();
            }
        };
        let mut records = vec![record_for(&self.owner, path, &metadata)];
        if metadata.is_dir() {
            records.extend(list_directory(&self.owner, path, &self.excludes));
        }
        for record in &records {
            self.cache.insert(record.path.clone(), record.clone());
        }
        records
    }

    /// Drops a path and any cached descendants, returning their identifiers.
    fn remove_path(&mut self, path: &Path) -> Vec<Identifier> {
        let doomed: Vec<PathBuf> = self
            .cache
            .keys()
            .filter(|cached| cached.starts_with(path))
            .cloned()
            .collect();
        doomed
            .into_iter()
            .filter_map(|p| self.cache.remove(&p))
            .map(|record| record.identifier())
            .collect()
    }

    /// Re-stats a tracked path, preserving its cached row uuid. No event is
    /// produced when nothing observable changed.
    fn refresh(&mut self, path: &Path) -> Vec<ScanEvent> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(error) => {
                debug!(path = %path.display(), %error, "attribute lookup failed, dropping event");
                return Vec::new();
            }
        };
        let cached = match self.cache.get(path) {
            Some(cached) => cached,
            None => return Vec::new(),
        };
        let mut record = record_for(&self.owner, path, &metadata);
        record.uuid = cached.uuid;
        if record.equivalent(cached) {
            return Vec::new();
        }
        self.cache.insert(path.to_path_buf(), record.clone());
        vec![ScanEvent::Updated(vec![record])]
    }
}

fn wrap_created(records: Vec<FileRecord>) -> Vec<ScanEvent> {
    if records.is_empty() {
        Vec::new()
    } else {
        vec![ScanEvent::Created(records)]
    }
}

fn wrap_removed(identifiers: Vec<Identifier>) -> Vec<ScanEvent> {
    if identifiers.is_empty() {
        Vec::new()
    } else {
        vec![ScanEvent::Removed(identifiers)]
    }
}

fn record_for(owner: &Path, path: &Path, metadata: &fs::Metadata) -> FileRecord {
    let modified = metadata.modified().map(modified_millis).unwrap_or_default();
    let kind = FileKind::for_path(path, metadata.is_dir());
    FileRecord::new(owner, path, kind, modified).with_tags(extractor::tags(path))
}

/// Recursively lists everything under `dir` (excluding `dir` itself),
/// skipping hidden entries and exclude-pattern matches.
pub fn list_directory(owner: &Path, dir: &Path, excludes: &GlobSet) -> Vec<FileRecord> {
    let mut records = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| should_descend(e.path(), excludes))
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                debug!(%error, "listing entry failed, skipping");
                continue;
            }
        };
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(error) => {
                debug!(path = %entry.path().display(), %error, "stat failed, skipping");
                continue;
            }
        };
        records.push(record_for(owner, entry.path(), &metadata));
    }
    records
}

fn should_descend(path: &Path, excludes: &GlobSet) -> bool {
    if excludes.is_match(path) {
        return false;
    }
    !path
        .file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.'))
        .unwrap_or(false)
}

/// Maps one backend event to the raw event model.
fn map_event(event: notify::Event) -> Vec<RawEvent> {
    use notify::event::{EventKind, ModifyKind};
    let kind = match event.kind {
        EventKind::Create(_) => RawEventKind::Created,
        EventKind::Remove(_) => RawEventKind::Removed,
        EventKind::Modify(ModifyKind::Name(_)) => RawEventKind::Renamed,
        EventKind::Modify(_) => RawEventKind::MetadataChanged,
        EventKind::Access(_) => return Vec::new(),
        EventKind::Any | EventKind::Other => RawEventKind::Other,
    };
    event
        .paths
        .into_iter()
        .map(|path| RawEvent { kind, path })
        .collect()
}

/// Owns the watcher and the serial task that processes its events for one
/// root directory.
pub struct DirectoryScanner {
    root: PathBuf,
    excludes: GlobSet,
    running: Option<Running>,
}

struct Running {
    watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl DirectoryScanner {
    pub fn new(root: impl Into<PathBuf>, excludes: GlobSet) -> Self {
        Self {
            root: root.into(),
            excludes,
            running: None,
        }
    }

    /// Begins watching, then kicks off the startup listing and diff on the
    /// scanner's own task. Reconciled events are delivered on `events` in
    /// submission order. Starting a started scanner is a debug-mode error
    /// and otherwise a no-op.
    pub fn start(
        &mut self,
        snapshot: Arc<dyn SnapshotSource>,
        events: mpsc::Sender<ScanEvent>,
    ) -> anyhow::Result<()> {
        if self.running.is_some() {
            debug_assert!(false, "scanner started twice");
            return Ok(());
        }
        let (raw_tx, raw_rx) = mpsc::channel::<RawEvent>(1024);
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                match result {
                    Ok(event) => {
                        for raw in map_event(event) {
                            // Fails only once the processing task is gone.
                            let _ = raw_tx.blocking_send(raw);
                        }
                    }
                    Err(error) => warn!(%error, "filesystem watch error"),
                }
            })?;
        watcher.watch(&self.root, RecursiveMode::Recursive)?;
        let task = tokio::spawn(run(
            self.root.clone(),
            self.excludes.clone(),
            snapshot,
            raw_rx,
            events,
        ));
        self.running = Some(Running { watcher, task });
        Ok(())
    }

    /// Stops watching and waits for the processing task to drain; once this
    /// returns no further events are delivered. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            // Dropping the watcher drops the raw sender, which ends the task.
            drop(running.watcher);
            if let Err(error) = running.task.await {
                warn!(%error, "scanner task ended abnormally");
            }
        }
    }
}

async fn run(
    root: PathBuf,
    excludes: GlobSet,
    snapshot: Arc<dyn SnapshotSource>,
    mut raw_rx: mpsc::Receiver<RawEvent>,
    events: mpsc::Sender<ScanEvent>,
) {
    // Ground-truth listing; raw events queue up in the channel meanwhile.
    let listing = {
        let root = root.clone();
        let excludes = excludes.clone();
        match task::spawn_blocking(move || list_directory(&root, &root, &excludes)).await {
            Ok(listing) => listing,
            Err(error) => {
                warn!(%error, "initial listing failed");
                return;
            }
        }
    };

    let known = match snapshot.snapshot().await {
        Ok(known) => known,
        Err(error) => {
            warn!(%error, "snapshot load failed, scanner stopping");
            return;
        }
    };

    let mut state = ScannerState::new(root, excludes);
    for event in state.reconcile(listing, known) {
        if events.send(event).await.is_err() {
            return;
        }
    }

    // Startup diff done; drain the queued and live low-level events.
    while let Some(raw) = raw_rx.recv().await {
        for event in state.handle(raw) {
            if events.send(event).await.is_err() {
                return;
            }
        }
    }
}
