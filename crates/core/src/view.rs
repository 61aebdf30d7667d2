//! A live, sorted materialization of the records matching a filter.
//!
//! The view registers as a store observer before running its initial query
//! so no insert is missed; an event for a record the query already returned
//! is deduplicated against the snapshot. Incremental changes are delivered
//! as fine-grained per-entry events with explicit indices, or, once a batch
//! reaches the threshold, as a single replace-all, since many per-entry
//! notifications cost a consumer more than one full refresh.

use crate::filter::{Filter, Sort};
use crate::models::{FileRecord, Identifier};
use crate::store::{ObserverHandle, Store, StoreObserver};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

pub const DEFAULT_THRESHOLD: usize = 10;

/// The notification surface consumers see.
///
/// Fine-grained events carry the index the mutation applies at, valid
/// against the consumer's list state after every preceding event has been
/// applied in order.
#[derive(Debug, Clone)]
pub enum ViewEvent {
    /// Replace the entire list.
    Reset(Vec<FileRecord>),
    Inserted { file: FileRecord, index: usize },
    Updated { file: FileRecord, index: usize },
    Removed { identifier: Identifier, index: usize },
}

enum Notice {
    Inserted(Vec<FileRecord>),
    Updated(Vec<FileRecord>),
    Removed(Vec<Identifier>),
}

/// Store observer that hands notifications straight to the view's task.
/// The channel is unbounded so the store's fan-out never blocks here.
struct Forwarder {
    tx: mpsc::UnboundedSender<Notice>,
}

impl StoreObserver for Forwarder {
    fn files_inserted(&self, files: &[FileRecord]) {
        let _ = self.tx.send(Notice::Inserted(files.to_vec()));
    }

    fn files_updated(&self, files: &[FileRecord]) {
        let _ = self.tx.send(Notice::Updated(files.to_vec()));
    }

    fn files_removed(&self, identifiers: &[Identifier]) {
        let _ = self.tx.send(Notice::Removed(identifiers.to_vec()));
    }
}

/// The materialized list plus the rules for applying store notices to it.
/// Mutated only on the view's own task; kept separate from the delivery
/// plumbing so the batching and dedup rules are testable.
pub struct ViewState {
    filter: Filter,
    sort: Sort,
    threshold: usize,
    files: Vec<FileRecord>,
}

impl ViewState {
    pub fn new(filter: Filter, sort: Sort, threshold: usize) -> Self {
        Self {
            filter,
            sort,
            threshold,
            files: Vec::new(),
        }
    }

    pub fn files(&self) -> &[FileRecord] {
        &self.files
    }

    /// Installs the initial query snapshot, yielding the replace-all event
    /// that precedes any incremental event.
    pub fn seed(&mut self, files: Vec<FileRecord>) -> ViewEvent {
        self.files = files;
        ViewEvent::Reset(self.files.clone())
    }

    pub fn inserted(&mut self, batch: Vec<FileRecord>) -> Vec<ViewEvent> {
        // Drop records outside the filter, and records the initial query
        // already returned (the subscribe-then-query window).
        let batch: Vec<FileRecord> = batch
            .into_iter()
            .filter(|file| self.filter.matches(file))
            .filter(|file| {
                let identifier = file.identifier();
                !self.files.iter().any(|e| e.identifier() == identifier)
            })
            .collect();
        if batch.is_empty() {
            return Vec::new();
        }
        if batch.len() < self.threshold {
            let mut events = Vec::new();
            for file in batch {
                let index = self.insert_sorted(file.clone());
                events.push(ViewEvent::Inserted { file, index });
            }
            events
        } else {
            for file in batch {
                self.insert_sorted(file);
            }
            vec![ViewEvent::Reset(self.files.clone())]
        }
    }

    pub fn updated(&mut self, batch: Vec<FileRecord>) -> Vec<ViewEvent> {
        let mut applied = Vec::new();
        for file in batch {
            if !self.filter.matches(&file) {
                continue;
            }
            let identifier = file.identifier();
            let Some(index) = self.files.iter().position(|e| e.identifier() == identifier)
            else {
                continue;
            };
            // Updates never move an entry: the sort key derives from the
            // path, and a path change arrives as remove + insert.
            self.files[index] = file.clone();
            applied.push((file, index));
        }
        if applied.is_empty() {
            Vec::new()
        } else if applied.len() < self.threshold {
            applied
                .into_iter()
                .map(|(file, index)| ViewEvent::Updated { file, index })
                .collect()
        } else {
            vec![ViewEvent::Reset(self.files.clone())]
        }
    }

    pub fn removed(&mut self, batch: Vec<Identifier>) -> Vec<ViewEvent> {
        let batch: Vec<Identifier> = batch
            .into_iter()
            .filter(|identifier| self.files.iter().any(|e| e.identifier() == *identifier))
            .collect();
        if batch.is_empty() {
            return Vec::new();
        }
        if batch.len() < self.threshold {
            let mut events = Vec::new();
            for identifier in batch {
                let Some(index) = self.files.iter().position(|e| e.identifier() == identifier)
                else {
                    continue;
                };
                self.files.remove(index);
                events.push(ViewEvent::Removed { identifier, index });
            }
            events
        } else {
            self.files.retain(|e| !batch.contains(&e.identifier()));
            vec![ViewEvent::Reset(self.files.clone())]
        }
    }

    /// Inserts `file` at its sorted position, found by binary search, and
    /// returns that position.
    fn insert_sorted(&mut self, file: FileRecord) -> usize {
        let index = self
            .files
            .partition_point(|existing| self.sort.cmp(existing, &file).is_lt());
        self.files.insert(index, file);
        index
    }
}

/// A running live view. Stopping is terminal; build a fresh view to observe
/// again.
pub struct StoreView {
    store: Store,
    observer: Option<ObserverHandle>,
    task: Option<JoinHandle<()>>,
}

impl StoreView {
    /// Starts observing: registers with the store, fetches the initial
    /// snapshot, and delivers it as one [`ViewEvent::Reset`] before any
    /// incremental event.
    pub fn start(
        store: &Store,
        filter: Filter,
        sort: Sort,
        threshold: usize,
        out: mpsc::Sender<ViewEvent>,
    ) -> StoreView {
        let (tx, rx) = mpsc::unbounded_channel();
        // Register first so no insert slips between query and subscription.
        let observer = store.add_observer(Arc::new(Forwarder { tx }));
        let task = tokio::spawn(run(store.clone(), filter, sort, threshold, rx, out));
        StoreView {
            store: store.clone(),
            observer: Some(observer),
            task: Some(task),
        }
    }

    /// Deregisters from the store and cancels delivery; after this returns
    /// the consumer receives nothing further. Idempotent.
    pub async fn stop(&mut self) {
        if let Some(observer) = self.observer.take() {
            self.store.remove_observer(observer);
        }
        if let Some(task) = self.task.take() {
            // Notices already queued must not surface after stop, so cancel
            // rather than drain.
            task.abort();
            let _ = task.await;
        }
    }
}

async fn run(
    store: Store,
    filter: Filter,
    sort: Sort,
    threshold: usize,
    mut rx: mpsc::UnboundedReceiver<Notice>,
    out: mpsc::Sender<ViewEvent>,
) {
    let files = match store.files(&filter, sort).await {
        Ok(files) => files,
        Err(error) => {
            warn!(%error, "initial view query failed");
            return;
        }
    };
    let mut state = ViewState::new(filter, sort, threshold);
    if out.send(state.seed(files)).await.is_err() {
        return;
    }

    while let Some(notice) = rx.recv().await {
        let events = match notice {
            Notice::Inserted(batch) => state.inserted(batch),
            Notice::Updated(batch) => state.updated(batch),
            Notice::Removed(batch) => state.removed(batch),
        };
        for event in events {
            if out.send(event).await.is_err() {
                return;
            }
        }
    }
}
