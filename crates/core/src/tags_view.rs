//! A live, alphabetised materialization of the store's tag set.
//!
//! Same shape as the file view: subscribe first, query second, dedupe the
//! window between, and batch with the same threshold policy.

use crate::models::Tag;
use crate::store::{ObserverHandle, Store, StoreObserver};
use crate::view::DEFAULT_THRESHOLD;
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Debug, Clone)]
pub enum TagsViewEvent {
    Reset(Vec<Tag>),
    Inserted { tag: Tag, index: usize },
    Removed { tag: Tag, index: usize },
}

enum Notice {
    Inserted(Vec<Tag>),
    Removed(Vec<Tag>),
}

struct Forwarder {
    tx: mpsc::UnboundedSender<Notice>,
}

impl StoreObserver for Forwarder {
    fn tags_inserted(&self, tags: &[Tag]) {
        let _ = self.tx.send(Notice::Inserted(tags.to_vec()));
    }

    fn tags_removed(&self, tags: &[Tag]) {
        let _ = self.tx.send(Notice::Removed(tags.to_vec()));
    }
}

pub struct TagsView {
    store: Store,
    observer: Option<ObserverHandle>,
    task: Option<JoinHandle<()>>,
}

impl TagsView {
    pub fn start(store: &Store, out: mpsc::Sender<TagsViewEvent>) -> TagsView {
        Self::with_threshold(store, DEFAULT_THRESHOLD, out)
    }

    pub fn with_threshold(
        store: &Store,
        threshold: usize,
        out: mpsc::Sender<TagsViewEvent>,
    ) -> TagsView {
        let (tx, rx) = mpsc::unbounded_channel();
        let observer = store.add_observer(Arc::new(Forwarder { tx }));
        let task = tokio::spawn(run(store.clone(), threshold, rx, out));
        TagsView {
            store: store.clone(),
            observer: Some(observer),
            task: Some(task),
        }
    }

    /// Terminal and idempotent; the consumer receives nothing after this
    /// returns.
    pub async fn stop(&mut self) {
        if let Some(observer) = self.observer.take() {
            self.store.remove_observer(observer);
        }
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
    }
}

/// Alphabetic order, matching the store's tag query exactly. NOCASE folds
/// A-Z only, so this must too.
fn tag_order(lhs: &Tag, rhs: &Tag) -> Ordering {
    lhs.name
        .to_ascii_lowercase()
        .cmp(&rhs.name.to_ascii_lowercase())
        .then_with(|| lhs.source.as_raw().cmp(&rhs.source.as_raw()))
}

async fn run(
    store: Store,
    threshold: usize,
    mut rx: mpsc::UnboundedReceiver<Notice>,
    out: mpsc::Sender<TagsViewEvent>,
) {
    let mut tags = match store.tags().await {
        Ok(tags) => tags,
        Err(error) => {
            warn!(%error, "initial tags query failed");
            return;
        }
    };
    if out.send(TagsViewEvent::Reset(tags.clone())).await.is_err() {
        return;
    }

    while let Some(notice) = rx.recv().await {
        match notice {
            Notice::Inserted(batch) => {
                // Tags the initial query already returned can arrive again
                // through the subscribe-then-query window.
                let batch: Vec<Tag> = batch.into_iter().filter(|t| !tags.contains(t)).collect();
                if batch.is_empty() {
                    continue;
                }
                if batch.len() < threshold {
                    for tag in batch {
                        let index = tags.partition_point(|e| tag_order(e, &tag).is_lt());
                        tags.insert(index, tag.clone());
                        if out.send(TagsViewEvent::Inserted { tag, index }).await.is_err() {
                            return;
                        }
                    }
                } else {
                    for tag in batch {
                        let index = tags.partition_point(|e| tag_order(e, &tag).is_lt());
                        tags.insert(index, tag);
                    }
                    if out.send(TagsViewEvent::Reset(tags.clone())).await.is_err() {
                        return;
                    }
                }
            }
            Notice::Removed(batch) => {
                let batch: Vec<Tag> = batch.into_iter().filter(|t| tags.contains(t)).collect();
                if batch.is_empty() {
                    continue;
                }
                if batch.len() < threshold {
                    for tag in batch {
                        let Some(index) = tags.iter().position(|e| *e == tag) else {
                            continue;
                        };
                        tags.remove(index);
                        if out.send(TagsViewEvent::Removed { tag, index }).await.is_err() {
                            return;
                        }
                    }
                } else {
                    tags.retain(|e| !batch.contains(e));
                    if out.send(TagsViewEvent::Reset(tags.clone())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
