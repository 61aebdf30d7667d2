use shelf_core::filter::{Filter, Sort};
use shelf_core::models::{FileKind, FileRecord, Tag};
use shelf_core::store::Store;
use shelf_core::tags_view::{TagsView, TagsViewEvent};
use shelf_core::view::{StoreView, ViewEvent, ViewState};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

async fn open_store() -> (Store, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("catalogue.db");
    let store = Store::open(db.to_str().unwrap()).await.unwrap();
    (store, dir)
}

fn record(path: &str, modified_at: i64) -> FileRecord {
    FileRecord::new("/library", path, FileKind::Text, modified_at)
}

async fn next(rx: &mut mpsc::Receiver<ViewEvent>) -> ViewEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for view event")
        .expect("view channel closed")
}

/// Applies one event to the consumer-side list, the way a UI would.
fn apply(list: &mut Vec<FileRecord>, event: ViewEvent) {
    match event {
        ViewEvent::Reset(files) => *list = files,
        ViewEvent::Inserted { file, index } => list.insert(index, file),
        ViewEvent::Updated { file, index } => list[index] = file,
        ViewEvent::Removed { identifier, index } => {
            assert_eq!(list[index].identifier(), identifier);
            list.remove(index);
        }
    }
}

#[tokio::test]
async fn starts_with_a_sorted_reset() {
    let (store, _dir) = open_store().await;
    store
        .insert(vec![record("/library/b.txt", 1), record("/library/a.txt", 2)])
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::channel(64);
    let mut view = StoreView::start(&store, Filter::True, Sort::DisplayNameAscending, 10, tx);

    match next(&mut rx).await {
        ViewEvent::Reset(files) => {
            let names: Vec<_> = files.iter().map(|f| f.name.clone()).collect();
            assert_eq!(names, vec!["a.txt", "b.txt"]);
        }
        other => panic!("expected reset, got {other:?}"),
    }
    view.stop().await;
}

#[tokio::test]
async fn small_batches_arrive_as_indexed_events() {
    let (store, _dir) = open_store().await;
    let (tx, mut rx) = mpsc::channel(64);
    let mut view = StoreView::start(&store, Filter::True, Sort::DisplayNameAscending, 10, tx);

    let mut list = Vec::new();
    apply(&mut list, next(&mut rx).await);
    assert!(list.is_empty());

    store
        .insert(vec![
            record("/library/citrus.txt", 1),
            record("/library/apple.txt", 2),
            record("/library/banana.txt", 3),
        ])
        .await
        .unwrap();

    for _ in 0..3 {
        let event = next(&mut rx).await;
        assert!(matches!(event, ViewEvent::Inserted { .. }));
        apply(&mut list, event);
    }

    let expected = store.files(&Filter::True, Sort::DisplayNameAscending).await.unwrap();
    assert_eq!(list, expected);
    view.stop().await;
}

#[tokio::test]
async fn large_batches_collapse_to_one_reset() {
    let (store, _dir) = open_store().await;
    let (tx, mut rx) = mpsc::channel(64);
    let mut view = StoreView::start(&store, Filter::True, Sort::DisplayNameAscending, 10, tx);
    assert!(matches!(next(&mut rx).await, ViewEvent::Reset(_)));

    let batch: Vec<FileRecord> = (0..15)
        .map(|i| record(&format!("/library/file-{i:02}.txt"), i))
        .collect();
    store.insert(batch).await.unwrap();

    match next(&mut rx).await {
        ViewEvent::Reset(files) => assert_eq!(files.len(), 15),
        other => panic!("expected reset, got {other:?}"),
    }

    // Nothing further is queued for that batch.
    store.insert(vec![record("/library/zz.txt", 99)]).await.unwrap();
    assert!(matches!(next(&mut rx).await, ViewEvent::Inserted { .. }));
    view.stop().await;
}

#[tokio::test]
async fn removals_carry_valid_indices() {
    let (store, _dir) = open_store().await;
    let records = vec![
        record("/library/a.txt", 1),
        record("/library/b.txt", 2),
        record("/library/c.txt", 3),
    ];
    store.insert(records.clone()).await.unwrap();

    let (tx, mut rx) = mpsc::channel(64);
    let mut view = StoreView::start(&store, Filter::True, Sort::DisplayNameAscending, 10, tx);
    let mut list = Vec::new();
    apply(&mut list, next(&mut rx).await);
    assert_eq!(list.len(), 3);

    store
        .remove(vec![records[0].identifier(), records[2].identifier()])
        .await
        .unwrap();
    for _ in 0..2 {
        let event = next(&mut rx).await;
        assert!(matches!(event, ViewEvent::Removed { .. }));
        apply(&mut list, event);
    }

    let expected = store.files(&Filter::True, Sort::DisplayNameAscending).await.unwrap();
    assert_eq!(list, expected);
    view.stop().await;
}

#[tokio::test]
async fn updates_replace_in_place() {
    let (store, _dir) = open_store().await;
    let records = vec![record("/library/a.txt", 1), record("/library/b.txt", 2)];
    store.insert(records.clone()).await.unwrap();

    let (tx, mut rx) = mpsc::channel(64);
    let mut view = StoreView::start(&store, Filter::True, Sort::DisplayNameAscending, 10, tx);
    let mut list = Vec::new();
    apply(&mut list, next(&mut rx).await);

    let mut changed = records[1].clone();
    changed.modified_at = 42;
    store.update(vec![changed]).await.unwrap();

    match next(&mut rx).await {
        ViewEvent::Updated { file, index } => {
            assert_eq!(index, 1);
            assert_eq!(file.modified_at, 42);
            apply(&mut list, ViewEvent::Updated { file, index });
        }
        other => panic!("expected update, got {other:?}"),
    }

    let expected = store.files(&Filter::True, Sort::DisplayNameAscending).await.unwrap();
    assert_eq!(list, expected);
    view.stop().await;
}

#[tokio::test]
async fn filtered_views_ignore_unrelated_changes() {
    let (store, _dir) = open_store().await;
    let (tx, mut rx) = mpsc::channel(64);
    let filter = Filter::owner("/library");
    let mut view = StoreView::start(&store, filter, Sort::DisplayNameAscending, 10, tx);
    assert!(matches!(next(&mut rx).await, ViewEvent::Reset(_)));

    store
        .insert(vec![FileRecord::new("/other", "/other/x.txt", FileKind::Text, 1)])
        .await
        .unwrap();
    store.insert(vec![record("/library/y.txt", 2)]).await.unwrap();

    // Only the matching insert surfaces.
    match next(&mut rx).await {
        ViewEvent::Inserted { file, .. } => {
            assert_eq!(file.path, std::path::PathBuf::from("/library/y.txt"));
        }
        other => panic!("unexpected event {other:?}"),
    }
    view.stop().await;
}

#[tokio::test]
async fn stopped_views_deliver_nothing_further() {
    let (store, _dir) = open_store().await;
    let (tx, mut rx) = mpsc::channel(64);
    let mut view = StoreView::start(&store, Filter::True, Sort::DisplayNameAscending, 10, tx);
    assert!(matches!(next(&mut rx).await, ViewEvent::Reset(_)));

    view.stop().await;
    store.insert(vec![record("/library/late.txt", 1)]).await.unwrap();

    assert!(timeout(Duration::from_secs(5), rx.recv()).await.unwrap().is_none());
}

#[test]
fn insert_notice_for_snapshotted_record_is_ignored() {
    // The observer registers before the initial query runs, so an insert
    // committing in between is both in the snapshot and replayed as a
    // notice. The replay must not surface or duplicate the entry.
    let a = record("/library/a.txt", 1);
    let mut state = ViewState::new(Filter::True, Sort::DisplayNameAscending, 10);
    state.seed(vec![a.clone()]);

    assert!(state.inserted(vec![a.clone()]).is_empty());
    assert_eq!(state.files().to_vec(), vec![a.clone()]);

    // A genuinely new record still lands.
    let b = record("/library/b.txt", 2);
    let events = state.inserted(vec![b.clone()]);
    assert!(matches!(&events[..], [ViewEvent::Inserted { index: 1, .. }]));
    assert_eq!(state.files().to_vec(), vec![a, b]);
}

async fn next_tag(rx: &mut mpsc::Receiver<TagsViewEvent>) -> TagsViewEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for tags event")
        .expect("tags channel closed")
}

#[tokio::test]
async fn tags_order_folds_ascii_case_only() {
    let (store, _dir) = open_store().await;
    let jam = record("/library/a #jam.txt", 1).with_tags([Tag::filename("jam")].into());
    store.insert(vec![jam]).await.unwrap();

    let (tx, mut rx) = mpsc::channel(64);
    let mut view = TagsView::start(&store, tx);
    assert!(matches!(next_tag(&mut rx).await, TagsViewEvent::Reset(_)));

    // Non-ASCII names sort after every ASCII name, as NOCASE orders them.
    let city = record("/library/b #İstanbul.txt", 2)
        .with_tags([Tag::filename("İstanbul")].into());
    store.insert(vec![city]).await.unwrap();
    match next_tag(&mut rx).await {
        TagsViewEvent::Inserted { tag, index } => {
            assert_eq!(tag, Tag::filename("İstanbul"));
            assert_eq!(index, 1);
        }
        other => panic!("expected insert, got {other:?}"),
    }
    assert_eq!(
        store.tags().await.unwrap(),
        vec![Tag::filename("jam"), Tag::filename("İstanbul")]
    );
    view.stop().await;
}

#[tokio::test]
async fn tags_view_tracks_tag_lifecycle() {
    let (store, _dir) = open_store().await;
    let seeded = record("/library/start #zebra.txt", 1)
        .with_tags([Tag::filename("zebra")].into());
    store.insert(vec![seeded]).await.unwrap();

    let (tx, mut rx) = mpsc::channel(64);
    let mut view = TagsView::start(&store, tx);
    match next_tag(&mut rx).await {
        TagsViewEvent::Reset(tags) => assert_eq!(tags, vec![Tag::filename("zebra")]),
        other => panic!("expected reset, got {other:?}"),
    }

    let tagged = record("/library/trip #Alps.txt", 2).with_tags([Tag::filename("Alps")].into());
    store.insert(vec![tagged.clone()]).await.unwrap();
    match next_tag(&mut rx).await {
        TagsViewEvent::Inserted { tag, index } => {
            assert_eq!(tag, Tag::filename("Alps"));
            // Case-insensitive alphabetic position, ahead of "zebra".
            assert_eq!(index, 0);
        }
        other => panic!("expected insert, got {other:?}"),
    }

    store.remove(vec![tagged.identifier()]).await.unwrap();
    match next_tag(&mut rx).await {
        TagsViewEvent::Removed { tag, index } => {
            assert_eq!(tag, Tag::filename("Alps"));
            assert_eq!(index, 0);
        }
        other => panic!("expected removal, got {other:?}"),
    }
    view.stop().await;
}
