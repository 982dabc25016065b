//! Integration tests for the store, its pipeline and its lifecycle.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use eventide::{
    CommitAttempt, DEFAULT_BUCKET, EventMessage, OptimisticEventStore, StreamError,
    persistence::{CommitError, Persistence, StorageError, inmemory::InMemoryPersistence},
    pipeline::{CommitTracker, EventUpconverter, PipelineHook},
};
use eventide_core::test::{PersistenceTestExt, RecordingPersistence, build_attempt};
use serde_json::json;
use uuid::Uuid;

// ============================================================================
// Conflict detection
// ============================================================================

#[tokio::test]
async fn stores_sharing_a_tracker_reject_each_others_stale_writes_early() {
    let persistence = RecordingPersistence::new();
    let tracker = Arc::new(CommitTracker::new());
    let first = OptimisticEventStore::with_tracker(persistence.clone(), Arc::clone(&tracker));
    let second = OptimisticEventStore::with_tracker(persistence.clone(), tracker);

    first
        .commit(build_attempt(DEFAULT_BUCKET, "s", 1, 1, 1))
        .await
        .unwrap();
    let err = second
        .commit(build_attempt(DEFAULT_BUCKET, "s", 1, 1, 1))
        .await
        .unwrap_err();

    assert!(matches!(err, CommitError::Conflict(_)));
    assert_eq!(persistence.calls().commit, 1);
}

#[tokio::test]
async fn commits_read_back_are_tracked() {
    let persistence = InMemoryPersistence::new();
    let seeded = persistence.commit_single(DEFAULT_BUCKET, "s").await.unwrap();
    let tracker = Arc::new(CommitTracker::new());
    let store = OptimisticEventStore::with_tracker(persistence, Arc::clone(&tracker));

    let _stream = store.open_stream(DEFAULT_BUCKET, "s", 0, 0).await.unwrap();

    assert!(tracker.contains(&seeded));
}

#[tokio::test]
async fn skipping_ahead_of_a_tracked_head_is_reported_as_corruption() {
    let store = OptimisticEventStore::new(InMemoryPersistence::new());
    store
        .commit(build_attempt(DEFAULT_BUCKET, "s", 2, 1, 2))
        .await
        .unwrap();

    let err = store
        .commit(build_attempt(DEFAULT_BUCKET, "s", 10, 5, 1))
        .await
        .unwrap_err();

    assert!(matches!(err, CommitError::Storage(StorageError::Corruption { .. })));
}

#[tokio::test]
async fn reading_old_history_does_not_block_the_next_commit() {
    let store = OptimisticEventStore::new(InMemoryPersistence::new());
    let mut writer = store.create_stream(DEFAULT_BUCKET, "s").unwrap();
    for i in 0..20 {
        writer.add(EventMessage::new(json!({ "n": i }))).unwrap();
        writer.commit_changes(Uuid::new_v4()).await.unwrap();
    }

    let history = store.open_stream(DEFAULT_BUCKET, "s", 1, 16).await.unwrap();
    assert_eq!(history.stream_revision(), 16);

    writer.add(EventMessage::new(json!({ "n": 20 }))).unwrap();
    writer.commit_changes(Uuid::new_v4()).await.unwrap();
    assert_eq!(writer.stream_revision(), 21);
}

#[tokio::test]
async fn deleting_a_stream_lets_it_start_over() {
    let store = OptimisticEventStore::new(InMemoryPersistence::new());
    store
        .commit(build_attempt(DEFAULT_BUCKET, "s", 1, 1, 1))
        .await
        .unwrap();

    store.delete_stream(DEFAULT_BUCKET, "s").await.unwrap();

    store
        .commit(build_attempt(DEFAULT_BUCKET, "s", 1, 1, 1))
        .await
        .unwrap();
}

// ============================================================================
// Pipeline
// ============================================================================

/// Declines every attempt while switched on.
#[derive(Default)]
struct Gate {
    closed: AtomicBool,
}

impl PipelineHook for Gate {
    fn pre_commit(&self, _attempt: &CommitAttempt) -> Result<bool, CommitError> {
        Ok(!self.closed.load(Ordering::Acquire))
    }
}

#[tokio::test]
async fn declined_stream_commit_changes_nothing() {
    let persistence = RecordingPersistence::new();
    let gate = Arc::new(Gate::default());
    let store = OptimisticEventStore::new(persistence.clone()).with_hook(gate.clone());
    let mut stream = store.create_stream(DEFAULT_BUCKET, "s").unwrap();
    stream.add(EventMessage::new(json!("pending"))).unwrap();

    gate.closed.store(true, Ordering::Release);
    stream.commit_changes(Uuid::new_v4()).await.unwrap();

    assert_eq!(persistence.calls().commit, 0);
    assert_eq!(stream.stream_revision(), 0);
    assert_eq!(stream.uncommitted_events().len(), 1);

    gate.closed.store(false, Ordering::Release);
    stream.commit_changes(Uuid::new_v4()).await.unwrap();
    assert_eq!(stream.stream_revision(), 1);
}

#[tokio::test]
async fn old_event_shapes_are_upconverted_on_read() {
    let persistence = InMemoryPersistence::new();
    let writer = OptimisticEventStore::new(persistence.clone());
    let mut stream = writer.create_stream(DEFAULT_BUCKET, "order").unwrap();
    stream
        .add(EventMessage::new(json!({ "amount": 12 })).with_kind("order-placed.v1"))
        .unwrap();
    stream.commit_changes(Uuid::new_v4()).await.unwrap();

    let upconverter = EventUpconverter::new()
        .register("order-placed.v1", "order-placed.v2", |mut body| {
            body["currency"] = json!("EUR");
            body
        })
        .unwrap();
    let reader = OptimisticEventStore::new(persistence).with_hook(Arc::new(upconverter));

    let stream = reader.open_stream(DEFAULT_BUCKET, "order", 0, 0).await.unwrap();
    let event = &stream.committed_events()[0];
    assert_eq!(event.kind(), Some("order-placed.v2"));
    assert_eq!(event.body, Some(json!({ "amount": 12, "currency": "EUR" })));

    let from_checkpoint: Vec<_> = reader.get_from_checkpoint(None, None).await.unwrap().collect();
    assert_eq!(from_checkpoint[0].events[0].kind(), Some("order-placed.v2"));
}

#[tokio::test]
async fn undispatched_and_date_reads_go_through_the_store() {
    let persistence = InMemoryPersistence::new();
    let store = OptimisticEventStore::new(persistence.clone());
    let before = chrono::Utc::now() - chrono::Duration::seconds(1);
    store
        .commit(build_attempt(DEFAULT_BUCKET, "s", 1, 1, 1))
        .await
        .unwrap();

    assert_eq!(store.get_undispatched_commits().await.unwrap().count(), 1);
    assert_eq!(store.get_from_date(DEFAULT_BUCKET, before).await.unwrap().count(), 1);
    assert_eq!(
        store
            .get_from_to(DEFAULT_BUCKET, before, before + chrono::Duration::hours(1))
            .await
            .unwrap()
            .count(),
        1
    );
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn disposed_store_refuses_further_work() {
    let persistence = RecordingPersistence::new();
    let store = OptimisticEventStore::new(persistence.clone());

    store.dispose();
    store.dispose();

    assert!(store.is_disposed());
    assert!(persistence.is_disposed());
    assert_eq!(persistence.calls().dispose, 1);
    assert!(matches!(
        store.create_stream(DEFAULT_BUCKET, "s"),
        Err(StreamError::Storage(StorageError::Disposed))
    ));
    assert!(matches!(
        store.get_from_checkpoint(None, None).await,
        Err(StorageError::Disposed)
    ));
    assert!(matches!(store.purge().await, Err(StorageError::Disposed)));
}
