//! Integration tests for dispatching committed work.

use std::{sync::Arc, time::Duration};

use eventide::{
    DEFAULT_BUCKET, EventMessage, OptimisticEventStore, StreamError,
    dispatch::{
        AsynchronousDispatchScheduler, DispatchError, DispatchScheduler, DispatcherStartup,
        SynchronousDispatchScheduler,
    },
    persistence::{Persistence, inmemory::InMemoryPersistence},
};
use eventide_core::test::{PersistenceTestExt, RecordingDispatcher, RecordingPersistence};
use serde_json::json;
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn asynchronous_scheduler_dispatches_stream_commits_in_order() {
    let persistence = InMemoryPersistence::new();
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let store = OptimisticEventStore::new(persistence.clone()).with_dispatch_scheduler(
        AsynchronousDispatchScheduler::new(
            dispatcher.clone(),
            persistence.clone(),
            DispatcherStartup::Auto,
        ),
    );

    let mut stream = store.create_stream(DEFAULT_BUCKET, "s").unwrap();
    let mut ids = Vec::new();
    for value in 0..3 {
        stream.add(EventMessage::new(json!(value))).unwrap();
        let commit_id = Uuid::new_v4();
        stream.commit_changes(commit_id).await.unwrap();
        ids.push(commit_id);
    }

    assert!(dispatcher.wait_for_dispatches(3, WAIT).await);
    assert_eq!(dispatcher.dispatched_ids(), ids);
    assert!(persistence.get_undispatched_commits().await.unwrap().is_empty());
}

#[tokio::test]
async fn restarted_scheduler_dispatches_what_a_previous_run_left_behind() {
    let persistence = InMemoryPersistence::new();
    let left_behind = persistence
        .commit_many(DEFAULT_BUCKET, "s", 2)
        .await
        .unwrap();
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let store = OptimisticEventStore::new(persistence.clone()).with_dispatch_scheduler(
        SynchronousDispatchScheduler::new(dispatcher.clone(), persistence.clone()),
    );

    store.start_dispatch_scheduler().await.unwrap();

    let expected: Vec<_> = left_behind.iter().map(|c| c.commit_id).collect();
    assert_eq!(dispatcher.dispatched_ids(), expected);
    assert!(persistence.get_undispatched_commits().await.unwrap().is_empty());
}

#[tokio::test]
async fn explicitly_started_scheduler_refuses_commits_until_started() {
    let persistence = InMemoryPersistence::new();
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let store = OptimisticEventStore::new(persistence.clone()).with_dispatch_scheduler(
        AsynchronousDispatchScheduler::new(
            dispatcher.clone(),
            persistence.clone(),
            DispatcherStartup::Explicit,
        ),
    );

    let mut stream = store.create_stream(DEFAULT_BUCKET, "s").unwrap();
    stream.add(EventMessage::new(json!("early"))).unwrap();
    let err = stream.commit_changes(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(
        err,
        StreamError::Dispatch(DispatchError::NotStarted)
    ));

    // The rejected dispatch left the commit undispatched; starting picks it up.
    store.start_dispatch_scheduler().await.unwrap();
    assert!(dispatcher.wait_for_dispatches(1, WAIT).await);
}

#[tokio::test]
async fn failing_target_leaves_commits_for_the_next_start() {
    let persistence = InMemoryPersistence::new();
    let scheduler = SynchronousDispatchScheduler::new(
        Arc::new(RecordingDispatcher::failing()),
        persistence.clone(),
    );
    let commit = persistence.commit_single(DEFAULT_BUCKET, "s").await.unwrap();

    let err = scheduler.schedule_dispatch(&commit).await.unwrap_err();
    assert!(matches!(err, DispatchError::Dispatcher { .. }));

    let recovered = Arc::new(RecordingDispatcher::new());
    SynchronousDispatchScheduler::new(recovered.clone(), persistence.clone())
        .start()
        .await
        .unwrap();
    assert_eq!(recovered.dispatched_ids(), vec![commit.commit_id]);
}

#[tokio::test]
async fn disposing_the_store_disposes_scheduler_target_and_storage_once() {
    let persistence = RecordingPersistence::new();
    let dispatcher = Arc::new(RecordingDispatcher::new());
    let store = OptimisticEventStore::new(persistence.clone()).with_dispatch_scheduler(
        AsynchronousDispatchScheduler::new(
            dispatcher.clone(),
            persistence.clone(),
            DispatcherStartup::Auto,
        ),
    );

    store.dispose();
    store.dispose();

    assert_eq!(dispatcher.dispose_count(), 1);
    assert_eq!(persistence.calls().dispose, 1);
    assert!(matches!(
        store.start_dispatch_scheduler().await,
        Err(DispatchError::Disposed)
    ));
}
