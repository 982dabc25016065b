//! Test utilities for code built on the storage core.
//!
//! - [`build_attempt`] / [`build_commit`]: commits with placeholder events
//! - [`PersistenceTestExt`]: seeding helpers for any [`Persistence`]
//! - [`RecordingPersistence`]: an in-memory engine that counts calls and can
//!   be told to fail reads
//! - [`RecordingDispatcher`]: a dispatch target that remembers what it saw
//!
//! # Seeding a stream
//!
//! ```ignore
//! use eventide_core::test::PersistenceTestExt;
//!
//! let first = persistence.commit_single("bucket", "stream").await?;
//! let second = persistence.commit_next(&first).await?;
//! assert_eq!(second.stream_revision, 4);
//! ```

use std::{
    future::Future,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use nonempty::NonEmpty;
use tokio::sync::watch;
use uuid::Uuid;

use crate::{
    commit::{Commit, CommitAttempt, EventMessage, Headers, Snapshot, StreamHead},
    dispatch::DispatchCommits,
    persistence::{
        BoxError, CommitError, Persistence, StorageError, inmemory::InMemoryPersistence,
    },
};

/// An attempt ending at `stream_revision` with `event_count` numbered events.
///
/// # Panics
///
/// Panics if `event_count` is zero.
#[must_use]
pub fn build_attempt(
    bucket_id: &str,
    stream_id: &str,
    stream_revision: u64,
    commit_sequence: u64,
    event_count: usize,
) -> CommitAttempt {
    let events = (0..event_count)
        .map(|i| EventMessage::new(serde_json::json!({ "value": i })))
        .collect();
    CommitAttempt {
        bucket_id: bucket_id.to_owned(),
        stream_id: stream_id.to_owned(),
        stream_revision,
        commit_id: Uuid::new_v4(),
        commit_sequence,
        commit_stamp: Utc::now(),
        headers: Headers::new(),
        events: NonEmpty::from_vec(events).expect("at least one event"),
    }
}

/// Like [`build_attempt`], already persisted with a checkpoint equal to the
/// commit sequence.
#[must_use]
pub fn build_commit(
    bucket_id: &str,
    stream_id: &str,
    stream_revision: u64,
    commit_sequence: u64,
    event_count: usize,
) -> Commit {
    Commit::from_attempt(
        build_attempt(
            bucket_id,
            stream_id,
            stream_revision,
            commit_sequence,
            event_count,
        ),
        commit_sequence.to_string(),
    )
}

/// Seeding helpers available on every [`Persistence`].
pub trait PersistenceTestExt: Persistence {
    /// Commit two events as the first commit of a stream.
    fn commit_single<'a>(
        &'a self,
        bucket_id: &str,
        stream_id: &str,
    ) -> impl Future<Output = Result<Commit, CommitError>> + Send + 'a {
        self.commit(build_attempt(bucket_id, stream_id, 2, 1, 2))
    }

    /// Commit two events right after `previous` in the same stream.
    fn commit_next(
        &self,
        previous: &Commit,
    ) -> impl Future<Output = Result<Commit, CommitError>> + Send + '_ {
        self.commit(build_attempt(
            &previous.bucket_id,
            &previous.stream_id,
            previous.stream_revision + 2,
            previous.commit_sequence + 1,
            2,
        ))
    }

    /// Commit `count` consecutive two-event commits to a fresh stream.
    fn commit_many<'a>(
        &'a self,
        bucket_id: &'a str,
        stream_id: &'a str,
        count: usize,
    ) -> impl Future<Output = Result<Vec<Commit>, CommitError>> + Send + 'a {
        async move {
            let mut commits: Vec<Commit> = Vec::with_capacity(count);
            for _ in 0..count {
                let commit = match commits.last() {
                    Some(previous) => self.commit_next(previous).await?,
                    None => self.commit_single(bucket_id, stream_id).await?,
                };
                commits.push(commit);
            }
            Ok(commits)
        }
    }
}

impl<T: Persistence + ?Sized> PersistenceTestExt for T {}

/// How often each [`Persistence`] operation was called.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PersistenceCalls {
    pub initialize: usize,
    pub commit: usize,
    pub get_from: usize,
    pub get_from_checkpoint: usize,
    pub get_from_date: usize,
    pub get_from_to: usize,
    pub get_undispatched_commits: usize,
    pub mark_commit_as_dispatched: usize,
    pub get_streams_to_snapshot: usize,
    pub add_snapshot: usize,
    pub get_snapshot: usize,
    pub purge: usize,
    pub purge_bucket: usize,
    pub delete_stream: usize,
    pub dispose: usize,
}

/// [`InMemoryPersistence`] that counts every call.
///
/// Clones share both the data and the counters.
#[derive(Clone, Default)]
pub struct RecordingPersistence {
    inner: InMemoryPersistence,
    calls: Arc<Mutex<PersistenceCalls>>,
    fail_reads: Arc<AtomicBool>,
}

impl RecordingPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of the call counters.
    ///
    /// # Panics
    ///
    /// Panics if the counter lock is poisoned.
    #[must_use]
    pub fn calls(&self) -> PersistenceCalls {
        *self.calls.lock().expect("call counter lock poisoned")
    }

    /// Make checkpoint reads fail with a backend error until switched off.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Release);
    }

    #[must_use]
    pub const fn inner(&self) -> &InMemoryPersistence {
        &self.inner
    }

    fn record(&self, call: impl FnOnce(&mut PersistenceCalls) -> &mut usize) {
        let mut calls = self.calls.lock().expect("call counter lock poisoned");
        *call(&mut calls) += 1;
    }
}

impl Persistence for RecordingPersistence {
    type Checkpoint = <InMemoryPersistence as Persistence>::Checkpoint;

    fn initialize(&self) -> impl Future<Output = Result<(), StorageError>> + Send + '_ {
        self.record(|c| &mut c.initialize);
        self.inner.initialize()
    }

    fn commit(
        &self,
        attempt: CommitAttempt,
    ) -> impl Future<Output = Result<Commit, CommitError>> + Send + '_ {
        self.record(|c| &mut c.commit);
        self.inner.commit(attempt)
    }

    fn get_from<'a>(
        &'a self,
        bucket_id: &'a str,
        stream_id: &'a str,
        min_revision: u64,
        max_revision: u64,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + 'a {
        self.record(|c| &mut c.get_from);
        self.inner
            .get_from(bucket_id, stream_id, min_revision, max_revision)
    }

    fn get_from_checkpoint<'a>(
        &'a self,
        bucket_id: Option<&'a str>,
        checkpoint_token: Option<&'a str>,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + 'a {
        self.record(|c| &mut c.get_from_checkpoint);
        let fail = self.fail_reads.load(Ordering::Acquire);
        async move {
            if fail {
                return Err(StorageError::backend("injected read failure"));
            }
            self.inner
                .get_from_checkpoint(bucket_id, checkpoint_token)
                .await
        }
    }

    fn get_from_date<'a>(
        &'a self,
        bucket_id: &'a str,
        start: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + 'a {
        self.record(|c| &mut c.get_from_date);
        self.inner.get_from_date(bucket_id, start)
    }

    fn get_from_to<'a>(
        &'a self,
        bucket_id: &'a str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + 'a {
        self.record(|c| &mut c.get_from_to);
        self.inner.get_from_to(bucket_id, start, end)
    }

    fn get_undispatched_commits(
        &self,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + '_ {
        self.record(|c| &mut c.get_undispatched_commits);
        self.inner.get_undispatched_commits()
    }

    fn mark_commit_as_dispatched<'a>(
        &'a self,
        commit: &'a Commit,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + 'a {
        self.record(|c| &mut c.mark_commit_as_dispatched);
        self.inner.mark_commit_as_dispatched(commit)
    }

    fn get_streams_to_snapshot<'a>(
        &'a self,
        bucket_id: &'a str,
        max_threshold: u64,
    ) -> impl Future<Output = Result<Vec<StreamHead>, StorageError>> + Send + 'a {
        self.record(|c| &mut c.get_streams_to_snapshot);
        self.inner.get_streams_to_snapshot(bucket_id, max_threshold)
    }

    fn add_snapshot(
        &self,
        snapshot: Snapshot,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send + '_ {
        self.record(|c| &mut c.add_snapshot);
        self.inner.add_snapshot(snapshot)
    }

    fn get_snapshot<'a>(
        &'a self,
        bucket_id: &'a str,
        stream_id: &'a str,
        max_revision: u64,
    ) -> impl Future<Output = Result<Option<Snapshot>, StorageError>> + Send + 'a {
        self.record(|c| &mut c.get_snapshot);
        self.inner.get_snapshot(bucket_id, stream_id, max_revision)
    }

    fn purge(&self) -> impl Future<Output = Result<(), StorageError>> + Send + '_ {
        self.record(|c| &mut c.purge);
        self.inner.purge()
    }

    fn purge_bucket<'a>(
        &'a self,
        bucket_id: &'a str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + 'a {
        self.record(|c| &mut c.purge_bucket);
        self.inner.purge_bucket(bucket_id)
    }

    fn delete_stream<'a>(
        &'a self,
        bucket_id: &'a str,
        stream_id: &'a str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + 'a {
        self.record(|c| &mut c.delete_stream);
        self.inner.delete_stream(bucket_id, stream_id)
    }

    fn dispose(&self) {
        self.record(|c| &mut c.dispose);
        self.inner.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }
}

/// Dispatch target recording the commits it receives.
pub struct RecordingDispatcher {
    dispatched: Mutex<Vec<Uuid>>,
    count: watch::Sender<usize>,
    disposed: AtomicUsize,
    failing: bool,
}

impl Default for RecordingDispatcher {
    fn default() -> Self {
        Self {
            dispatched: Mutex::new(Vec::new()),
            count: watch::Sender::new(0),
            disposed: AtomicUsize::new(0),
            failing: false,
        }
    }
}

impl RecordingDispatcher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A dispatcher rejecting every commit.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// Ids of successfully dispatched commits, in dispatch order.
    ///
    /// # Panics
    ///
    /// Panics if the record lock is poisoned.
    #[must_use]
    pub fn dispatched_ids(&self) -> Vec<Uuid> {
        self.dispatched
            .lock()
            .expect("dispatch record lock poisoned")
            .clone()
    }

    #[must_use]
    pub fn dispose_count(&self) -> usize {
        self.disposed.load(Ordering::Acquire)
    }

    /// Wait until at least `count` commits were dispatched. Returns `false`
    /// on timeout.
    pub async fn wait_for_dispatches(&self, count: usize, timeout: Duration) -> bool {
        let mut receiver = self.count.subscribe();
        matches!(
            tokio::time::timeout(timeout, receiver.wait_for(|seen| *seen >= count)).await,
            Ok(Ok(_))
        )
    }
}

impl DispatchCommits for RecordingDispatcher {
    fn dispatch(&self, commit: &Commit) -> Result<(), BoxError> {
        if self.failing {
            return Err(format!("refusing commit {}", commit.commit_id).into());
        }
        self.dispatched
            .lock()
            .expect("dispatch record lock poisoned")
            .push(commit.commit_id);
        self.count.send_modify(|seen| *seen += 1);
        Ok(())
    }

    fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::AcqRel);
    }
}
