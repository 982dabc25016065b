//! The optimistic event store.
//!
//! [`OptimisticEventStore`] sits between application code and a
//! [`Persistence`] engine. Every write runs the pipeline's pre-commit hooks,
//! goes to storage, runs the post-commit hooks and is then handed to the
//! dispatch scheduler. Every read comes back through the pipeline's `select`.
//!
//! # Example
//!
//! ```ignore
//! use eventide_core::{persistence::inmemory::InMemoryPersistence, store::OptimisticEventStore};
//!
//! let store = OptimisticEventStore::new(InMemoryPersistence::new());
//! let mut stream = store.create_stream(DEFAULT_BUCKET, "order-17")?;
//! stream.add(EventMessage::new(json!({ "placed": true })))?;
//! stream.commit_changes(Uuid::new_v4()).await?;
//! ```

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Utc};

use crate::{
    clock::{Clock, SystemClock},
    commit::{Commit, CommitAttempt, Snapshot},
    dispatch::{DispatchError, DispatchScheduler, NoopDispatchScheduler},
    persistence::{CommitError, Persistence, StorageError},
    pipeline::{Pipeline, PipelineHook, SelectedCommits, tracking::CommitTracker},
    stream::{CommitEvents, OptimisticEventStream, StreamError},
};

pub mod advanced;

pub use advanced::PipelineAwarePersistence;

/// Store applying optimistic concurrency over a [`Persistence`] engine.
///
/// `D` is the dispatch scheduler; by default commits are not dispatched.
pub struct OptimisticEventStore<P, D = NoopDispatchScheduler> {
    persistence: P,
    pipeline: Pipeline,
    scheduler: D,
    clock: Arc<dyn Clock>,
    disposed: AtomicBool,
}

impl<P> OptimisticEventStore<P>
where
    P: Persistence,
{
    /// A store with a fresh, unbounded [`CommitTracker`] as its first hook.
    #[must_use]
    pub fn new(persistence: P) -> Self {
        Self::with_tracker(persistence, Arc::new(CommitTracker::new()))
    }

    /// A store using `tracker` as its first hook.
    ///
    /// Share one tracker between stores over the same engine so each sees the
    /// other's commits.
    #[must_use]
    pub fn with_tracker(persistence: P, tracker: Arc<CommitTracker>) -> Self {
        let mut store = Self::without_tracking(persistence);
        store.pipeline.push(tracker);
        store
    }

    /// A store with an empty pipeline. Conflicts are only caught by the engine.
    #[must_use]
    pub fn without_tracking(persistence: P) -> Self {
        Self {
            persistence,
            pipeline: Pipeline::new(),
            scheduler: NoopDispatchScheduler,
            clock: Arc::new(SystemClock),
            disposed: AtomicBool::new(false),
        }
    }
}

impl<P, D> OptimisticEventStore<P, D>
where
    P: Persistence,
    D: DispatchScheduler,
{
    /// Append a hook; hooks run in registration order.
    #[must_use]
    pub fn with_hook(mut self, hook: Arc<dyn PipelineHook>) -> Self {
        self.pipeline.push(hook);
        self
    }

    /// Time source for the stamps of commits built by streams.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Hand every persisted commit to `scheduler`.
    ///
    /// The scheduler is not started; see
    /// [`start_dispatch_scheduler`](Self::start_dispatch_scheduler).
    #[must_use]
    pub fn with_dispatch_scheduler<S>(self, scheduler: S) -> OptimisticEventStore<P, S>
    where
        S: DispatchScheduler,
    {
        OptimisticEventStore {
            persistence: self.persistence,
            pipeline: self.pipeline,
            scheduler,
            clock: self.clock,
            disposed: self.disposed,
        }
    }

    /// Start the dispatch scheduler, dispatching anything left undispatched.
    ///
    /// # Errors
    ///
    /// Returns the scheduler's error if storage or the dispatch target fails.
    pub async fn start_dispatch_scheduler(&self) -> Result<(), DispatchError> {
        self.scheduler.start().await
    }

    #[must_use]
    pub const fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The engine behind the store, for operations the store does not wrap
    /// (snapshots, stream heads). Reads still pass through the pipeline and
    /// destructive calls still notify it.
    #[must_use]
    pub const fn advanced(&self) -> PipelineAwarePersistence<'_, P> {
        PipelineAwarePersistence::new(&self.persistence, &self.pipeline)
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_disposed() {
            return Err(StorageError::Disposed);
        }
        Ok(())
    }

    /// Write a commit attempt through the pipeline.
    ///
    /// Returns `Ok(None)` without touching storage when a pre-commit hook
    /// declines the attempt.
    ///
    /// # Errors
    ///
    /// Conflict, duplicate and storage errors come back from the hooks or the
    /// engine unmodified. [`CommitError::Dispatch`] means the commit is durable
    /// but the scheduler could not take it.
    #[tracing::instrument(
        skip(self, attempt),
        fields(
            bucket_id = %attempt.bucket_id,
            stream_id = %attempt.stream_id,
            commit_id = %attempt.commit_id,
            commit_sequence = attempt.commit_sequence,
            stream_revision = attempt.stream_revision,
        )
    )]
    pub async fn commit(&self, attempt: CommitAttempt) -> Result<Option<Commit>, CommitError> {
        self.ensure_open()?;
        if !self.pipeline.pre_commit(&attempt)? {
            tracing::debug!("commit attempt declined by pre-commit hook");
            return Ok(None);
        }

        let commit = self.persistence.commit(attempt).await?;
        tracing::debug!(checkpoint = %commit.checkpoint_token, "commit persisted");

        self.pipeline.post_commit(&commit);
        self.scheduler.schedule_dispatch(&commit).await?;
        Ok(Some(commit))
    }

    /// An empty stream, ready for its first commit.
    ///
    /// # Errors
    ///
    /// [`StreamError::Storage`] once the store is disposed.
    pub fn create_stream(
        &self,
        bucket_id: impl Into<String>,
        stream_id: impl Into<String>,
    ) -> Result<OptimisticEventStream<'_, Self>, StreamError> {
        self.ensure_open()?;
        Ok(OptimisticEventStream::new(
            bucket_id,
            stream_id,
            self,
            Arc::clone(&self.clock),
        ))
    }

    /// Open a stream holding the events from `min_revision` to `max_revision`
    /// (`0` for the head).
    ///
    /// # Errors
    ///
    /// [`StreamError::NotFound`] when `min_revision > 0` and the stream has no
    /// such commits; [`StreamError::Storage`] when the read fails.
    pub async fn open_stream(
        &self,
        bucket_id: &str,
        stream_id: &str,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<OptimisticEventStream<'_, Self>, StreamError> {
        self.ensure_open()?;
        OptimisticEventStream::open(
            bucket_id,
            stream_id,
            self,
            Arc::clone(&self.clock),
            min_revision,
            max_revision,
        )
        .await
    }

    /// Open a stream from a snapshot, loading only the events after it.
    ///
    /// # Errors
    ///
    /// [`StreamError::Storage`] when the read fails.
    pub async fn open_stream_from_snapshot(
        &self,
        snapshot: &Snapshot,
        max_revision: u64,
    ) -> Result<OptimisticEventStream<'_, Self>, StreamError> {
        self.ensure_open()?;
        OptimisticEventStream::open_from_snapshot(
            snapshot,
            self,
            Arc::clone(&self.clock),
            max_revision,
        )
        .await
    }

    /// Commits of one stream touching `min_revision..=max_revision`.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the read fails.
    pub async fn get_from(
        &self,
        bucket_id: &str,
        stream_id: &str,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<SelectedCommits, StorageError> {
        self.ensure_open()?;
        let commits = self
            .persistence
            .get_from(bucket_id, stream_id, min_revision, max_revision)
            .await?;
        Ok(self.pipeline.selected(commits))
    }

    /// Commits after `checkpoint_token` across one bucket, or every bucket
    /// when `bucket_id` is `None`.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidCheckpoint`] for a token the engine cannot parse.
    pub async fn get_from_checkpoint(
        &self,
        bucket_id: Option<&str>,
        checkpoint_token: Option<&str>,
    ) -> Result<SelectedCommits, StorageError> {
        self.ensure_open()?;
        let commits = self
            .persistence
            .get_from_checkpoint(bucket_id, checkpoint_token)
            .await?;
        Ok(self.pipeline.selected(commits))
    }

    /// # Errors
    ///
    /// Returns a storage error when the read fails.
    pub async fn get_from_date(
        &self,
        bucket_id: &str,
        start: DateTime<Utc>,
    ) -> Result<SelectedCommits, StorageError> {
        self.ensure_open()?;
        let commits = self.persistence.get_from_date(bucket_id, start).await?;
        Ok(self.pipeline.selected(commits))
    }

    /// # Errors
    ///
    /// Returns a storage error when the read fails.
    pub async fn get_from_to(
        &self,
        bucket_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<SelectedCommits, StorageError> {
        self.ensure_open()?;
        let commits = self.persistence.get_from_to(bucket_id, start, end).await?;
        Ok(self.pipeline.selected(commits))
    }

    /// # Errors
    ///
    /// Returns a storage error when the read fails.
    pub async fn get_undispatched_commits(&self) -> Result<SelectedCommits, StorageError> {
        self.ensure_open()?;
        let commits = self.persistence.get_undispatched_commits().await?;
        Ok(self.pipeline.selected(commits))
    }

    /// Remove everything in every bucket.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the purge fails; hooks are not notified.
    #[tracing::instrument(skip(self))]
    pub async fn purge(&self) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.advanced().purge().await?;
        tracing::debug!("all buckets purged");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns a storage error when the purge fails; hooks are not notified.
    #[tracing::instrument(skip(self))]
    pub async fn purge_bucket(&self, bucket_id: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.advanced().purge_bucket(bucket_id).await?;
        tracing::debug!("bucket purged");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns a storage error when the delete fails; hooks are not notified.
    #[tracing::instrument(skip(self))]
    pub async fn delete_stream(&self, bucket_id: &str, stream_id: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        self.advanced().delete_stream(bucket_id, stream_id).await?;
        tracing::debug!("stream deleted");
        Ok(())
    }

    /// Dispose the dispatch scheduler and the engine. Idempotent.
    ///
    /// Schedulers release the engine themselves; the store only disposes it
    /// when the scheduler has not.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("disposing event store");
        self.scheduler.dispose();
        if !self.persistence.is_disposed() {
            self.persistence.dispose();
        }
    }
}

impl<P, D> CommitEvents for OptimisticEventStore<P, D>
where
    P: Persistence,
    D: DispatchScheduler,
{
    type Commits = SelectedCommits;

    fn get_from<'a>(
        &'a self,
        bucket_id: &'a str,
        stream_id: &'a str,
        min_revision: u64,
        max_revision: u64,
    ) -> impl Future<Output = Result<SelectedCommits, StorageError>> + Send + 'a {
        Self::get_from(self, bucket_id, stream_id, min_revision, max_revision)
    }

    fn commit(
        &self,
        attempt: CommitAttempt,
    ) -> impl Future<Output = Result<Option<Commit>, CommitError>> + Send + '_ {
        Self::commit(self, attempt)
    }
}
