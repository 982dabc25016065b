//! Read-append view of a single stream.
//!
//! An [`OptimisticEventStream`] holds the committed events of a revision range
//! plus the caller's uncommitted events. Committing builds a
//! [`CommitAttempt`] positioned right after the known head; if another writer
//! got there first, the stream reloads what it missed before reporting the
//! conflict, so the caller can inspect the new state and retry.
//!
//! # Example
//!
//! ```ignore
//! let mut stream = store.open_stream(DEFAULT_BUCKET, "account-7", 0, 0).await?;
//! stream.add(EventMessage::new(json!({ "deposited": 50 })))?;
//! stream.commit_changes(Uuid::new_v4()).await?;
//! ```

use std::{collections::HashSet, future::Future, sync::Arc};

use nonempty::NonEmpty;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    clock::Clock,
    commit::{Commit, CommitAttempt, EventMessage, Headers, Snapshot},
    concurrency::{ConcurrencyConflict, DuplicateCommit},
    dispatch::DispatchError,
    persistence::{CommitError, StorageError},
};

/// The read and write operations a stream needs from its owner.
///
/// Implemented by [`OptimisticEventStore`](crate::store::OptimisticEventStore),
/// which routes both through the commit pipeline.
pub trait CommitEvents: Send + Sync {
    /// Commits returned by [`get_from`](CommitEvents::get_from).
    type Commits: IntoIterator<Item = Commit> + Send;

    /// Commits of one stream touching revisions `min_revision..=max_revision`.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the read fails.
    fn get_from<'a>(
        &'a self,
        bucket_id: &'a str,
        stream_id: &'a str,
        min_revision: u64,
        max_revision: u64,
    ) -> impl Future<Output = Result<Self::Commits, StorageError>> + Send + 'a;

    /// Write an attempt. `Ok(None)` means a pre-commit hook declined it.
    ///
    /// # Errors
    ///
    /// Conflict, duplicate, storage and dispatch failures.
    fn commit(
        &self,
        attempt: CommitAttempt,
    ) -> impl Future<Output = Result<Option<Commit>, CommitError>> + Send + '_;
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error(
        "stream `{stream_id}` in bucket `{bucket_id}` has no commits at or above revision \
         {min_revision}"
    )]
    NotFound {
        bucket_id: String,
        stream_id: String,
        min_revision: u64,
    },
    #[error("event stream has been disposed")]
    Disposed,
    #[error(transparent)]
    Conflict(ConcurrencyConflict),
    #[error(transparent)]
    Duplicate(DuplicateCommit),
    #[error("storage error: {0}")]
    Storage(#[source] StorageError),
    #[error("dispatch error: {0}")]
    Dispatch(#[source] DispatchError),
}

impl From<CommitError> for StreamError {
    fn from(err: CommitError) -> Self {
        match err {
            CommitError::Conflict(conflict) => Self::Conflict(conflict),
            CommitError::Duplicate(duplicate) => Self::Duplicate(duplicate),
            CommitError::Storage(storage) => Self::Storage(storage),
            CommitError::Dispatch(dispatch) => Self::Dispatch(dispatch),
        }
    }
}

impl From<StorageError> for StreamError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}

/// Committed history plus pending changes for one stream.
pub struct OptimisticEventStream<'a, C> {
    bucket_id: String,
    stream_id: String,
    commits: &'a C,
    clock: Arc<dyn Clock>,
    committed: Vec<EventMessage>,
    committed_headers: Headers,
    uncommitted: Vec<EventMessage>,
    uncommitted_headers: Headers,
    identifiers: HashSet<Uuid>,
    stream_revision: u64,
    commit_sequence: u64,
    disposed: bool,
}

impl<'a, C: CommitEvents> OptimisticEventStream<'a, C> {
    /// An empty stream at revision 0.
    pub fn new(
        bucket_id: impl Into<String>,
        stream_id: impl Into<String>,
        commits: &'a C,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            stream_id: stream_id.into(),
            commits,
            clock,
            committed: Vec::new(),
            committed_headers: Headers::new(),
            uncommitted: Vec::new(),
            uncommitted_headers: Headers::new(),
            identifiers: HashSet::new(),
            stream_revision: 0,
            commit_sequence: 0,
            disposed: false,
        }
    }

    /// Load the events between `min_revision` and `max_revision`, inclusive.
    ///
    /// A `max_revision` of `0` means "up to the head".
    ///
    /// # Errors
    ///
    /// [`StreamError::NotFound`] when `min_revision > 0` and nothing was
    /// read; [`StreamError::Storage`] when the read fails.
    #[tracing::instrument(skip(commits, clock))]
    pub async fn open(
        bucket_id: &str,
        stream_id: &str,
        commits: &'a C,
        clock: Arc<dyn Clock>,
        min_revision: u64,
        max_revision: u64,
    ) -> Result<Self, StreamError> {
        let max_revision = effective_max(max_revision);
        let mut stream = Self::new(bucket_id, stream_id, commits, clock);
        let loaded = commits
            .get_from(bucket_id, stream_id, min_revision, max_revision)
            .await?;
        let read = stream.populate(min_revision, max_revision, loaded);

        if read == 0 && min_revision > 0 {
            return Err(StreamError::NotFound {
                bucket_id: bucket_id.to_owned(),
                stream_id: stream_id.to_owned(),
                min_revision,
            });
        }
        tracing::debug!(
            stream_revision = stream.stream_revision,
            commit_sequence = stream.commit_sequence,
            events = stream.committed.len(),
            "stream opened"
        );
        Ok(stream)
    }

    /// Load the events after `snapshot` up to `max_revision` (`0` for the head).
    ///
    /// # Errors
    ///
    /// [`StreamError::Storage`] when the read fails.
    #[tracing::instrument(
        skip(snapshot, commits, clock),
        fields(
            bucket_id = %snapshot.bucket_id,
            stream_id = %snapshot.stream_id,
            snapshot_revision = snapshot.stream_revision,
        )
    )]
    pub async fn open_from_snapshot(
        snapshot: &Snapshot,
        commits: &'a C,
        clock: Arc<dyn Clock>,
        max_revision: u64,
    ) -> Result<Self, StreamError> {
        let max_revision = effective_max(max_revision);
        let mut stream = Self::new(&snapshot.bucket_id, &snapshot.stream_id, commits, clock);
        let loaded = commits
            .get_from(
                &snapshot.bucket_id,
                &snapshot.stream_id,
                snapshot.stream_revision,
                max_revision,
            )
            .await?;
        stream.populate(snapshot.stream_revision + 1, max_revision, loaded);
        stream.stream_revision = snapshot.stream_revision + stream.committed.len() as u64;
        Ok(stream)
    }

    #[must_use]
    pub fn bucket_id(&self) -> &str {
        &self.bucket_id
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub const fn stream_revision(&self) -> u64 {
        self.stream_revision
    }

    #[must_use]
    pub const fn commit_sequence(&self) -> u64 {
        self.commit_sequence
    }

    #[must_use]
    pub fn committed_events(&self) -> &[EventMessage] {
        &self.committed
    }

    #[must_use]
    pub const fn committed_headers(&self) -> &Headers {
        &self.committed_headers
    }

    #[must_use]
    pub fn uncommitted_events(&self) -> &[EventMessage] {
        &self.uncommitted
    }

    #[must_use]
    pub const fn uncommitted_headers(&self) -> &Headers {
        &self.uncommitted_headers
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    /// Queue an event. Messages without a body are ignored.
    ///
    /// # Errors
    ///
    /// [`StreamError::Disposed`] after [`dispose`](Self::dispose).
    pub fn add(&mut self, event: EventMessage) -> Result<(), StreamError> {
        self.ensure_open()?;
        if event.body.is_none() {
            tracing::trace!("ignoring event without a body");
            return Ok(());
        }
        self.uncommitted.push(event);
        Ok(())
    }

    /// Set a header for the next commit.
    ///
    /// # Errors
    ///
    /// [`StreamError::Disposed`] after [`dispose`](Self::dispose).
    pub fn set_header(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), StreamError> {
        self.ensure_open()?;
        self.uncommitted_headers.insert(key.into(), value);
        Ok(())
    }

    /// Drop every uncommitted event and header.
    ///
    /// # Errors
    ///
    /// [`StreamError::Disposed`] after [`dispose`](Self::dispose).
    pub fn clear_changes(&mut self) -> Result<(), StreamError> {
        self.ensure_open()?;
        self.uncommitted.clear();
        self.uncommitted_headers.clear();
        Ok(())
    }

    /// Persist the uncommitted events as one commit.
    ///
    /// Without uncommitted events this does nothing. If a pre-commit hook
    /// declines the attempt, the stream is left exactly as it was.
    ///
    /// # Errors
    ///
    /// - [`StreamError::Duplicate`] if `commit_id` was already read into this
    ///   stream (storage is not called),
    /// - [`StreamError::Conflict`] if another writer advanced the stream; the
    ///   stream has already reloaded the commits it missed and keeps its
    ///   uncommitted events,
    /// - [`StreamError::Storage`] / [`StreamError::Dispatch`] otherwise.
    #[tracing::instrument(
        skip(self),
        fields(bucket_id = %self.bucket_id, stream_id = %self.stream_id)
    )]
    pub async fn commit_changes(&mut self, commit_id: Uuid) -> Result<(), StreamError> {
        self.ensure_open()?;
        if self.identifiers.contains(&commit_id) {
            return Err(StreamError::Duplicate(DuplicateCommit {
                bucket_id: self.bucket_id.clone(),
                stream_id: self.stream_id.clone(),
                commit_id,
            }));
        }
        let Some(attempt) = self.build_attempt(commit_id) else {
            tracing::trace!("no uncommitted events; nothing to commit");
            return Ok(());
        };

        let target_revision = attempt.stream_revision;
        match self.commits.commit(attempt).await {
            Ok(Some(commit)) => {
                self.populate(self.stream_revision + 1, target_revision, [commit]);
                self.uncommitted.clear();
                self.uncommitted_headers.clear();
                tracing::debug!(
                    stream_revision = self.stream_revision,
                    commit_sequence = self.commit_sequence,
                    "changes committed"
                );
                Ok(())
            }
            Ok(None) => {
                tracing::debug!("commit declined by pipeline");
                Ok(())
            }
            Err(CommitError::Conflict(conflict)) => {
                tracing::debug!(error = %conflict, "conflict detected; reloading stream");
                let from = self.stream_revision + 1;
                let missed = self
                    .commits
                    .get_from(&self.bucket_id, &self.stream_id, from, u64::MAX)
                    .await?;
                self.populate(from, u64::MAX, missed);
                Err(StreamError::Conflict(conflict))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Mark the stream unusable. Idempotent.
    pub fn dispose(&mut self) {
        self.disposed = true;
    }

    #[must_use]
    pub const fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn ensure_open(&self) -> Result<(), StreamError> {
        if self.disposed {
            return Err(StreamError::Disposed);
        }
        Ok(())
    }

    fn build_attempt(&self, commit_id: Uuid) -> Option<CommitAttempt> {
        let events = NonEmpty::from_vec(self.uncommitted.clone())?;
        Some(CommitAttempt {
            bucket_id: self.bucket_id.clone(),
            stream_id: self.stream_id.clone(),
            stream_revision: self.stream_revision + events.len() as u64,
            commit_id,
            commit_sequence: self.commit_sequence + 1,
            commit_stamp: self.clock.now(),
            headers: self.uncommitted_headers.clone(),
            events,
        })
    }

    /// Merge `commits` into committed state, keeping only events with a
    /// revision in `min_revision..=max_revision`. Returns how many commits
    /// were read.
    fn populate(
        &mut self,
        min_revision: u64,
        max_revision: u64,
        commits: impl IntoIterator<Item = Commit>,
    ) -> usize {
        let mut read = 0;
        for commit in commits {
            read += 1;
            self.identifiers.insert(commit.commit_id);
            self.commit_sequence = commit.commit_sequence;

            let mut revision = commit.first_revision();
            if revision > max_revision {
                return read;
            }
            self.committed_headers.extend(commit.headers);

            for event in commit.events {
                if revision > max_revision {
                    break;
                }
                if revision >= min_revision {
                    self.committed.push(event);
                    self.stream_revision = revision;
                }
                revision += 1;
            }
        }
        read
    }
}

fn effective_max(max_revision: u64) -> u64 {
    if max_revision == 0 {
        u64::MAX
    } else {
        max_revision
    }
}
