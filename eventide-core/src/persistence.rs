//! Storage engine contract.
//!
//! [`Persistence`] is the collaborator the core relies on for durability and
//! for the final word on conflicts. The store and stream layers add ordering,
//! early conflict detection and notification on top of it. A reference
//! in-memory engine lives in [`inmemory`].

use std::future::Future;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    checkpoint::{Checkpoint, CheckpointParseError},
    commit::{Commit, CommitAttempt, Snapshot, StreamHead},
    concurrency::{ConcurrencyConflict, DuplicateCommit},
    dispatch::DispatchError,
};

pub mod inmemory;

/// Boxed error for engine-specific failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Underlying storage fault.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The engine (or the store wrapping it) has been disposed.
    #[error("storage has been disposed")]
    Disposed,
    /// An attempt implies commits that were never written.
    #[error(
        "stream `{stream_id}` in bucket `{bucket_id}` is inconsistent: {detail} (hint: an \
         intermediate commit is missing)"
    )]
    Corruption {
        bucket_id: String,
        stream_id: String,
        detail: String,
    },
    #[error(transparent)]
    InvalidCheckpoint(#[from] CheckpointParseError),
    #[error("storage backend error: {0}")]
    Backend(#[source] BoxError),
}

impl StorageError {
    pub fn backend(err: impl Into<BoxError>) -> Self {
        Self::Backend(err.into())
    }
}

/// Outcome of writing a commit, as a tagged union the callers branch on.
#[derive(Debug, Error)]
pub enum CommitError {
    /// A competing writer got there first; reload and retry.
    #[error(transparent)]
    Conflict(#[from] ConcurrencyConflict),
    /// The commit id was already persisted.
    #[error(transparent)]
    Duplicate(#[from] DuplicateCommit),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// The commit is durable but handing it to the dispatcher failed.
    #[error("commit persisted but dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Durable storage for commits and snapshots.
///
/// Every method fails with [`StorageError::Disposed`] once
/// [`dispose`](Persistence::dispose) has been called. Engines must enforce the
/// per-stream uniqueness of revisions, sequences and commit ids themselves:
/// the pipeline's tracking hook only catches conflicts it has already seen.
// ANCHOR: persistence_trait
pub trait Persistence: Send + Sync {
    /// Engine-specific ordering token behind [`Commit::checkpoint_token`].
    type Checkpoint: Checkpoint;

    /// Prepare the engine for use. Must be safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the engine cannot be prepared.
    fn initialize(&self) -> impl Future<Output = Result<(), StorageError>> + Send + '_;

    /// Durably write an attempt, assigning it the next checkpoint.
    ///
    /// # Errors
    ///
    /// [`CommitError::Duplicate`] when the commit id is already stored for the
    /// stream, [`CommitError::Conflict`] when the revision or sequence is
    /// taken, [`CommitError::Storage`] for anything else.
    fn commit(
        &self,
        attempt: CommitAttempt,
    ) -> impl Future<Output = Result<Commit, CommitError>> + Send + '_;

    /// Commits of one stream touching revisions `min_revision..=max_revision`,
    /// ascending.
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
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + 'a;

    /// Commits with a checkpoint strictly after `checkpoint_token` (or from the
    /// beginning when `None`), ascending by checkpoint. `bucket_id` of `None`
    /// reads across every bucket.
    ///
    /// # Errors
    ///
    /// [`StorageError::InvalidCheckpoint`] for an unparseable token.
    fn get_from_checkpoint<'a>(
        &'a self,
        bucket_id: Option<&'a str>,
        checkpoint_token: Option<&'a str>,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + 'a;

    /// Commits of a bucket stamped at or after `start`.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the read fails.
    fn get_from_date<'a>(
        &'a self,
        bucket_id: &'a str,
        start: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + 'a;

    /// Commits of a bucket stamped in `start..end`.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the read fails.
    fn get_from_to<'a>(
        &'a self,
        bucket_id: &'a str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + 'a;

    /// Commits not yet marked as dispatched, in checkpoint order.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the read fails.
    fn get_undispatched_commits(
        &self,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + '_;

    /// # Errors
    ///
    /// Returns a storage error when the update fails.
    fn mark_commit_as_dispatched<'a>(
        &'a self,
        commit: &'a Commit,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + 'a;

    /// Heads of streams at least `max_threshold` revisions past their latest
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the read fails.
    fn get_streams_to_snapshot<'a>(
        &'a self,
        bucket_id: &'a str,
        max_threshold: u64,
    ) -> impl Future<Output = Result<Vec<StreamHead>, StorageError>> + Send + 'a;

    /// Store a snapshot. Returns `false` when the engine declined it.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the write fails.
    fn add_snapshot(
        &self,
        snapshot: Snapshot,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send + '_;

    /// The most recent snapshot at or below `max_revision`.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the read fails.
    fn get_snapshot<'a>(
        &'a self,
        bucket_id: &'a str,
        stream_id: &'a str,
        max_revision: u64,
    ) -> impl Future<Output = Result<Option<Snapshot>, StorageError>> + Send + 'a;

    /// Remove every commit, snapshot and head in every bucket.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the purge fails.
    fn purge(&self) -> impl Future<Output = Result<(), StorageError>> + Send + '_;

    /// # Errors
    ///
    /// Returns a storage error when the purge fails.
    fn purge_bucket<'a>(
        &'a self,
        bucket_id: &'a str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + 'a;

    /// # Errors
    ///
    /// Returns a storage error when the delete fails.
    fn delete_stream<'a>(
        &'a self,
        bucket_id: &'a str,
        stream_id: &'a str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + 'a;

    /// Release the engine. Idempotent.
    fn dispose(&self);

    fn is_disposed(&self) -> bool;
}
// ANCHOR_END: persistence_trait
