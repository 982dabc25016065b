//! Conflict and duplicate-commit errors.
//!
//! Both are produced either by the storage engine (the source of truth) or,
//! earlier and without I/O, by the
//! [`CommitTracker`](crate::pipeline::tracking::CommitTracker) hook.

use thiserror::Error;
use uuid::Uuid;

use crate::commit::CommitAttempt;

/// Position of a commit within its stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct StreamPosition {
    pub revision: u64,
    pub sequence: u64,
}

/// Another writer already advanced the stream past the attempt's target.
///
/// Recoverable: reload the stream and retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", format_conflict(self))]
pub struct ConcurrencyConflict {
    pub bucket_id: String,
    pub stream_id: String,
    /// The position the attempt tried to write.
    pub attempted: StreamPosition,
    /// The head that was already known, when the detector knows it.
    pub known: Option<StreamPosition>,
}

impl ConcurrencyConflict {
    #[must_use]
    pub fn for_attempt(attempt: &CommitAttempt, known: Option<StreamPosition>) -> Self {
        Self {
            bucket_id: attempt.bucket_id.clone(),
            stream_id: attempt.stream_id.clone(),
            attempted: StreamPosition {
                revision: attempt.stream_revision,
                sequence: attempt.commit_sequence,
            },
            known,
        }
    }
}

fn format_conflict(conflict: &ConcurrencyConflict) -> String {
    let ConcurrencyConflict {
        bucket_id,
        stream_id,
        attempted,
        known,
    } = conflict;
    match known {
        Some(known) => format!(
            "concurrency conflict on stream `{stream_id}` in bucket `{bucket_id}`: attempted \
             revision {} / sequence {}, but head is already at revision {} / sequence {} (hint: \
             stream was modified; reload and retry)",
            attempted.revision, attempted.sequence, known.revision, known.sequence
        ),
        None => format!(
            "concurrency conflict on stream `{stream_id}` in bucket `{bucket_id}`: revision {} / \
             sequence {} is already taken (hint: reload and retry)",
            attempted.revision, attempted.sequence
        ),
    }
}

/// The exact commit (by id) has already been persisted.
///
/// Retrying with the same id can never succeed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error(
    "duplicate commit {commit_id} on stream `{stream_id}` in bucket `{bucket_id}` (hint: the \
     commit was already applied; use a new commit id for new changes)"
)]
pub struct DuplicateCommit {
    pub bucket_id: String,
    pub stream_id: String,
    pub commit_id: Uuid,
}

impl DuplicateCommit {
    #[must_use]
    pub fn for_attempt(attempt: &CommitAttempt) -> Self {
        Self {
            bucket_id: attempt.bucket_id.clone(),
            stream_id: attempt.stream_id.clone(),
            commit_id: attempt.commit_id,
        }
    }
}
