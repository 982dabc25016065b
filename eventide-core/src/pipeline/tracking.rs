//! Optimistic conflict detection without storage I/O.
//!
//! [`CommitTracker`] remembers the most recent commits of each stream it has
//! seen (written through the store, or read back from storage) and rejects
//! attempts that obviously cannot succeed before they reach the engine. It is
//! only an early filter: entries may be evicted or missing after a restart,
//! so the engine's own constraint check stays authoritative.

use std::{
    collections::{BTreeMap, HashMap},
    num::NonZeroUsize,
    sync::Mutex,
};

use uuid::Uuid;

use crate::{
    commit::{Commit, CommitAttempt, StreamKey},
    concurrency::{ConcurrencyConflict, DuplicateCommit, StreamPosition},
    persistence::{CommitError, StorageError},
    pipeline::PipelineHook,
};

/// How many recent commits are remembered per stream.
pub const RECENT_COMMITS_PER_STREAM: usize = 16;

/// Bounded, bucket-aware table of recently seen commits.
#[derive(Debug, Default)]
pub struct CommitTracker {
    table: Mutex<TrackedStreams>,
}

impl CommitTracker {
    /// A tracker that never evicts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracker holding at most `max_streams` distinct streams, evicting the
    /// least recently used one when full.
    #[must_use]
    pub fn with_max_streams(max_streams: NonZeroUsize) -> Self {
        Self {
            table: Mutex::new(TrackedStreams {
                max_streams: Some(max_streams),
                ..TrackedStreams::default()
            }),
        }
    }

    /// Record `commit` in the history of its stream.
    ///
    /// The history keeps the highest commit sequences seen, so reading old
    /// commits never pushes out the head.
    pub fn track(&self, commit: &Commit) {
        let mut table = self.lock();
        let entry = table.touch(commit.stream_key());
        if entry.values().any(|seen| seen.commit_id == commit.commit_id) {
            return;
        }
        entry.insert(commit.commit_sequence, TrackedCommit::from(commit));
        if entry.len() > RECENT_COMMITS_PER_STREAM {
            entry.pop_first();
        }
    }

    /// Whether this exact commit (same bucket, stream and id) has been tracked.
    #[must_use]
    pub fn contains(&self, commit: &Commit) -> bool {
        self.lock()
            .streams
            .get(&commit.stream_key())
            .is_some_and(|entry| {
                entry
                    .commits
                    .values()
                    .any(|seen| seen.commit_id == commit.commit_id)
            })
    }

    /// Check an attempt against the tracked head of its stream.
    ///
    /// # Errors
    ///
    /// - [`CommitError::Duplicate`] if the commit id was already tracked,
    /// - [`CommitError::Conflict`] if the revision or sequence is at or behind
    ///   the tracked head,
    /// - [`CommitError::Storage`] if the attempt skips past the head, which
    ///   would leave a gap in the stream.
    pub fn validate_attempt(&self, attempt: &CommitAttempt) -> Result<(), CommitError> {
        let table = self.lock();
        let Some(entry) = table.streams.get(&attempt.stream_key()) else {
            return Ok(());
        };

        if entry
            .commits
            .values()
            .any(|seen| seen.commit_id == attempt.commit_id)
        {
            return Err(DuplicateCommit::for_attempt(attempt).into());
        }

        let Some((_, head)) = entry.commits.last_key_value() else {
            return Ok(());
        };
        let head = head.position;

        if attempt.commit_sequence <= head.sequence || attempt.stream_revision <= head.revision {
            return Err(ConcurrencyConflict::for_attempt(attempt, Some(head)).into());
        }

        let event_count = attempt.events.len() as u64;
        if attempt.commit_sequence > head.sequence + 1 {
            return Err(gap(attempt, format!(
                "commit sequence {} skips past tracked head sequence {}",
                attempt.commit_sequence, head.sequence
            )));
        }
        if attempt.stream_revision > head.revision + event_count {
            return Err(gap(attempt, format!(
                "stream revision {} with {event_count} event(s) skips past tracked head \
                 revision {}",
                attempt.stream_revision, head.revision
            )));
        }
        Ok(())
    }

    /// Forget every stream, or every stream of one bucket.
    pub fn purge(&self, bucket_id: Option<&str>) {
        let mut table = self.lock();
        match bucket_id {
            None => table.clear(),
            Some(bucket_id) => table.retain(|key| key.bucket_id != bucket_id),
        }
    }

    pub fn delete_stream(&self, bucket_id: &str, stream_id: &str) {
        self.lock().retain(|key| !key.matches(bucket_id, stream_id));
    }

    /// Number of distinct streams currently tracked.
    #[must_use]
    pub fn tracked_streams(&self) -> usize {
        self.lock().streams.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackedStreams> {
        self.table.lock().expect("commit tracker lock poisoned")
    }
}

fn gap(attempt: &CommitAttempt, detail: String) -> CommitError {
    StorageError::Corruption {
        bucket_id: attempt.bucket_id.clone(),
        stream_id: attempt.stream_id.clone(),
        detail,
    }
    .into()
}

impl PipelineHook for CommitTracker {
    fn select(&self, commit: Commit) -> Option<Commit> {
        self.track(&commit);
        Some(commit)
    }

    fn pre_commit(&self, attempt: &CommitAttempt) -> Result<bool, CommitError> {
        self.validate_attempt(attempt)?;
        Ok(true)
    }

    fn post_commit(&self, commit: &Commit) {
        self.track(commit);
    }

    fn on_purge(&self, bucket_id: Option<&str>) {
        self.purge(bucket_id);
    }

    fn on_delete_stream(&self, bucket_id: &str, stream_id: &str) {
        self.delete_stream(bucket_id, stream_id);
    }
}

#[derive(Clone, Copy, Debug)]
struct TrackedCommit {
    position: StreamPosition,
    commit_id: Uuid,
}

impl From<&Commit> for TrackedCommit {
    fn from(commit: &Commit) -> Self {
        Self {
            position: StreamPosition {
                revision: commit.stream_revision,
                sequence: commit.commit_sequence,
            },
            commit_id: commit.commit_id,
        }
    }
}

#[derive(Debug, Default)]
struct TrackedStream {
    /// Keyed by commit sequence.
    commits: BTreeMap<u64, TrackedCommit>,
    last_used: u64,
}

/// LRU map: `streams` holds the entries, `recency` orders keys by last use.
#[derive(Debug, Default)]
struct TrackedStreams {
    streams: HashMap<StreamKey, TrackedStream>,
    recency: BTreeMap<u64, StreamKey>,
    clock: u64,
    max_streams: Option<NonZeroUsize>,
}

impl TrackedStreams {
    /// Fetch or create the entry for `key`, marking it most recently used.
    ///
    /// Creating an entry may evict the least recently used other stream.
    fn touch(&mut self, key: StreamKey) -> &mut BTreeMap<u64, TrackedCommit> {
        self.clock += 1;
        let now = self.clock;
        if let Some(previous) = self.streams.get(&key).map(|entry| entry.last_used) {
            self.recency.remove(&previous);
        }
        self.recency.insert(now, key.clone());
        self.streams.entry(key.clone()).or_default().last_used = now;
        self.evict_overflow();
        &mut self.streams.entry(key).or_default().commits
    }

    fn evict_overflow(&mut self) {
        let Some(max) = self.max_streams else {
            return;
        };
        while self.streams.len() > max.get() {
            let Some((_, key)) = self.recency.pop_first() else {
                break;
            };
            tracing::trace!(
                bucket_id = %key.bucket_id,
                stream_id = %key.stream_id,
                "evicting least recently used stream from commit tracker"
            );
            self.streams.remove(&key);
        }
    }

    fn retain(&mut self, mut keep: impl FnMut(&StreamKey) -> bool) {
        self.streams.retain(|key, _| keep(key));
        self.recency.retain(|_, key| keep(key));
    }

    fn clear(&mut self) {
        self.streams.clear();
        self.recency.clear();
    }
}
