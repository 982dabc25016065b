//! In-memory storage engine for tests and examples.
//!
//! [`InMemoryPersistence`] implements the full [`Persistence`] contract,
//! including conflict detection under its write lock, so it can stand in for
//! a real engine anywhere.
//!
//! # Example
//!
//! ```
//! use eventide_core::persistence::inmemory::InMemoryPersistence;
//!
//! let persistence = InMemoryPersistence::new();
//! let shared = persistence.clone(); // same underlying data
//! ```

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Utc};

use crate::{
    checkpoint::{Checkpoint, LongCheckpoint},
    commit::{Commit, CommitAttempt, Snapshot, StreamHead, StreamKey},
    concurrency::{ConcurrencyConflict, DuplicateCommit, StreamPosition},
    persistence::{CommitError, Persistence, StorageError},
};

/// Engine keeping every commit in a single checkpoint-ordered log.
///
/// Cloning is cheap and clones share data, so one engine can back a store, a
/// dispatch scheduler and a polling client at the same time.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    inner: Arc<RwLock<Inner>>,
    disposed: Arc<AtomicBool>,
}

#[derive(Default)]
struct Inner {
    /// Append order, which is also checkpoint order.
    commits: Vec<StoredCommit>,
    heads: HashMap<StreamKey, StreamHead>,
    snapshots: Vec<Snapshot>,
    last_checkpoint: LongCheckpoint,
    initialized: bool,
}

struct StoredCommit {
    commit: Commit,
    checkpoint: LongCheckpoint,
    dispatched: bool,
}

impl StoredCommit {
    fn in_stream(&self, bucket_id: &str, stream_id: &str) -> bool {
        self.commit.bucket_id == bucket_id && self.commit.stream_id == stream_id
    }
}

impl InMemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether [`Persistence::initialize`] has run.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner
            .read()
            .expect("in-memory persistence lock poisoned")
            .initialized
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> Result<T, StorageError> {
        self.ensure_open()?;
        let inner = self.inner.read().expect("in-memory persistence lock poisoned");
        Ok(f(&inner))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> Result<T, StorageError> {
        self.ensure_open()?;
        let mut inner = self.inner.write().expect("in-memory persistence lock poisoned");
        Ok(f(&mut inner))
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StorageError::Disposed);
        }
        Ok(())
    }
}

impl Inner {
    fn commit(&mut self, attempt: CommitAttempt) -> Result<Commit, CommitError> {
        let key = attempt.stream_key();
        let first = attempt.first_revision();
        let mut stream = self
            .commits
            .iter()
            .filter(|stored| stored.in_stream(&attempt.bucket_id, &attempt.stream_id));

        if stream
            .clone()
            .any(|stored| stored.commit.commit_id == attempt.commit_id)
        {
            return Err(DuplicateCommit::for_attempt(&attempt).into());
        }

        let taken = stream.any(|stored| {
            stored.commit.commit_sequence == attempt.commit_sequence
                || (stored.commit.first_revision() <= attempt.stream_revision
                    && first <= stored.commit.stream_revision)
        });
        if taken {
            let known = self.heads.get(&key).map(|head| StreamPosition {
                revision: head.head_revision,
                sequence: head.commit_sequence,
            });
            return Err(ConcurrencyConflict::for_attempt(&attempt, known).into());
        }

        let checkpoint = self.last_checkpoint.next();
        self.last_checkpoint = checkpoint;
        let commit = Commit::from_attempt(attempt, checkpoint.token());

        let head = self.heads.entry(key).or_insert_with(|| StreamHead {
            bucket_id: commit.bucket_id.clone(),
            stream_id: commit.stream_id.clone(),
            head_revision: 0,
            commit_sequence: 0,
            snapshot_revision: 0,
        });
        head.head_revision = head.head_revision.max(commit.stream_revision);
        head.commit_sequence = head.commit_sequence.max(commit.commit_sequence);

        self.commits.push(StoredCommit {
            commit: commit.clone(),
            checkpoint,
            dispatched: false,
        });
        Ok(commit)
    }

    fn collect(&self, mut predicate: impl FnMut(&StoredCommit) -> bool) -> Vec<Commit> {
        self.commits
            .iter()
            .filter(|stored| predicate(stored))
            .map(|stored| stored.commit.clone())
            .collect()
    }

    fn retain(&mut self, mut keep: impl FnMut(&str, &str) -> bool) {
        self.commits
            .retain(|stored| keep(&stored.commit.bucket_id, &stored.commit.stream_id));
        self.heads
            .retain(|key, _| keep(&key.bucket_id, &key.stream_id));
        self.snapshots
            .retain(|snapshot| keep(&snapshot.bucket_id, &snapshot.stream_id));
    }
}

impl Persistence for InMemoryPersistence {
    type Checkpoint = LongCheckpoint;

    fn initialize(&self) -> impl Future<Output = Result<(), StorageError>> + Send + '_ {
        let result = self.write(|inner| {
            if !inner.initialized {
                tracing::debug!("in-memory persistence initialized");
            }
            inner.initialized = true;
        });
        std::future::ready(result)
    }

    #[tracing::instrument(
        skip(self, attempt),
        fields(
            bucket_id = %attempt.bucket_id,
            stream_id = %attempt.stream_id,
            commit_sequence = attempt.commit_sequence,
            event_count = attempt.events.len(),
        )
    )]
    fn commit(
        &self,
        attempt: CommitAttempt,
    ) -> impl Future<Output = Result<Commit, CommitError>> + Send + '_ {
        let result = self
            .write(|inner| inner.commit(attempt))
            .map_err(CommitError::from)
            .and_then(|result| result);
        if let Ok(commit) = &result {
            tracing::debug!(checkpoint = %commit.checkpoint_token, "commit persisted");
        }
        std::future::ready(result)
    }

    #[tracing::instrument(skip(self))]
    fn get_from<'a>(
        &'a self,
        bucket_id: &'a str,
        stream_id: &'a str,
        min_revision: u64,
        max_revision: u64,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + 'a {
        let result = self.read(|inner| {
            let mut commits = inner.collect(|stored| {
                stored.in_stream(bucket_id, stream_id)
                    && stored.commit.stream_revision >= min_revision
                    && stored.commit.first_revision() <= max_revision
            });
            commits.sort_by_key(|commit| commit.commit_sequence);
            commits
        });
        if let Ok(commits) = &result {
            tracing::trace!(commits = commits.len(), "read stream commits");
        }
        std::future::ready(result)
    }

    fn get_from_checkpoint<'a>(
        &'a self,
        bucket_id: Option<&'a str>,
        checkpoint_token: Option<&'a str>,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + 'a {
        let result = LongCheckpoint::parse_or_initial(checkpoint_token)
            .map_err(StorageError::from)
            .and_then(|after| {
                self.read(|inner| {
                    inner.collect(|stored| {
                        stored.checkpoint > after
                            && bucket_id.is_none_or(|bucket| stored.commit.bucket_id == bucket)
                    })
                })
            });
        std::future::ready(result)
    }

    fn get_from_date<'a>(
        &'a self,
        bucket_id: &'a str,
        start: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + 'a {
        std::future::ready(self.read(|inner| {
            inner.collect(|stored| {
                stored.commit.bucket_id == bucket_id && stored.commit.commit_stamp >= start
            })
        }))
    }

    fn get_from_to<'a>(
        &'a self,
        bucket_id: &'a str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + 'a {
        std::future::ready(self.read(|inner| {
            inner.collect(|stored| {
                stored.commit.bucket_id == bucket_id
                    && stored.commit.commit_stamp >= start
                    && stored.commit.commit_stamp < end
            })
        }))
    }

    fn get_undispatched_commits(
        &self,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + '_ {
        std::future::ready(self.read(|inner| inner.collect(|stored| !stored.dispatched)))
    }

    fn mark_commit_as_dispatched<'a>(
        &'a self,
        commit: &'a Commit,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + 'a {
        let result = self.write(|inner| {
            if let Some(stored) = inner.commits.iter_mut().find(|stored| {
                stored.in_stream(&commit.bucket_id, &commit.stream_id)
                    && stored.commit.commit_id == commit.commit_id
            }) {
                stored.dispatched = true;
                tracing::trace!(commit_id = %commit.commit_id, "commit marked as dispatched");
            }
        });
        std::future::ready(result)
    }

    fn get_streams_to_snapshot<'a>(
        &'a self,
        bucket_id: &'a str,
        max_threshold: u64,
    ) -> impl Future<Output = Result<Vec<StreamHead>, StorageError>> + Send + 'a {
        std::future::ready(self.read(|inner| {
            let mut heads: Vec<_> = inner
                .heads
                .values()
                .filter(|head| {
                    head.bucket_id == bucket_id && head.revisions_since_snapshot() >= max_threshold
                })
                .cloned()
                .collect();
            heads.sort_by(|a, b| a.stream_id.cmp(&b.stream_id));
            heads
        }))
    }

    #[tracing::instrument(
        skip(self, snapshot),
        fields(stream_id = %snapshot.stream_id, stream_revision = snapshot.stream_revision)
    )]
    fn add_snapshot(
        &self,
        snapshot: Snapshot,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send + '_ {
        let result = self.write(|inner| {
            let key = StreamKey::new(&snapshot.bucket_id, &snapshot.stream_id);
            let Some(head) = inner.heads.get_mut(&key) else {
                tracing::debug!("snapshot declined: stream has no commits");
                return false;
            };
            head.snapshot_revision = head.snapshot_revision.max(snapshot.stream_revision);
            inner.snapshots.retain(|existing| {
                !(key.matches(&existing.bucket_id, &existing.stream_id)
                    && existing.stream_revision == snapshot.stream_revision)
            });
            inner.snapshots.push(snapshot);
            true
        });
        std::future::ready(result)
    }

    fn get_snapshot<'a>(
        &'a self,
        bucket_id: &'a str,
        stream_id: &'a str,
        max_revision: u64,
    ) -> impl Future<Output = Result<Option<Snapshot>, StorageError>> + Send + 'a {
        std::future::ready(self.read(|inner| {
            inner
                .snapshots
                .iter()
                .filter(|snapshot| {
                    snapshot.bucket_id == bucket_id
                        && snapshot.stream_id == stream_id
                        && snapshot.stream_revision <= max_revision
                })
                .max_by_key(|snapshot| snapshot.stream_revision)
                .cloned()
        }))
    }

    fn purge(&self) -> impl Future<Output = Result<(), StorageError>> + Send + '_ {
        let result = self
            .write(|inner| inner.retain(|_, _| false))
            .inspect(|()| tracing::debug!("purged all buckets"));
        std::future::ready(result)
    }

    fn purge_bucket<'a>(
        &'a self,
        bucket_id: &'a str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + 'a {
        let result = self
            .write(|inner| inner.retain(|bucket, _| bucket != bucket_id))
            .inspect(|()| tracing::debug!(bucket_id, "purged bucket"));
        std::future::ready(result)
    }

    fn delete_stream<'a>(
        &'a self,
        bucket_id: &'a str,
        stream_id: &'a str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + 'a {
        let result = self
            .write(|inner| {
                inner.retain(|bucket, stream| !(bucket == bucket_id && stream == stream_id));
            })
            .inspect(|()| tracing::debug!(bucket_id, stream_id, "deleted stream"));
        std::future::ready(result)
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            tracing::debug!("in-memory persistence disposed");
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}
