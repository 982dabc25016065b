//! Engine access that keeps the pipeline informed.
//!
//! [`OptimisticEventStore::advanced`](super::OptimisticEventStore::advanced)
//! hands out a [`PipelineAwarePersistence`]: a [`Persistence`] implementation
//! over the store's engine whose reads come back through every hook's
//! `select` and whose purge and delete calls notify the hooks afterwards.
//! Writes and bookkeeping calls go straight to the engine.

use std::future::Future;

use chrono::{DateTime, Utc};

use crate::{
    commit::{Commit, CommitAttempt, Snapshot, StreamHead},
    persistence::{CommitError, Persistence, StorageError},
    pipeline::Pipeline,
};

/// The store's engine, decorated with its pipeline.
pub struct PipelineAwarePersistence<'a, P> {
    persistence: &'a P,
    pipeline: &'a Pipeline,
}

impl<'a, P: Persistence> PipelineAwarePersistence<'a, P> {
    pub(crate) const fn new(persistence: &'a P, pipeline: &'a Pipeline) -> Self {
        Self {
            persistence,
            pipeline,
        }
    }

    /// The undecorated engine.
    #[must_use]
    pub const fn inner(&self) -> &'a P {
        self.persistence
    }

    fn select(&self, commits: Vec<Commit>) -> Vec<Commit> {
        self.pipeline.selected(commits).collect()
    }
}

impl<P: Persistence> Persistence for PipelineAwarePersistence<'_, P> {
    type Checkpoint = P::Checkpoint;

    fn initialize(&self) -> impl Future<Output = Result<(), StorageError>> + Send + '_ {
        self.persistence.initialize()
    }

    fn commit(
        &self,
        attempt: CommitAttempt,
    ) -> impl Future<Output = Result<Commit, CommitError>> + Send + '_ {
        self.persistence.commit(attempt)
    }

    fn get_from<'a>(
        &'a self,
        bucket_id: &'a str,
        stream_id: &'a str,
        min_revision: u64,
        max_revision: u64,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + 'a {
        async move {
            let commits = self
                .persistence
                .get_from(bucket_id, stream_id, min_revision, max_revision)
                .await?;
            Ok(self.select(commits))
        }
    }

    fn get_from_checkpoint<'a>(
        &'a self,
        bucket_id: Option<&'a str>,
        checkpoint_token: Option<&'a str>,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + 'a {
        async move {
            let commits = self
                .persistence
                .get_from_checkpoint(bucket_id, checkpoint_token)
                .await?;
            Ok(self.select(commits))
        }
    }

    fn get_from_date<'a>(
        &'a self,
        bucket_id: &'a str,
        start: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + 'a {
        async move {
            let commits = self.persistence.get_from_date(bucket_id, start).await?;
            Ok(self.select(commits))
        }
    }

    fn get_from_to<'a>(
        &'a self,
        bucket_id: &'a str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + 'a {
        async move {
            let commits = self.persistence.get_from_to(bucket_id, start, end).await?;
            Ok(self.select(commits))
        }
    }

    fn get_undispatched_commits(
        &self,
    ) -> impl Future<Output = Result<Vec<Commit>, StorageError>> + Send + '_ {
        async move {
            let commits = self.persistence.get_undispatched_commits().await?;
            Ok(self.select(commits))
        }
    }

    fn mark_commit_as_dispatched<'a>(
        &'a self,
        commit: &'a Commit,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + 'a {
        self.persistence.mark_commit_as_dispatched(commit)
    }

    fn get_streams_to_snapshot<'a>(
        &'a self,
        bucket_id: &'a str,
        max_threshold: u64,
    ) -> impl Future<Output = Result<Vec<StreamHead>, StorageError>> + Send + 'a {
        self.persistence
            .get_streams_to_snapshot(bucket_id, max_threshold)
    }

    fn add_snapshot(
        &self,
        snapshot: Snapshot,
    ) -> impl Future<Output = Result<bool, StorageError>> + Send + '_ {
        self.persistence.add_snapshot(snapshot)
    }

    fn get_snapshot<'a>(
        &'a self,
        bucket_id: &'a str,
        stream_id: &'a str,
        max_revision: u64,
    ) -> impl Future<Output = Result<Option<Snapshot>, StorageError>> + Send + 'a {
        self.persistence
            .get_snapshot(bucket_id, stream_id, max_revision)
    }

    fn purge(&self) -> impl Future<Output = Result<(), StorageError>> + Send + '_ {
        async move {
            self.persistence.purge().await?;
            self.pipeline.on_purge(None);
            Ok(())
        }
    }

    fn purge_bucket<'a>(
        &'a self,
        bucket_id: &'a str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + 'a {
        async move {
            self.persistence.purge_bucket(bucket_id).await?;
            self.pipeline.on_purge(Some(bucket_id));
            Ok(())
        }
    }

    fn delete_stream<'a>(
        &'a self,
        bucket_id: &'a str,
        stream_id: &'a str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send + 'a {
        async move {
            self.persistence.delete_stream(bucket_id, stream_id).await?;
            self.pipeline.on_delete_stream(bucket_id, stream_id);
            Ok(())
        }
    }

    fn dispose(&self) {
        self.persistence.dispose();
    }

    fn is_disposed(&self) -> bool {
        self.persistence.is_disposed()
    }
}
