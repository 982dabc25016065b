//! Loading and saving aggregates through an [`OptimisticEventStore`].
//!
//! Each aggregate lives in its own stream, keyed by its id within a bucket.
//! Events are stored as JSON bodies; every commit carries the aggregate's
//! [`KIND`](Aggregate::KIND) under [`AGGREGATE_KIND_HEADER`].
//!
//! ```ignore
//! let repository = Repository::new(OptimisticEventStore::new(InMemoryPersistence::new()));
//!
//! let mut account = AggregateRoot::<Account>::new("account-7");
//! account.raise(AccountEvent::Opened { owner: "ada".into() });
//! repository.save(DEFAULT_BUCKET, &mut account, Uuid::new_v4()).await?;
//!
//! let loaded = repository.get_by_id::<Account>(DEFAULT_BUCKET, "account-7").await?;
//! assert_eq!(loaded.version(), 1);
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    aggregate::{Aggregate, AggregateRoot},
    codec::JsonCodec,
    commit::{EventMessage, Snapshot},
    dispatch::{DispatchScheduler, NoopDispatchScheduler},
    persistence::{Persistence, StorageError},
    store::OptimisticEventStore,
    stream::StreamError,
};

/// Commit header naming the aggregate type that wrote the commit.
pub const AGGREGATE_KIND_HEADER: &str = "aggregate-kind";

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to decode `{kind}` event: {source}")]
    DecodeEvent {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode event: {0}")]
    EncodeEvent(#[source] serde_json::Error),
    #[error("snapshot operation failed: {0}")]
    Snapshot(#[source] serde_json::Error),
    #[error("aggregate `{id}` has unsaved events")]
    UncommittedChanges { id: String },
}

/// Aggregate persistence over an event store.
pub struct Repository<P, D = NoopDispatchScheduler> {
    store: OptimisticEventStore<P, D>,
}

impl<P, D> Repository<P, D>
where
    P: Persistence,
    D: DispatchScheduler,
{
    #[must_use]
    pub const fn new(store: OptimisticEventStore<P, D>) -> Self {
        Self { store }
    }

    #[must_use]
    pub const fn store(&self) -> &OptimisticEventStore<P, D> {
        &self.store
    }

    /// The aggregate at the head of its stream.
    ///
    /// An unknown id yields a fresh aggregate at version 0.
    ///
    /// # Errors
    ///
    /// Storage failures, and events that do not decode as `A::Event`.
    pub async fn get_by_id<A: Aggregate>(
        &self,
        bucket_id: &str,
        id: &str,
    ) -> Result<AggregateRoot<A>, RepositoryError> {
        self.get_by_id_at(bucket_id, id, 0).await
    }

    /// The aggregate as it was at `version` (`0` for the head).
    ///
    /// # Errors
    ///
    /// Storage failures, and events that do not decode as `A::Event`.
    #[tracing::instrument(skip(self), fields(kind = A::KIND))]
    pub async fn get_by_id_at<A: Aggregate>(
        &self,
        bucket_id: &str,
        id: &str,
        version: u64,
    ) -> Result<AggregateRoot<A>, RepositoryError> {
        let stream = self.store.open_stream(bucket_id, id, 0, version).await?;
        let mut state = A::default();
        apply_events(&mut state, stream.committed_events())?;
        Ok(AggregateRoot::restore(id, state, stream.stream_revision()))
    }

    /// Like [`get_by_id_at`](Self::get_by_id_at), starting from the newest
    /// snapshot at or below `version` and replaying only the events after it.
    ///
    /// Without a usable snapshot the full stream is replayed.
    ///
    /// # Errors
    ///
    /// Storage failures, snapshots that do not decode as `A`, and events that
    /// do not decode as `A::Event`.
    #[tracing::instrument(skip(self), fields(kind = A::KIND))]
    pub async fn get_by_id_from_snapshot<A>(
        &self,
        bucket_id: &str,
        id: &str,
        version: u64,
    ) -> Result<AggregateRoot<A>, RepositoryError>
    where
        A: Aggregate + for<'de> Deserialize<'de>,
    {
        let max_revision = if version == 0 { u64::MAX } else { version };
        let snapshot = self
            .store
            .advanced()
            .get_snapshot(bucket_id, id, max_revision)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    error = %e,
                    "failed to load snapshot, falling back to full replay"
                );
            })
            .ok()
            .flatten();
        let Some(snapshot) = snapshot else {
            return self.get_by_id_at(bucket_id, id, version).await;
        };

        let mut state: A = snapshot
            .decode(&JsonCodec)
            .map_err(RepositoryError::Snapshot)?;
        let stream = self
            .store
            .open_stream_from_snapshot(&snapshot, version)
            .await?;
        apply_events(&mut state, stream.committed_events())?;
        Ok(AggregateRoot::restore(id, state, stream.stream_revision()))
    }

    /// Persist the aggregate's pending events as one commit.
    ///
    /// Saving again with a `commit_id` that is already stored is treated as
    /// done: the pending events are dropped and `Ok` is returned.
    ///
    /// # Errors
    ///
    /// [`StreamError::Conflict`] (wrapped) when the stream moved past the
    /// version the aggregate was loaded at; storage and encoding failures.
    #[tracing::instrument(skip(self, root), fields(kind = A::KIND, id = root.id()))]
    pub async fn save<A: Aggregate>(
        &self,
        bucket_id: &str,
        root: &mut AggregateRoot<A>,
        commit_id: Uuid,
    ) -> Result<(), RepositoryError> {
        if !root.has_changes() {
            return Ok(());
        }
        let persisted = root.persisted_version();
        let mut stream = if persisted == 0 {
            self.store.create_stream(bucket_id, root.id())?
        } else {
            self.store
                .open_stream(bucket_id, root.id(), persisted, persisted)
                .await?
        };

        for event in root.uncommitted_events() {
            let body = serde_json::to_value(event).map_err(RepositoryError::EncodeEvent)?;
            stream.add(EventMessage::new(body))?;
        }
        stream.set_header(AGGREGATE_KIND_HEADER, A::KIND.into())?;

        match stream.commit_changes(commit_id).await {
            Ok(()) => tracing::debug!(version = root.version(), "aggregate saved"),
            Err(StreamError::Duplicate(duplicate)) => {
                tracing::debug!(%duplicate, "commit already stored");
            }
            Err(err) => return Err(err.into()),
        }
        root.mark_committed();
        Ok(())
    }

    /// Store a snapshot of the aggregate at its current version.
    ///
    /// Returns whether the engine accepted it.
    ///
    /// # Errors
    ///
    /// [`RepositoryError::UncommittedChanges`] when the aggregate has unsaved
    /// events; encoding and storage failures.
    pub async fn save_snapshot<A>(
        &self,
        bucket_id: &str,
        root: &AggregateRoot<A>,
    ) -> Result<bool, RepositoryError>
    where
        A: Aggregate + Serialize,
    {
        if root.has_changes() {
            return Err(RepositoryError::UncommittedChanges {
                id: root.id().to_owned(),
            });
        }
        let snapshot = Snapshot::encode(
            &JsonCodec,
            bucket_id,
            root.id(),
            root.version(),
            root.state(),
        )
        .map_err(RepositoryError::Snapshot)?;
        Ok(self.store.advanced().add_snapshot(snapshot).await?)
    }
}

fn apply_events<A: Aggregate>(state: &mut A, events: &[EventMessage]) -> Result<(), RepositoryError> {
    for body in events.iter().filter_map(|event| event.body.as_ref()) {
        let event = A::Event::deserialize(body).map_err(|source| RepositoryError::DecodeEvent {
            kind: A::KIND,
            source,
        })?;
        state.apply(&event);
    }
    Ok(())
}
