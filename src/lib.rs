#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use eventide_core::test;
pub use eventide_core::{
    aggregate,
    aggregate::{Aggregate, AggregateRoot},
    checkpoint,
    checkpoint::{Checkpoint, LongCheckpoint},
    clock,
    clock::{Clock, FixedClock, SystemClock},
    codec,
    codec::{Codec, JsonCodec},
    commit,
    commit::{
        Commit, CommitAttempt, DEFAULT_BUCKET, EVENT_KIND_HEADER, EventMessage, Headers,
        Snapshot, StreamHead,
    },
    concurrency,
    concurrency::{ConcurrencyConflict, DuplicateCommit, StreamPosition},
    repository,
    repository::{AGGREGATE_KIND_HEADER, Repository, RepositoryError},
    store,
    store::{OptimisticEventStore, PipelineAwarePersistence},
    stream,
    stream::{OptimisticEventStream, StreamError},
};
// The non-empty event list inside commits, so callers need no extra dependency.
pub use nonempty::NonEmpty;

pub mod persistence {

    pub use eventide_core::persistence::{
        BoxError, CommitError, Persistence, StorageError,
    };

    pub use eventide_core::persistence::inmemory;
}

pub mod pipeline {

    pub use eventide_core::pipeline::{Pipeline, PipelineHook, SelectedCommits};

    pub use eventide_core::pipeline::{
        tracking::{CommitTracker, RECENT_COMMITS_PER_STREAM},
        upconvert::{EventUpconverter, UpconverterError},
    };
}

pub mod dispatch {

    pub use eventide_core::dispatch::{
        AsynchronousDispatchScheduler, DispatchCommits, DispatchError, DispatchFault,
        DispatchScheduler, DispatcherStartup, NoopDispatchScheduler,
        SynchronousDispatchScheduler,
    };
}

pub mod polling {

    pub use eventide_core::polling::{
        CommitObserver, DEFAULT_POLLING_INTERVAL, ObserveCommits, PollingClient, PollingError,
        PollingHandle, SubscriptionId,
    };
}
