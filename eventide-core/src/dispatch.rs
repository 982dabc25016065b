//! Forwarding persisted commits to a dispatch target.
//!
//! A [`DispatchScheduler`] decides *when* a commit reaches the
//! [`DispatchCommits`] target:
//!
//! - [`NoopDispatchScheduler`] never dispatches (the store default),
//! - [`SynchronousDispatchScheduler`] dispatches inline, so failures reach the
//!   committer,
//! - [`AsynchronousDispatchScheduler`] queues commits for a background worker.
//!
//! Both real schedulers drain commits that are still undispatched in storage
//! when they start, and mark every commit as dispatched once the target
//! accepted it.

use std::future::Future;

use thiserror::Error;
use uuid::Uuid;

use crate::{
    commit::Commit,
    persistence::{BoxError, StorageError},
};

mod asynchronous;
mod synchronous;

pub use asynchronous::{AsynchronousDispatchScheduler, DispatchFault, DispatcherStartup};
pub use synchronous::SynchronousDispatchScheduler;

/// The external consumer of persisted commits.
pub trait DispatchCommits: Send + Sync {
    /// Deliver one commit.
    ///
    /// # Errors
    ///
    /// Any error leaves the commit undispatched in storage.
    fn dispatch(&self, commit: &Commit) -> Result<(), BoxError>;

    /// Release the target. Schedulers call this at most once.
    fn dispose(&self) {}
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// An explicitly started scheduler received work before `start()`.
    #[error("dispatch scheduler has not been started")]
    NotStarted,
    #[error("dispatch scheduler has been disposed")]
    Disposed,
    #[error("dispatcher failed for commit {commit_id}: {source}")]
    Dispatcher {
        commit_id: Uuid,
        #[source]
        source: BoxError,
    },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    /// The background worker is gone, so queued work would be lost.
    #[error("dispatch worker has stopped")]
    WorkerStopped,
}

/// Strategy for getting committed work to the dispatch target.
pub trait DispatchScheduler: Send + Sync {
    /// Initialize storage and dispatch everything still undispatched.
    ///
    /// # Errors
    ///
    /// Returns a dispatch error if storage or the target fails.
    fn start(&self) -> impl Future<Output = Result<(), DispatchError>> + Send + '_;

    /// Hand a freshly persisted commit to the scheduler.
    ///
    /// # Errors
    ///
    /// Returns a dispatch error if the commit cannot be dispatched or queued.
    fn schedule_dispatch<'a>(
        &'a self,
        commit: &'a Commit,
    ) -> impl Future<Output = Result<(), DispatchError>> + Send + 'a;

    /// Release the scheduler, its target and its storage. Idempotent.
    fn dispose(&self);
}

/// Scheduler that drops every commit on the floor.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopDispatchScheduler;

impl DispatchScheduler for NoopDispatchScheduler {
    fn start(&self) -> impl Future<Output = Result<(), DispatchError>> + Send + '_ {
        std::future::ready(Ok(()))
    }

    fn schedule_dispatch<'a>(
        &'a self,
        commit: &'a Commit,
    ) -> impl Future<Output = Result<(), DispatchError>> + Send + 'a {
        tracing::trace!(commit_id = %commit.commit_id, "dispatch skipped");
        std::future::ready(Ok(()))
    }

    fn dispose(&self) {}
}

/// Dispatch one commit and record it as dispatched.
async fn dispatch_and_mark<P>(
    dispatcher: &dyn DispatchCommits,
    persistence: &P,
    commit: &Commit,
) -> Result<(), DispatchError>
where
    P: crate::persistence::Persistence,
{
    dispatcher
        .dispatch(commit)
        .map_err(|source| DispatchError::Dispatcher {
            commit_id: commit.commit_id,
            source,
        })?;
    persistence.mark_commit_as_dispatched(commit).await?;
    tracing::debug!(
        commit_id = %commit.commit_id,
        checkpoint = %commit.checkpoint_token,
        "commit dispatched"
    );
    Ok(())
}
