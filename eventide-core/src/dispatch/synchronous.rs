use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use super::{DispatchCommits, DispatchError, DispatchScheduler, dispatch_and_mark};
use crate::{commit::Commit, persistence::Persistence};

/// Dispatches on the committing task.
///
/// A failing dispatch propagates to whoever committed, and the commit stays
/// undispatched in storage so the next [`start`](DispatchScheduler::start)
/// picks it up again.
pub struct SynchronousDispatchScheduler<P> {
    dispatcher: Arc<dyn DispatchCommits>,
    persistence: P,
    disposed: AtomicBool,
}

impl<P: Persistence> SynchronousDispatchScheduler<P> {
    pub fn new(dispatcher: Arc<dyn DispatchCommits>, persistence: P) -> Self {
        Self {
            dispatcher,
            persistence,
            disposed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), DispatchError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(DispatchError::Disposed);
        }
        Ok(())
    }
}

impl<P: Persistence> DispatchScheduler for SynchronousDispatchScheduler<P> {
    fn start(&self) -> impl Future<Output = Result<(), DispatchError>> + Send + '_ {
        async move {
            self.ensure_open()?;
            self.persistence.initialize().await?;
            let undispatched = self.persistence.get_undispatched_commits().await?;
            tracing::debug!(
                undispatched = undispatched.len(),
                "dispatching commits left over from a previous run"
            );
            for commit in &undispatched {
                dispatch_and_mark(self.dispatcher.as_ref(), &self.persistence, commit).await?;
            }
            Ok(())
        }
    }

    fn schedule_dispatch<'a>(
        &'a self,
        commit: &'a Commit,
    ) -> impl Future<Output = Result<(), DispatchError>> + Send + 'a {
        async move {
            self.ensure_open()?;
            dispatch_and_mark(self.dispatcher.as_ref(), &self.persistence, commit).await
        }
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("disposing synchronous dispatch scheduler");
        self.dispatcher.dispose();
        self.persistence.dispose();
    }
}
