use std::{
    collections::HashSet,
    future::Future,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{DispatchCommits, DispatchError, DispatchScheduler, dispatch_and_mark};
use crate::{commit::Commit, persistence::Persistence};

/// When the background worker begins.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatcherStartup {
    /// As soon as the scheduler is constructed.
    #[default]
    Auto,
    /// Only once [`DispatchScheduler::start`] is called; scheduling earlier
    /// fails with [`DispatchError::NotStarted`].
    Explicit,
}

/// A failure on the background worker.
#[derive(Debug)]
pub struct DispatchFault {
    /// The commit being dispatched, if the failure concerned one.
    pub commit: Option<Commit>,
    pub error: DispatchError,
}

type FaultHandler = Arc<dyn Fn(&DispatchFault) + Send + Sync>;

/// Dispatches on a single background worker.
///
/// [`schedule_dispatch`](DispatchScheduler::schedule_dispatch) only enqueues,
/// so committers never wait on the dispatch target. One worker processes the
/// queue in order, which keeps the commits of a stream in commit order.
/// Failures are logged and handed to the fault handler; the commit stays
/// undispatched in storage.
pub struct AsynchronousDispatchScheduler<P> {
    shared: Arc<Shared<P>>,
    queue: mpsc::UnboundedSender<Commit>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Commit>>>,
    started: AtomicBool,
    disposed: AtomicBool,
    cancel: CancellationToken,
}

struct Shared<P> {
    dispatcher: Arc<dyn DispatchCommits>,
    persistence: P,
    on_fault: RwLock<Option<FaultHandler>>,
}

impl<P> AsynchronousDispatchScheduler<P>
where
    P: Persistence + 'static,
{
    /// Create the scheduler, starting the worker right away for
    /// [`DispatcherStartup::Auto`].
    ///
    /// # Panics
    ///
    /// With [`DispatcherStartup::Auto`], panics when called outside a Tokio
    /// runtime.
    pub fn new(
        dispatcher: Arc<dyn DispatchCommits>,
        persistence: P,
        startup: DispatcherStartup,
    ) -> Self {
        let (queue, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            shared: Arc::new(Shared {
                dispatcher,
                persistence,
                on_fault: RwLock::new(None),
            }),
            queue,
            receiver: Mutex::new(Some(receiver)),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        };
        if startup == DispatcherStartup::Auto {
            scheduler.spawn_worker();
        }
        scheduler
    }

    /// Observe background failures.
    #[must_use]
    pub fn with_fault_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&DispatchFault) + Send + Sync + 'static,
    {
        *self
            .shared
            .on_fault
            .write()
            .expect("fault handler lock poisoned") = Some(Arc::new(handler));
        self
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    fn spawn_worker(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(receiver) = self
            .receiver
            .lock()
            .expect("dispatch receiver lock poisoned")
            .take()
        else {
            return;
        };
        tracing::debug!("starting dispatch worker");
        tokio::spawn(run_worker(
            Arc::clone(&self.shared),
            receiver,
            self.cancel.clone(),
        ));
    }
}

impl<P> DispatchScheduler for AsynchronousDispatchScheduler<P>
where
    P: Persistence + 'static,
{
    fn start(&self) -> impl Future<Output = Result<(), DispatchError>> + Send + '_ {
        let result = if self.disposed.load(Ordering::Acquire) {
            Err(DispatchError::Disposed)
        } else {
            self.spawn_worker();
            Ok(())
        };
        std::future::ready(result)
    }

    fn schedule_dispatch<'a>(
        &'a self,
        commit: &'a Commit,
    ) -> impl Future<Output = Result<(), DispatchError>> + Send + 'a {
        let result = if self.disposed.load(Ordering::Acquire) {
            Err(DispatchError::Disposed)
        } else if !self.is_started() {
            Err(DispatchError::NotStarted)
        } else {
            tracing::trace!(commit_id = %commit.commit_id, "commit queued for dispatch");
            self.queue
                .send(commit.clone())
                .map_err(|_| DispatchError::WorkerStopped)
        };
        std::future::ready(result)
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("disposing asynchronous dispatch scheduler");
        self.cancel.cancel();
        self.shared.dispatcher.dispose();
        self.shared.persistence.dispose();
    }
}

impl<P> Shared<P>
where
    P: Persistence,
{
    fn fault(&self, commit: Option<Commit>, error: DispatchError) {
        tracing::error!(
            commit_id = ?commit.as_ref().map(|c| c.commit_id),
            error = %error,
            "background dispatch failed"
        );
        let handler = self
            .on_fault
            .read()
            .expect("fault handler lock poisoned")
            .clone();
        if let Some(handler) = handler {
            handler(&DispatchFault { commit, error });
        }
    }

    /// Dispatch whatever a previous run left behind. Returns the ids it
    /// attempted so queued duplicates can be skipped.
    async fn drain_undispatched(&self) -> HashSet<Uuid> {
        let undispatched = match self.persistence.initialize().await {
            Ok(()) => self.persistence.get_undispatched_commits().await,
            Err(error) => Err(error),
        };
        let undispatched = match undispatched {
            Ok(commits) => commits,
            Err(error) => {
                self.fault(None, error.into());
                return HashSet::new();
            }
        };
        tracing::debug!(
            undispatched = undispatched.len(),
            "dispatching commits left over from a previous run"
        );

        let mut attempted = HashSet::with_capacity(undispatched.len());
        for commit in undispatched {
            attempted.insert(commit.commit_id);
            if let Err(error) =
                dispatch_and_mark(self.dispatcher.as_ref(), &self.persistence, &commit).await
            {
                self.fault(Some(commit), error);
            }
        }
        attempted
    }
}

async fn run_worker<P>(
    shared: Arc<Shared<P>>,
    mut queue: mpsc::UnboundedReceiver<Commit>,
    cancel: CancellationToken,
) where
    P: Persistence,
{
    let drained = shared.drain_undispatched().await;

    loop {
        let commit = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            commit = queue.recv() => match commit {
                Some(commit) => commit,
                None => break,
            },
        };

        if drained.contains(&commit.commit_id) {
            tracing::trace!(commit_id = %commit.commit_id, "commit already dispatched at startup");
            continue;
        }
        if let Err(error) =
            dispatch_and_mark(shared.dispatcher.as_ref(), &shared.persistence, &commit).await
        {
            shared.fault(Some(commit), error);
        }
    }

    tracing::debug!("dispatch worker stopped");
}
