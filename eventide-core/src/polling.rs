//! Live, resumable commit feeds built by polling storage.
//!
//! A [`PollingClient`] turns the global checkpoint order of a [`Persistence`]
//! engine into a subscription. [`PollingClient::observe_from`] creates an
//! [`ObserveCommits`] positioned after a checkpoint token; once started, a
//! background task repeatedly reads the commits after the last delivered
//! checkpoint and hands each one to every subscriber, in order.
//!
//! # Example
//!
//! ```ignore
//! let client = PollingClient::new(persistence, Duration::from_millis(250))?;
//! let observer = client.observe_from(last_seen_token.as_deref());
//! let mut commits = observer.commits()?;
//! let handle = observer.start()?;
//!
//! while let Some(commit) = commits.next().await {
//!     project(&commit)?;
//! }
//!
//! observer.dispose();
//! handle.wait().await?;
//! ```
//!
//! Delivery stops at the first failure. An observer failing stops the loop
//! after the remaining observers have received the same commit; a storage
//! failure is reported to every observer. Either way the loop resolves with
//! the error, and a new observation can resume from
//! [`ObserveCommits::checkpoint_token`].

use std::{
    fmt,
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use futures_core::Stream;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::{
    checkpoint::Checkpoint,
    commit::Commit,
    persistence::{BoxError, Persistence, StorageError},
};

/// Polling interval used when callers have no better value.
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PollingError {
    #[error("polling interval must be greater than zero")]
    InvalidInterval,
    #[error("observation has already been started")]
    AlreadyStarted,
    #[error("observation has been disposed")]
    Disposed,
    #[error("storage error while polling: {0}")]
    Storage(#[from] StorageError),
    /// A subscriber rejected a commit.
    #[error("subscriber {subscription} failed on checkpoint {checkpoint_token}: {source}")]
    Observer {
        subscription: SubscriptionId,
        checkpoint_token: String,
        #[source]
        source: BoxError,
    },
    #[error("polling task panicked")]
    TaskPanicked(#[source] tokio::task::JoinError),
}

/// Receiver of polled commits.
pub trait CommitObserver: Send + Sync {
    /// Handle the next commit.
    ///
    /// # Errors
    ///
    /// Any error stops the observation.
    fn on_next(&self, commit: &Commit) -> Result<(), BoxError>;

    /// Told about the failure that stops the observation.
    fn on_error(&self, error: &PollingError) {
        let _ = error;
    }
}

/// Identifies a subscriber for [`ObserveCommits::unsubscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct FnObserver<F>(F);

impl<F> CommitObserver for FnObserver<F>
where
    F: Fn(&Commit) -> Result<(), BoxError> + Send + Sync,
{
    fn on_next(&self, commit: &Commit) -> Result<(), BoxError> {
        (self.0)(commit)
    }
}

/// Forwards commits into the channel behind [`ObserveCommits::commits`].
struct ChannelObserver(mpsc::UnboundedSender<Commit>);

impl CommitObserver for ChannelObserver {
    fn on_next(&self, commit: &Commit) -> Result<(), BoxError> {
        if self.0.send(commit.clone()).is_err() {
            tracing::trace!("commit stream receiver dropped");
        }
        Ok(())
    }
}

type Subscribers = Vec<(SubscriptionId, Arc<dyn CommitObserver>)>;

/// Factory for commit observations over one engine.
#[derive(Clone, Debug)]
pub struct PollingClient<P> {
    persistence: P,
    interval: Duration,
}

impl<P> PollingClient<P>
where
    P: Persistence + Clone + 'static,
{
    /// # Errors
    ///
    /// [`PollingError::InvalidInterval`] for a zero `interval`.
    pub fn new(persistence: P, interval: Duration) -> Result<Self, PollingError> {
        if interval.is_zero() {
            return Err(PollingError::InvalidInterval);
        }
        Ok(Self {
            persistence,
            interval,
        })
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// An observation delivering commits after `checkpoint_token`, or every
    /// commit when `None`. Nothing happens until it is started.
    #[must_use]
    pub fn observe_from(&self, checkpoint_token: Option<&str>) -> ObserveCommits<P> {
        ObserveCommits {
            persistence: self.persistence.clone(),
            interval: self.interval,
            checkpoint_token: Arc::new(RwLock::new(checkpoint_token.map(str::to_owned))),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscription: AtomicU64::new(0),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }
}

/// A single subscription to the commit feed.
pub struct ObserveCommits<P> {
    persistence: P,
    interval: Duration,
    checkpoint_token: Arc<RwLock<Option<String>>>,
    subscribers: Arc<Mutex<Subscribers>>,
    next_subscription: AtomicU64,
    started: AtomicBool,
    disposed: AtomicBool,
    cancel: CancellationToken,
}

impl<P> ObserveCommits<P>
where
    P: Persistence + Clone + 'static,
{
    /// Attach an observer. It receives every commit polled from the next
    /// cycle on.
    ///
    /// # Errors
    ///
    /// [`PollingError::Disposed`] after [`dispose`](Self::dispose).
    pub fn subscribe(
        &self,
        observer: Arc<dyn CommitObserver>,
    ) -> Result<SubscriptionId, PollingError> {
        let mut subscribers = self.lock_subscribers();
        if self.is_disposed() {
            return Err(PollingError::Disposed);
        }
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        subscribers.push((id, observer));
        tracing::debug!(subscription = %id, "observer subscribed");
        Ok(id)
    }

    /// Attach a closure as an observer.
    ///
    /// # Errors
    ///
    /// [`PollingError::Disposed`] after [`dispose`](Self::dispose).
    pub fn subscribe_fn<F>(&self, on_next: F) -> Result<SubscriptionId, PollingError>
    where
        F: Fn(&Commit) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.subscribe(Arc::new(FnObserver(on_next)))
    }

    /// Receive commits as a [`Stream`]. The stream ends once the loop stops
    /// or the observation is disposed.
    ///
    /// # Errors
    ///
    /// [`PollingError::Disposed`] after [`dispose`](Self::dispose).
    pub fn commits(
        &self,
    ) -> Result<impl Stream<Item = Commit> + Send + Unpin + 'static, PollingError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribe(Arc::new(ChannelObserver(sender)))?;
        Ok(UnboundedReceiverStream::new(receiver))
    }

    /// Detach an observer. Returns `false` if it was not subscribed.
    ///
    /// # Errors
    ///
    /// [`PollingError::Disposed`] after [`dispose`](Self::dispose).
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool, PollingError> {
        let mut subscribers = self.lock_subscribers();
        if self.is_disposed() {
            return Err(PollingError::Disposed);
        }
        let before = subscribers.len();
        subscribers.retain(|(subscribed, _)| *subscribed != id);
        Ok(before != subscribers.len())
    }

    /// The checkpoint of the last delivered commit, or the starting token.
    ///
    /// # Panics
    ///
    /// Panics if the checkpoint lock is poisoned.
    #[must_use]
    pub fn checkpoint_token(&self) -> Option<String> {
        self.checkpoint_token
            .read()
            .expect("checkpoint lock poisoned")
            .clone()
    }

    /// Start polling on a background task.
    ///
    /// # Errors
    ///
    /// - [`PollingError::Disposed`] after [`dispose`](Self::dispose),
    /// - [`PollingError::AlreadyStarted`] on a second call,
    /// - [`PollingError::Storage`] when the starting token cannot be parsed.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn start(&self) -> Result<PollingHandle, PollingError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(PollingError::Disposed);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(PollingError::AlreadyStarted);
        }
        let token = self.checkpoint_token();
        let last = P::Checkpoint::parse_or_initial(token.as_deref()).map_err(StorageError::from)?;

        tracing::debug!(
            checkpoint = token.as_deref().unwrap_or("<start>"),
            interval = ?self.interval,
            "starting commit polling"
        );
        let task = tokio::spawn(poll_loop(PollState {
            persistence: self.persistence.clone(),
            interval: self.interval,
            token,
            last,
            shared_token: Arc::clone(&self.checkpoint_token),
            subscribers: Arc::clone(&self.subscribers),
            cancel: self.cancel.clone(),
        }));
        Ok(PollingHandle { task })
    }

    /// Stop polling and drop every subscriber. Idempotent; the loop finishes
    /// its current commit first.
    pub fn dispose(&self) {
        let mut subscribers = self.lock_subscribers();
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("disposing commit observation");
        self.cancel.cancel();
        subscribers.clear();
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers.lock().expect("subscriber lock poisoned")
    }
}

impl<P> Drop for ObserveCommits<P> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to a running polling loop.
///
/// Dropping the handle does not stop the loop; dispose the
/// [`ObserveCommits`] for that.
pub struct PollingHandle {
    task: JoinHandle<Result<(), PollingError>>,
}

impl PollingHandle {
    /// Wait for the loop to finish.
    ///
    /// # Errors
    ///
    /// The error that stopped the loop, or [`PollingError::TaskPanicked`].
    pub async fn wait(self) -> Result<(), PollingError> {
        self.task.await.map_err(PollingError::TaskPanicked)?
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

struct PollState<P: Persistence> {
    persistence: P,
    interval: Duration,
    token: Option<String>,
    last: P::Checkpoint,
    shared_token: Arc<RwLock<Option<String>>>,
    subscribers: Arc<Mutex<Subscribers>>,
    cancel: CancellationToken,
}

impl<P: Persistence> PollState<P> {
    fn snapshot_subscribers(&self) -> Subscribers {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .clone()
    }

    /// Deliver one commit to every subscriber. Returns the first failure
    /// after all subscribers have seen the commit.
    fn deliver(&self, subscribers: &Subscribers, commit: &Commit) -> Option<PollingError> {
        let mut failure = None;
        for (id, observer) in subscribers {
            let Err(source) = observer.on_next(commit) else {
                continue;
            };
            tracing::warn!(
                subscription = %id,
                checkpoint = %commit.checkpoint_token,
                error = %source,
                "observer failed"
            );
            let error = PollingError::Observer {
                subscription: *id,
                checkpoint_token: commit.checkpoint_token.clone(),
                source,
            };
            observer.on_error(&error);
            failure.get_or_insert(error);
        }
        failure
    }

    fn advance(&mut self, checkpoint: P::Checkpoint, token: &str) {
        self.last = checkpoint;
        self.token = Some(token.to_owned());
        *self.shared_token.write().expect("checkpoint lock poisoned") = self.token.clone();
    }
}

async fn poll_loop<P>(mut state: PollState<P>) -> Result<(), PollingError>
where
    P: Persistence,
{
    let result = poll_until_stopped(&mut state).await;
    // Dropping the observers closes every commit stream.
    state
        .subscribers
        .lock()
        .expect("subscriber lock poisoned")
        .clear();
    tracing::debug!(checkpoint = ?state.token, "commit polling stopped");
    result
}

async fn poll_until_stopped<P>(state: &mut PollState<P>) -> Result<(), PollingError>
where
    P: Persistence,
{
    loop {
        if state.cancel.is_cancelled() {
            break;
        }

        let commits = match state
            .persistence
            .get_from_checkpoint(None, state.token.as_deref())
            .await
        {
            Ok(commits) => commits,
            Err(error) => {
                tracing::error!(error = %error, "polling storage failed");
                let error = PollingError::Storage(error);
                for (_, observer) in state.snapshot_subscribers() {
                    observer.on_error(&error);
                }
                return Err(error);
            }
        };

        let subscribers = state.snapshot_subscribers();
        for commit in commits {
            if state.cancel.is_cancelled() {
                break;
            }
            let checkpoint = P::Checkpoint::parse(&commit.checkpoint_token)
                .map_err(StorageError::from)?;
            if checkpoint <= state.last {
                tracing::trace!(checkpoint = %commit.checkpoint_token, "skipping seen commit");
                continue;
            }

            let failure = state.deliver(&subscribers, &commit);
            state.advance(checkpoint, &commit.checkpoint_token);
            tracing::trace!(checkpoint = %commit.checkpoint_token, "commit delivered");
            if let Some(error) = failure {
                return Err(error);
            }
        }

        tokio::select! {
            biased;
            () = state.cancel.cancelled() => break,
            () = tokio::time::sleep(state.interval) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio_stream::StreamExt as _;

    use super::*;
    use crate::test::{PersistenceTestExt, RecordingPersistence};

    const INTERVAL: Duration = Duration::from_millis(10);
    const WAIT: Duration = Duration::from_secs(2);

    fn client(persistence: &RecordingPersistence) -> PollingClient<RecordingPersistence> {
        PollingClient::new(persistence.clone(), INTERVAL).unwrap()
    }

    async fn next_tokens(
        commits: &mut (impl Stream<Item = Commit> + Unpin),
        count: usize,
    ) -> Vec<String> {
        let mut tokens = Vec::with_capacity(count);
        for _ in 0..count {
            let commit = tokio::time::timeout(WAIT, commits.next())
                .await
                .expect("commit delivered in time")
                .expect("stream still open");
            tokens.push(commit.checkpoint_token);
        }
        tokens
    }

    #[test]
    fn zero_interval_is_rejected() {
        let result = PollingClient::new(RecordingPersistence::new(), Duration::ZERO);
        assert!(matches!(result, Err(PollingError::InvalidInterval)));
    }

    #[tokio::test]
    async fn delivers_existing_then_new_commits_in_checkpoint_order() {
        let persistence = RecordingPersistence::new();
        persistence.commit_many("b", "s", 2).await.unwrap();
        let observer = client(&persistence).observe_from(None);
        let mut commits = observer.commits().unwrap();
        let _handle = observer.start().unwrap();

        let existing = next_tokens(&mut commits, 2).await;
        persistence.commit_single("b", "other").await.unwrap();
        let new = next_tokens(&mut commits, 1).await;

        assert_eq!(existing, ["1", "2"]);
        assert_eq!(new, ["3"]);
        assert_eq!(observer.checkpoint_token().as_deref(), Some("3"));
        observer.dispose();
    }

    #[tokio::test]
    async fn starting_from_a_token_skips_everything_at_or_before_it() {
        let persistence = RecordingPersistence::new();
        persistence.commit_many("b", "s", 3).await.unwrap();
        let observer = client(&persistence).observe_from(Some("2"));
        let mut commits = observer.commits().unwrap();
        let _handle = observer.start().unwrap();

        assert_eq!(next_tokens(&mut commits, 1).await, ["3"]);
        observer.dispose();
    }

    #[tokio::test]
    async fn observer_failure_still_reaches_other_observers_then_stops() {
        let persistence = RecordingPersistence::new();
        persistence.commit_many("b", "s", 2).await.unwrap();
        let observer = client(&persistence).observe_from(None);
        let failing = observer
            .subscribe_fn(|_| Err("projection broke".into()))
            .unwrap();
        let mut commits = observer.commits().unwrap();

        let handle = observer.start().unwrap();
        let result = tokio::time::timeout(WAIT, handle.wait()).await.unwrap();

        assert!(matches!(
            result,
            Err(PollingError::Observer { subscription, ref checkpoint_token, .. })
                if subscription == failing && checkpoint_token == "1"
        ));
        assert_eq!(next_tokens(&mut commits, 1).await, ["1"]);
        assert_eq!(commits.next().await, None);
    }

    #[tokio::test]
    async fn storage_failure_is_reported_to_every_observer() {
        struct ErrorCounter(AtomicU64);
        impl CommitObserver for ErrorCounter {
            fn on_next(&self, _commit: &Commit) -> Result<(), BoxError> {
                Ok(())
            }
            fn on_error(&self, error: &PollingError) {
                assert!(matches!(error, PollingError::Storage(_)));
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let persistence = RecordingPersistence::new();
        persistence.fail_reads(true);
        let observer = client(&persistence).observe_from(None);
        let first = Arc::new(ErrorCounter(AtomicU64::new(0)));
        let second = Arc::new(ErrorCounter(AtomicU64::new(0)));
        observer.subscribe(first.clone()).unwrap();
        observer.subscribe(second.clone()).unwrap();

        let result = observer.start().unwrap().wait().await;

        assert!(matches!(result, Err(PollingError::Storage(StorageError::Backend(_)))));
        assert_eq!(first.0.load(Ordering::Relaxed), 1);
        assert_eq!(second.0.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn unsubscribed_observer_receives_nothing() {
        let persistence = RecordingPersistence::new();
        persistence.commit_single("b", "s").await.unwrap();
        let observer = client(&persistence).observe_from(None);
        let id = observer
            .subscribe_fn(|_| Err("should not be called".into()))
            .unwrap();
        let mut commits = observer.commits().unwrap();

        assert!(observer.unsubscribe(id).unwrap());
        assert!(!observer.unsubscribe(id).unwrap());
        let handle = observer.start().unwrap();

        assert_eq!(next_tokens(&mut commits, 1).await, ["1"]);
        assert!(handle.is_running());
        observer.dispose();
    }

    #[tokio::test]
    async fn dispose_stops_the_loop_and_blocks_restart() {
        let persistence = RecordingPersistence::new();
        let observer = client(&persistence).observe_from(None);
        let handle = observer.start().unwrap();

        assert!(matches!(observer.start(), Err(PollingError::AlreadyStarted)));
        observer.dispose();
        observer.dispose();

        tokio::time::timeout(WAIT, handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(observer.start(), Err(PollingError::Disposed)));
    }

    #[tokio::test]
    async fn disposed_observation_refuses_subscribers_and_closes_streams() {
        let observer = client(&RecordingPersistence::new()).observe_from(None);
        let id = observer.subscribe_fn(|_| Ok(())).unwrap();
        let mut early = observer.commits().unwrap();

        observer.dispose();

        assert!(matches!(
            observer.subscribe_fn(|_| Ok(())),
            Err(PollingError::Disposed)
        ));
        assert!(matches!(observer.commits(), Err(PollingError::Disposed)));
        assert!(matches!(observer.unsubscribe(id), Err(PollingError::Disposed)));
        let end = tokio::time::timeout(WAIT, early.next()).await.unwrap();
        assert_eq!(end, None);
    }

    #[tokio::test]
    async fn invalid_starting_token_fails_start() {
        let observer = client(&RecordingPersistence::new()).observe_from(Some("not-a-number"));
        assert!(matches!(
            observer.start(),
            Err(PollingError::Storage(StorageError::InvalidCheckpoint(_)))
        ));
    }
}
