//! Commit pipeline hooks.
//!
//! A [`PipelineHook`] is a cross-cutting extension invoked around every store
//! operation. Hooks are kept in registration order by [`Pipeline`]:
//!
//! - `pre_commit` may veto a write before it reaches storage,
//! - `post_commit` observes every durable write,
//! - `select` filters or substitutes every commit coming out of a read path,
//! - `on_purge` / `on_delete_stream` hear about destructive operations.
//!
//! Every method has a no-op default, so a hook implements only what it needs.

use std::{fmt, sync::Arc};

use crate::{
    commit::{Commit, CommitAttempt},
    persistence::CommitError,
};

pub mod tracking;
pub mod upconvert;

/// Extension invoked around store reads and writes.
pub trait PipelineHook: Send + Sync {
    /// Transform or suppress a commit produced by a read.
    ///
    /// Returning `None` removes the commit from the result sequence.
    fn select(&self, commit: Commit) -> Option<Commit> {
        Some(commit)
    }

    /// Inspect an attempt before it is written.
    ///
    /// Returning `Ok(false)` silently aborts the commit.
    ///
    /// # Errors
    ///
    /// A hook may reject the attempt outright, e.g. with a conflict it
    /// detected without touching storage.
    fn pre_commit(&self, attempt: &CommitAttempt) -> Result<bool, CommitError> {
        let _ = attempt;
        Ok(true)
    }

    fn post_commit(&self, commit: &Commit) {
        let _ = commit;
    }

    /// Everything (`None`) or one bucket was purged.
    fn on_purge(&self, bucket_id: Option<&str>) {
        let _ = bucket_id;
    }

    fn on_delete_stream(&self, bucket_id: &str, stream_id: &str) {
        let _ = (bucket_id, stream_id);
    }
}

/// Ordered hook chain.
#[derive(Clone, Default)]
pub struct Pipeline {
    hooks: Vec<Arc<dyn PipelineHook>>,
}

impl Pipeline {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: Arc<dyn PipelineHook>) {
        self.hooks.push(hook);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook's `select`, feeding each the previous output.
    #[must_use]
    pub fn select(&self, commit: Commit) -> Option<Commit> {
        self.hooks
            .iter()
            .try_fold(commit, |commit, hook| hook.select(commit))
    }

    /// Run `pre_commit` in order, stopping at the first veto or error.
    ///
    /// # Errors
    ///
    /// Propagates the first hook error.
    pub fn pre_commit(&self, attempt: &CommitAttempt) -> Result<bool, CommitError> {
        for hook in &self.hooks {
            if !hook.pre_commit(attempt)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn post_commit(&self, commit: &Commit) {
        for hook in &self.hooks {
            hook.post_commit(commit);
        }
    }

    pub fn on_purge(&self, bucket_id: Option<&str>) {
        for hook in &self.hooks {
            hook.on_purge(bucket_id);
        }
    }

    pub fn on_delete_stream(&self, bucket_id: &str, stream_id: &str) {
        for hook in &self.hooks {
            hook.on_delete_stream(bucket_id, stream_id);
        }
    }

    /// Wrap a read result so that `select` runs as the caller iterates.
    #[must_use]
    pub fn selected(&self, commits: Vec<Commit>) -> SelectedCommits {
        SelectedCommits {
            commits: commits.into_iter(),
            pipeline: self.clone(),
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("hooks", &self.hooks.len())
            .finish()
    }
}

/// Commits from a read path, filtered through the pipeline lazily.
///
/// Each commit goes through `select` only when the iterator reaches it, so
/// stopping early skips the hooks for the rest.
pub struct SelectedCommits {
    commits: std::vec::IntoIter<Commit>,
    pipeline: Pipeline,
}

impl Iterator for SelectedCommits {
    type Item = Commit;

    fn next(&mut self) -> Option<Commit> {
        self.commits
            .by_ref()
            .find_map(|commit| self.pipeline.select(commit))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, self.commits.size_hint().1)
    }
}

impl fmt::Debug for SelectedCommits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectedCommits")
            .field("remaining", &self.commits.len())
            .finish_non_exhaustive()
    }
}
