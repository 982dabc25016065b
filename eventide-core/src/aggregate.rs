//! Command-side domain objects stored as event streams.
//!
//! An [`Aggregate`] rebuilds its state by applying its own events. An
//! [`AggregateRoot`] wraps that state with the identity and version the
//! [`Repository`](crate::repository::Repository) needs, and records the events
//! raised since the aggregate was loaded.

use serde::{Serialize, de::DeserializeOwned};

/// State rebuilt from a stream of domain events.
///
/// Events are stored as JSON bodies, so they must round-trip through serde.
/// Snapshots additionally need the state itself to be `Serialize` and
/// `DeserializeOwned`.
// ANCHOR: aggregate_trait
pub trait Aggregate: Default {
    /// Aggregate type identifier, recorded on every commit under
    /// [`AGGREGATE_KIND_HEADER`](crate::repository::AGGREGATE_KIND_HEADER).
    /// Use lowercase, kebab-case: `"account"`, `"user-profile"`.
    const KIND: &'static str;

    type Event: Serialize + DeserializeOwned;

    /// Apply an event to update state. Called both when replaying history and
    /// when raising a new event.
    fn apply(&mut self, event: &Self::Event);
}
// ANCHOR_END: aggregate_trait

/// An aggregate instance with its identity, version and pending events.
///
/// The version counts every event applied, persisted or not, so it matches
/// the stream revision once the pending events are saved.
#[derive(Debug)]
pub struct AggregateRoot<A: Aggregate> {
    id: String,
    state: A,
    version: u64,
    uncommitted: Vec<A::Event>,
}

impl<A: Aggregate> AggregateRoot<A> {
    /// A fresh aggregate at version 0 with default state.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: A::default(),
            version: 0,
            uncommitted: Vec::new(),
        }
    }

    /// Apply `event` and queue it for the next save.
    pub fn raise(&mut self, event: A::Event) {
        self.state.apply(&event);
        self.version += 1;
        self.uncommitted.push(event);
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn state(&self) -> &A {
        &self.state
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// The version as of the last load or save.
    #[must_use]
    pub fn persisted_version(&self) -> u64 {
        self.version - self.uncommitted.len() as u64
    }

    #[must_use]
    pub fn uncommitted_events(&self) -> &[A::Event] {
        &self.uncommitted
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.uncommitted.is_empty()
    }

    pub(crate) fn restore(id: impl Into<String>, state: A, version: u64) -> Self {
        Self {
            state,
            version,
            ..Self::new(id)
        }
    }

    pub(crate) fn mark_committed(&mut self) {
        self.uncommitted.clear();
    }
}
