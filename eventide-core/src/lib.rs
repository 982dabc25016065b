//! Core traits and types for the eventide event-sourcing storage core.
//!
//! This crate provides the consistency engine behind an append-only,
//! per-stream commit log:
//!
//! - [`commit`] - The data model (`EventMessage`, `CommitAttempt`, `Commit`, `Snapshot`)
//! - [`checkpoint`] - Global commit ordering (`Checkpoint`, `LongCheckpoint`)
//! - [`persistence`] - Storage engine contract (`Persistence`) and an in-memory engine
//! - [`pipeline`] - Hooks around reads and writes (`PipelineHook`, `CommitTracker`)
//! - [`stream`] - Read-append view of one stream (`OptimisticEventStream`)
//! - [`store`] - The entry point tying it together (`OptimisticEventStore`)
//! - [`dispatch`] - Forwarding persisted commits (`DispatchScheduler`)
//! - [`polling`] - Resumable commit feeds (`PollingClient`)
//! - [`concurrency`] - Conflict and duplicate errors
//! - [`aggregate`] / [`repository`] - Aggregates stored as streams (`Repository`)
//!
//! # Example
//!
//! ```
//! use eventide_core::{persistence::inmemory::InMemoryPersistence, store::OptimisticEventStore};
//!
//! let store = OptimisticEventStore::new(InMemoryPersistence::new());
//! let stream = store.create_stream("default", "order-17").unwrap();
//! assert_eq!(stream.stream_revision(), 0);
//! ```
//!
//! Most users should depend on the [`eventide`](https://docs.rs/eventide)
//! crate, which re-exports these types with a flatter API surface.

pub mod aggregate;
pub mod checkpoint;
pub mod clock;
pub mod codec;
pub mod commit;
pub mod concurrency;
pub mod dispatch;
pub mod persistence;
pub mod pipeline;
pub mod polling;
pub mod repository;
pub mod store;
pub mod stream;

// Test utilities module: public when feature enabled, internal for crate tests
#[cfg(feature = "test-util")]
pub mod test;

#[cfg(all(test, not(feature = "test-util")))]
pub(crate) mod test;
