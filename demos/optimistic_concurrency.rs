//! Demonstrates optimistic concurrency control for competing writers.
//!
//! Two writers open the same stream and both try to append. The second one
//! gets a conflict, finds its stream already refreshed with what it missed,
//! and retries. Every persisted commit is dispatched in the background and
//! followed by a polling subscription.
//!
//! Run with: `RUST_LOG=eventide_core=debug cargo run --example optimistic_concurrency`

use std::{sync::Arc, time::Duration};

use eventide::{
    Commit, DEFAULT_BUCKET, EventMessage, OptimisticEventStore, StreamError,
    dispatch::{AsynchronousDispatchScheduler, DispatchCommits, DispatcherStartup},
    persistence::{BoxError, inmemory::InMemoryPersistence},
    polling::PollingClient,
};
use serde_json::json;
use tokio_stream::StreamExt as _;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

// =============================================================================
// Dispatch target
// =============================================================================

/// Prints every commit it receives, standing in for a message bus.
struct ConsoleBus;

impl DispatchCommits for ConsoleBus {
    fn dispatch(&self, commit: &Commit) -> Result<(), BoxError> {
        println!(
            "   [bus] commit {} on {}/{} (revision {})",
            commit.commit_sequence, commit.bucket_id, commit.stream_id, commit.stream_revision
        );
        Ok(())
    }
}

// =============================================================================
// Example
// =============================================================================

fn reserved(quantity: u32) -> EventMessage {
    EventMessage::new(json!({ "quantity": quantity })).with_kind("inventory.item.reserved")
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let persistence = InMemoryPersistence::new();
    let store = OptimisticEventStore::new(persistence.clone()).with_dispatch_scheduler(
        AsynchronousDispatchScheduler::new(
            Arc::new(ConsoleBus),
            persistence.clone(),
            DispatcherStartup::Auto,
        ),
    );

    println!("1. Restocking SKU-001...");
    let mut stream = store.create_stream(DEFAULT_BUCKET, "SKU-001")?;
    stream.add(
        EventMessage::new(json!({ "quantity": 100 })).with_kind("inventory.item.restocked"),
    )?;
    stream.commit_changes(Uuid::new_v4()).await?;

    println!("2. Two writers load revision {}...", stream.stream_revision());
    let mut alice = store.open_stream(DEFAULT_BUCKET, "SKU-001", 0, 0).await?;
    let mut bob = store.open_stream(DEFAULT_BUCKET, "SKU-001", 0, 0).await?;

    alice.add(reserved(30))?;
    alice.commit_changes(Uuid::new_v4()).await?;
    println!("   alice reserved 30, stream at revision {}", alice.stream_revision());

    bob.add(reserved(20))?;
    match bob.commit_changes(Uuid::new_v4()).await {
        Err(StreamError::Conflict(conflict)) => {
            println!("   bob hit a conflict: {conflict}");
            println!(
                "   bob now sees revision {} with {} pending event(s); retrying",
                bob.stream_revision(),
                bob.uncommitted_events().len()
            );
            bob.commit_changes(Uuid::new_v4()).await?;
        }
        other => other?,
    }
    println!("   bob reserved 20, stream at revision {}", bob.stream_revision());

    println!("3. Following the commit feed...");
    let client = PollingClient::new(persistence, Duration::from_millis(50))?;
    let observer = client.observe_from(None);
    let mut commits = observer.commits()?.take(3);
    let handle = observer.start()?;
    while let Some(commit) = commits.next().await {
        println!(
            "   [feed] checkpoint {}: {} event(s)",
            commit.checkpoint_token,
            commit.events.len()
        );
    }
    observer.dispose();
    handle.wait().await?;

    store.dispose();
    Ok(())
}
