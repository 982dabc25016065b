//! Commit record model.
//!
//! These are the value types that flow through every layer: the
//! [`CommitAttempt`] a stream builds when it has uncommitted events, the
//! durable [`Commit`] a storage engine hands back once the attempt has been
//! written, and the [`StreamHead`] / [`Snapshot`] shapes used for snapshot
//! bookkeeping.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::codec::Codec;

/// Bucket used when the caller does not partition its streams.
pub const DEFAULT_BUCKET: &str = "default";

/// Header key carrying an event's kind, read by
/// [`EventUpconverter`](crate::pipeline::upconvert::EventUpconverter).
pub const EVENT_KIND_HEADER: &str = "event-kind";

/// Header mapping attached to commits and individual events.
pub type Headers = BTreeMap<String, serde_json::Value>;

/// A single event inside a commit: an opaque body plus headers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub headers: Headers,
    /// `None` marks a message without a body; streams ignore such messages.
    pub body: Option<serde_json::Value>,
}

impl EventMessage {
    #[must_use]
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            headers: Headers::new(),
            body: Some(body),
        }
    }

    /// Tag the message with an event kind, used by upconverters.
    #[must_use]
    pub fn with_kind(self, kind: impl Into<String>) -> Self {
        self.with_header(EVENT_KIND_HEADER, serde_json::Value::String(kind.into()))
    }

    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    /// The event kind recorded under [`EVENT_KIND_HEADER`], if any.
    #[must_use]
    pub fn kind(&self) -> Option<&str> {
        self.headers
            .get(EVENT_KIND_HEADER)
            .and_then(serde_json::Value::as_str)
    }
}

/// A candidate commit that has not been written yet.
///
/// `stream_revision` is the revision of the *last* event in the attempt, so a
/// well-formed attempt against a head at revision `r` / sequence `s` carries
/// `r + events.len()` and `s + 1`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CommitAttempt {
    pub bucket_id: String,
    pub stream_id: String,
    pub stream_revision: u64,
    pub commit_id: Uuid,
    pub commit_sequence: u64,
    pub commit_stamp: DateTime<Utc>,
    pub headers: Headers,
    pub events: NonEmpty<EventMessage>,
}

impl CommitAttempt {
    /// Revision of the first event carried by this attempt.
    #[must_use]
    pub fn first_revision(&self) -> u64 {
        first_revision(self.stream_revision, self.events.len())
    }

    pub(crate) fn stream_key(&self) -> StreamKey {
        StreamKey::new(&self.bucket_id, &self.stream_id)
    }
}

/// A durably stored commit.
///
/// Carries every field of the attempt it was built from, plus the checkpoint
/// token the storage engine assigned when writing it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub bucket_id: String,
    pub stream_id: String,
    pub stream_revision: u64,
    pub commit_id: Uuid,
    pub commit_sequence: u64,
    pub commit_stamp: DateTime<Utc>,
    pub headers: Headers,
    pub events: NonEmpty<EventMessage>,
    pub checkpoint_token: String,
}

impl Commit {
    /// Promote an attempt to a commit at the given checkpoint.
    #[must_use]
    pub fn from_attempt(attempt: CommitAttempt, checkpoint_token: impl Into<String>) -> Self {
        let CommitAttempt {
            bucket_id,
            stream_id,
            stream_revision,
            commit_id,
            commit_sequence,
            commit_stamp,
            headers,
            events,
        } = attempt;
        Self {
            bucket_id,
            stream_id,
            stream_revision,
            commit_id,
            commit_sequence,
            commit_stamp,
            headers,
            events,
            checkpoint_token: checkpoint_token.into(),
        }
    }

    #[must_use]
    pub fn first_revision(&self) -> u64 {
        first_revision(self.stream_revision, self.events.len())
    }

    pub(crate) fn stream_key(&self) -> StreamKey {
        StreamKey::new(&self.bucket_id, &self.stream_id)
    }
}

fn first_revision(last: u64, event_count: usize) -> u64 {
    (last + 1).saturating_sub(event_count as u64)
}

/// Latest known position of a stream, as cached by a storage engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHead {
    pub bucket_id: String,
    pub stream_id: String,
    pub head_revision: u64,
    pub commit_sequence: u64,
    /// Revision of the most recent snapshot, `0` when there is none.
    pub snapshot_revision: u64,
}

impl StreamHead {
    /// Number of revisions written since the last snapshot.
    #[must_use]
    pub const fn revisions_since_snapshot(&self) -> u64 {
        self.head_revision.saturating_sub(self.snapshot_revision)
    }
}

/// Serialized aggregate state at a given stream revision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub bucket_id: String,
    pub stream_id: String,
    pub stream_revision: u64,
    pub payload: Vec<u8>,
}

impl Snapshot {
    /// Serialize `state` into a snapshot taken at `stream_revision`.
    ///
    /// # Errors
    ///
    /// Returns the codec's error when `state` cannot be serialized.
    pub fn encode<C, T>(
        codec: &C,
        bucket_id: impl Into<String>,
        stream_id: impl Into<String>,
        stream_revision: u64,
        state: &T,
    ) -> Result<Self, C::Error>
    where
        C: Codec,
        T: Serialize,
    {
        Ok(Self {
            bucket_id: bucket_id.into(),
            stream_id: stream_id.into(),
            stream_revision,
            payload: codec.serialize(state)?,
        })
    }

    /// Deserialize the snapshot payload.
    ///
    /// # Errors
    ///
    /// Returns the codec's error when the payload does not decode as `T`.
    pub fn decode<C, T>(&self, codec: &C) -> Result<T, C::Error>
    where
        C: Codec,
        T: DeserializeOwned,
    {
        codec.deserialize(&self.payload)
    }
}

/// Key identifying a stream within a bucket.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct StreamKey {
    pub(crate) bucket_id: String,
    pub(crate) stream_id: String,
}

impl StreamKey {
    pub(crate) fn new(bucket_id: &str, stream_id: &str) -> Self {
        Self {
            bucket_id: bucket_id.to_owned(),
            stream_id: stream_id.to_owned(),
        }
    }

    pub(crate) fn matches(&self, bucket_id: &str, stream_id: &str) -> bool {
        self.bucket_id == bucket_id && self.stream_id == stream_id
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::codec::JsonCodec;

    fn attempt(revision: u64, events: usize) -> CommitAttempt {
        let events = (0..events).map(|i| EventMessage::new(json!(i))).collect();
        CommitAttempt {
            bucket_id: DEFAULT_BUCKET.to_owned(),
            stream_id: "stream".to_owned(),
            stream_revision: revision,
            commit_id: Uuid::new_v4(),
            commit_sequence: 1,
            commit_stamp: Utc::now(),
            headers: Headers::from([("user".to_owned(), json!("alice"))]),
            events: NonEmpty::from_vec(events).expect("at least one event"),
        }
    }

    #[test]
    fn first_revision_accounts_for_every_event() {
        assert_eq!(attempt(4, 2).first_revision(), 3);
        assert_eq!(attempt(1, 1).first_revision(), 1);
    }

    #[test]
    fn commit_from_attempt_keeps_attempt_fields() {
        let attempt = attempt(2, 2);
        let commit = Commit::from_attempt(attempt.clone(), "7");

        assert_eq!(commit.bucket_id, attempt.bucket_id);
        assert_eq!(commit.stream_revision, 2);
        assert_eq!(commit.commit_id, attempt.commit_id);
        assert_eq!(commit.headers, attempt.headers);
        assert_eq!(commit.events, attempt.events);
        assert_eq!(commit.checkpoint_token, "7");
    }

    #[test]
    fn event_kind_is_read_from_headers() {
        let message = EventMessage::new(json!({"amount": 3})).with_kind("deposited");
        assert_eq!(message.kind(), Some("deposited"));
        assert_eq!(EventMessage::new(json!(1)).kind(), None);
    }

    #[test]
    fn snapshot_payload_decodes_to_encoded_state() {
        let codec = JsonCodec;
        let snapshot =
            Snapshot::encode(&codec, DEFAULT_BUCKET, "account-1", 42, &vec![1_u32, 2, 3])
                .expect("encode");
        let state: Vec<u32> = snapshot.decode(&codec).expect("decode");

        assert_eq!(snapshot.stream_revision, 42);
        assert_eq!(state, vec![1, 2, 3]);
    }

    #[test]
    fn stream_head_measures_distance_to_snapshot() {
        let head = StreamHead {
            bucket_id: DEFAULT_BUCKET.to_owned(),
            stream_id: "s".to_owned(),
            head_revision: 10,
            commit_sequence: 4,
            snapshot_revision: 6,
        };
        assert_eq!(head.revisions_since_snapshot(), 4);
    }
}
