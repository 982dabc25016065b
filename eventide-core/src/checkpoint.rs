//! Checkpoint tokens imposing a global order over commits.
//!
//! Clients only ever see checkpoints as opaque strings
//! ([`Commit::checkpoint_token`](crate::commit::Commit::checkpoint_token)).
//! Storage engines pick a concrete [`Checkpoint`] type that knows how to parse
//! and compare those strings.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An engine-specific ordering token.
pub trait Checkpoint: Ord + Clone + fmt::Debug + Send + Sync + 'static {
    /// The position before any commit.
    fn initial() -> Self;

    /// Parse a token previously produced by [`Checkpoint::token`].
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointParseError`] when `token` is not a valid checkpoint.
    fn parse(token: &str) -> Result<Self, CheckpointParseError>;

    /// The opaque string handed to clients.
    fn token(&self) -> String;

    /// Parse an optional token, treating `None` as [`Checkpoint::initial`].
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointParseError`] when a present token is invalid.
    fn parse_or_initial(token: Option<&str>) -> Result<Self, CheckpointParseError> {
        token.map_or_else(|| Ok(Self::initial()), Self::parse)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid checkpoint token `{token}`: {reason}")]
pub struct CheckpointParseError {
    pub token: String,
    pub reason: String,
}

/// Monotonically increasing integer checkpoint, encoded as a decimal string.
///
/// `0` is the initial position; the first commit gets `1`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LongCheckpoint(pub u64);

impl LongCheckpoint {
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Checkpoint for LongCheckpoint {
    fn initial() -> Self {
        Self(0)
    }

    fn parse(token: &str) -> Result<Self, CheckpointParseError> {
        if token.is_empty() {
            return Ok(Self::initial());
        }
        token
            .parse()
            .map(Self)
            .map_err(|e: std::num::ParseIntError| CheckpointParseError {
                token: token.to_owned(),
                reason: e.to_string(),
            })
    }

    fn token(&self) -> String {
        self.0.to_string()
    }
}

impl fmt::Display for LongCheckpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
