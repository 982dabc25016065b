//! Event upconversion on the read path.
//!
//! Older event shapes stay in storage as they were written. An
//! [`EventUpconverter`] rewrites them into their current shape as commits are
//! read, using converters registered explicitly per event kind. Conversions
//! chain: `v1 -> v2 -> v3` is applied in one pass.
//!
//! ```
//! use eventide_core::pipeline::upconvert::EventUpconverter;
//! use serde_json::json;
//!
//! let upconverter = EventUpconverter::new()
//!     .register("order-placed.v1", "order-placed.v2", |mut body| {
//!         body["currency"] = json!("EUR");
//!         body
//!     })
//!     .unwrap();
//! ```

use std::{collections::HashMap, fmt, sync::Arc};

use thiserror::Error;

use crate::{
    commit::{Commit, EVENT_KIND_HEADER, EventMessage},
    pipeline::PipelineHook,
};

type Converter = Arc<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>;

#[derive(Debug, Error)]
pub enum UpconverterError {
    #[error("a converter for event kind `{0}` is already registered")]
    DuplicateConverter(String),
}

struct Registration {
    target_kind: String,
    convert: Converter,
}

/// Pipeline hook rewriting event bodies through registered converters.
#[derive(Default)]
pub struct EventUpconverter {
    converters: HashMap<String, Registration>,
}

impl EventUpconverter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a converter from `source_kind` to `target_kind`.
    ///
    /// # Errors
    ///
    /// Returns [`UpconverterError::DuplicateConverter`] if `source_kind`
    /// already has a converter.
    pub fn register<F>(
        mut self,
        source_kind: impl Into<String>,
        target_kind: impl Into<String>,
        convert: F,
    ) -> Result<Self, UpconverterError>
    where
        F: Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    {
        let source_kind = source_kind.into();
        if self.converters.contains_key(&source_kind) {
            return Err(UpconverterError::DuplicateConverter(source_kind));
        }
        self.converters.insert(
            source_kind,
            Registration {
                target_kind: target_kind.into(),
                convert: Arc::new(convert),
            },
        );
        Ok(self)
    }

    /// Convert one event as far as the registered chain goes.
    ///
    /// Returns `None` when no converter applies.
    fn convert(&self, event: &EventMessage) -> Option<EventMessage> {
        let mut kind = event.kind()?;
        let mut registration = self.converters.get(kind)?;
        let mut converted = event.clone();
        // Bounded so that a cyclic registration cannot spin forever.
        for _ in 0..=self.converters.len() {
            converted.body = converted.body.map(|body| (registration.convert)(body));
            converted.headers.insert(
                EVENT_KIND_HEADER.to_owned(),
                serde_json::Value::String(registration.target_kind.clone()),
            );
            tracing::trace!(from = kind, to = %registration.target_kind, "event upconverted");
            kind = registration.target_kind.as_str();
            match self.converters.get(kind) {
                Some(next) => registration = next,
                None => break,
            }
        }
        Some(converted)
    }
}

impl PipelineHook for EventUpconverter {
    fn select(&self, commit: Commit) -> Option<Commit> {
        let converted: Vec<_> = commit.events.iter().map(|e| self.convert(e)).collect();
        if converted.iter().all(Option::is_none) {
            return Some(commit);
        }

        let mut commit = commit;
        for (event, replacement) in commit.events.iter_mut().zip(converted) {
            if let Some(replacement) = replacement {
                *event = replacement;
            }
        }
        Some(commit)
    }
}

impl fmt::Debug for EventUpconverter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventUpconverter")
            .field("source_kinds", &self.converters.keys().collect::<Vec<_>>())
            .finish()
    }
}
