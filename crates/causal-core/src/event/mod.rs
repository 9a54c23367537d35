//! Event records of the causal log.
//!
//! A caller submits a [`NewEvent`]: a typed, opaque payload plus its causal
//! parents and declared root. The store assigns the content-addressed key and
//! the logical time and persists an [`Event`].
//!
//! # Key derivation
//!
//! The key is the hash of the canonical JSON of
//!
//! ```text
//! {"parents":[...sorted, deduplicated...],"payload":...,"root":...|null,"type":"..."}
//! ```
//!
//! Logical time is assigned at write time and is deliberately not part of the
//! hash input, so resubmitting the same content yields the same key.
//! Because the parent list is hashed, an event can only name keys that exist
//! before it is created, which rules out cycles.

pub mod canonical;
pub mod types;

pub use canonical::canonicalize_json;
pub use types::{DEFAULT_TYPE_SEPARATORS, EventType, EventTypeError, LogicalTime};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::StoreError;
use crate::id::{ContentHasher, Id};

/// An event as submitted by a caller, before the store assigns key and time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    pub event_type: EventType,
    pub payload: Value,
    pub parents: Vec<Id>,
    pub root: Option<Id>,
}

impl NewEvent {
    /// An event with no parents, starting a new causal line.
    #[must_use]
    pub const fn genesis(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            payload,
            parents: Vec::new(),
            root: None,
        }
    }

    /// An event that follows `parents` within the line identified by `root`.
    #[must_use]
    pub fn child(
        event_type: EventType,
        payload: Value,
        root: Id,
        parents: impl IntoIterator<Item = Id>,
    ) -> Self {
        Self {
            event_type,
            payload,
            parents: parents.into_iter().collect(),
            root: Some(root),
        }
    }

    /// Parents sorted and deduplicated; the form that is hashed and stored.
    #[must_use]
    pub fn normalized_parents(&self) -> Vec<Id> {
        let mut parents = self.parents.clone();
        parents.sort();
        parents.dedup();
        parents
    }

    /// Canonical bytes the content key is computed from.
    #[must_use]
    pub fn content_bytes(&self) -> Vec<u8> {
        content_json(
            &self.event_type,
            &self.payload,
            &self.normalized_parents(),
            self.root.as_ref(),
        )
        .into_bytes()
    }

    /// Content key under `hasher`.
    #[must_use]
    pub fn key_with(&self, hasher: &dyn ContentHasher) -> Id {
        hasher.hash(&self.content_bytes())
    }

    pub(crate) fn into_event(self, key: Id, time: LogicalTime) -> Event {
        let parents = self.normalized_parents();
        Event {
            key,
            event_type: self.event_type,
            payload: self.payload,
            meta: EventMeta {
                parents,
                root: self.root,
                time,
            },
        }
    }
}

/// Causal metadata of a stored event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Causal predecessors, sorted. Empty for a genesis event.
    pub parents: Vec<Id>,
    /// Declared root; `None` for genesis events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<Id>,
    /// Logical time assigned by the store.
    pub time: LogicalTime,
}

/// An immutable stored event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub key: Id,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: Value,
    pub meta: EventMeta,
}

impl Event {
    /// The root descendants of this event must declare: its own declared
    /// root, or its key when it is a genesis event.
    #[must_use]
    pub fn effective_root(&self) -> &Id {
        self.meta.root.as_ref().unwrap_or(&self.key)
    }

    #[must_use]
    pub const fn time(&self) -> LogicalTime {
        self.meta.time
    }

    #[must_use]
    pub fn is_genesis(&self) -> bool {
        self.meta.parents.is_empty()
    }

    /// Recompute the content key under `hasher`.
    ///
    /// Equal to [`Event::key`] for any record that has not been tampered with.
    #[must_use]
    pub fn content_key(&self, hasher: &dyn ContentHasher) -> Id {
        let text = content_json(
            &self.event_type,
            &self.payload,
            &self.meta.parents,
            self.meta.root.as_ref(),
        );
        hasher.hash(text.as_bytes())
    }

    /// Serialize to the stored record form.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the payload cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(self).map_err(|e| StoreError::Corrupt {
            key: self.key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Decode a stored record and check it belongs to `key`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the bytes do not decode or carry a
    /// different key.
    pub fn decode(key: &Id, bytes: &[u8]) -> Result<Self, StoreError> {
        let event: Self = serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        if &event.key != key {
            return Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("record carries key {}", event.key),
            });
        }
        Ok(event)
    }
}

fn content_json(
    event_type: &EventType,
    payload: &Value,
    parents: &[Id],
    root: Option<&Id>,
) -> String {
    let parents: Vec<&str> = parents.iter().map(Id::as_str).collect();
    canonicalize_json(&json!({
        "type": event_type.as_str(),
        "payload": payload,
        "parents": parents,
        "root": root.map(Id::as_str),
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
