//! Event queries and their two evaluation strategies.
//!
//! Stores with a key encoder answer queries by range-scanning one index axis
//! ([`indexed`]); stores without one walk the DAG backwards from the head set
//! ([`walk`]). Both yield events in an order where every parent precedes its
//! children, and both return a checkpoint that resumes exactly where the page
//! ended when passed back as `since`.

pub(crate) mod indexed;
pub(crate) mod walk;

use serde::{Deserialize, Serialize};

use crate::backend::{ContentStore, SortedKv};
use crate::cancel::Cancel;
use crate::error::{Stage, StoreError};
use crate::event::{Event, EventType};
use crate::heads::HeadSet;
use crate::id::Id;

/// Filter and paging parameters.
///
/// ```
/// use causal_core::query::Query;
/// use causal_core::event::EventType;
///
/// let q = Query::new()
///     .event_type(EventType::new("order").unwrap())
///     .limit(50);
/// assert!(!q.head);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Only events whose effective root is this key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<Id>,
    /// Only events whose type equals this name or has it as a prefix.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,
    /// Checkpoint from an earlier page; events it already covers are skipped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub since: Vec<Id>,
    /// Only current heads.
    #[serde(default)]
    pub head: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl Query {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn root(mut self, root: Id) -> Self {
        self.root = Some(root);
        self
    }

    #[must_use]
    pub fn event_type(mut self, event_type: EventType) -> Self {
        self.event_type = Some(event_type);
        self
    }

    #[must_use]
    pub fn since(mut self, checkpoint: impl IntoIterator<Item = Id>) -> Self {
        self.since = checkpoint.into_iter().collect();
        self
    }

    #[must_use]
    pub const fn heads_only(mut self) -> Self {
        self.head = true;
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` passes the root and type filters.
    #[must_use]
    pub fn matches(&self, event: &Event, separators: &[char]) -> bool {
        let root_ok = self
            .root
            .as_ref()
            .is_none_or(|root| event.effective_root() == root);
        let type_ok = self
            .event_type
            .as_ref()
            .is_none_or(|ty| event.event_type.matches(ty, separators));
        root_ok && type_ok
    }

    pub(crate) fn normalized_since(&self) -> Vec<Id> {
        let mut since = self.since.clone();
        since.sort();
        since.dedup();
        since
    }
}

/// One page of results and the checkpoint to resume after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub checkpoint: Vec<Id>,
}

impl<T> Page<T> {
    #[must_use]
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            checkpoint: self.checkpoint,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Read-side view of a store handed to the query strategies.
#[derive(Clone, Copy)]
pub(crate) struct Sources<'a> {
    pub content: &'a dyn ContentStore,
    pub kv: &'a dyn SortedKv,
    pub heads: &'a HeadSet,
    pub separators: &'a [char],
}

/// Fetch and decode one event.
pub(crate) async fn fetch(
    content: &dyn ContentStore,
    key: &Id,
) -> Result<Option<Event>, StoreError> {
    let record = content
        .get(key)
        .await
        .map_err(|e| StoreError::failed(Stage::ContentRead, e))?;
    record.map(|bytes| Event::decode(key, &bytes)).transpose()
}

/// Fetch every checkpoint event; any absent key is a missing dependency.
pub(crate) async fn load_since(
    content: &dyn ContentStore,
    since: &[Id],
    cancel: &Cancel,
) -> Result<Vec<Event>, StoreError> {
    if since.is_empty() {
        return Ok(Vec::new());
    }
    cancel.check()?;
    let records = content
        .get_many(since)
        .await
        .map_err(|e| StoreError::failed(Stage::ContentRead, e))?;

    let mut missing = Vec::new();
    let mut events = Vec::with_capacity(since.len());
    for (key, record) in since.iter().zip(records) {
        match record {
            Some(bytes) => events.push(Event::decode(key, &bytes)?),
            None => missing.push(key.clone()),
        }
    }
    if missing.is_empty() {
        Ok(events)
    } else {
        Err(StoreError::MissingDependency(missing))
    }
}
