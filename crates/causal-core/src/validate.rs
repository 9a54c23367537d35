//! Causal validation of candidate events.
//!
//! A candidate is accepted only when:
//!
//! 1. it declares a root exactly when it has parents,
//! 2. every parent is already stored, and
//! 3. its root equals the effective root (declared root, or own key for a
//!    genesis event) of at least one parent under [`RootRule::AnyParent`],
//!    or of every parent under [`RootRule::AllParents`].
//!
//! The fetched parents are returned as [`ValidatedParents`] and passed on to
//! the clock and index steps of the same put.

use serde::{Deserialize, Serialize};

use crate::backend::ContentStore;
use crate::cancel::Cancel;
use crate::error::{Stage, StoreError};
use crate::event::{Event, LogicalTime, NewEvent};
use crate::id::Id;

/// How a merge event's root is checked against its parents' roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootRule {
    /// One parent with a matching root suffices; cross-root merges are
    /// accepted as long as one side matches.
    #[default]
    AnyParent,
    /// Every parent must share the declared root.
    AllParents,
}

/// Parents of a validated candidate, in normalized (sorted) order.
#[derive(Debug, Clone, Default)]
pub struct ValidatedParents {
    events: Vec<Event>,
}

impl ValidatedParents {
    #[must_use]
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    #[must_use]
    pub fn keys(&self) -> Vec<Id> {
        self.events.iter().map(|e| e.key.clone()).collect()
    }

    /// The parents whose keys satisfy `keep`.
    #[must_use]
    pub fn subset(&self, keep: impl Fn(&Id) -> bool) -> Self {
        Self {
            events: self.events.iter().filter(|e| keep(&e.key)).cloned().collect(),
        }
    }

    /// Largest parent time; `None` for genesis events.
    #[must_use]
    pub fn max_time(&self) -> Option<LogicalTime> {
        self.events.iter().map(Event::time).max()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CausalValidator {
    rule: RootRule,
}

impl CausalValidator {
    #[must_use]
    pub const fn new(rule: RootRule) -> Self {
        Self { rule }
    }

    #[must_use]
    pub const fn rule(&self) -> RootRule {
        self.rule
    }

    /// Validate `candidate` against the events in `content`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidArgument`] for a root without parents, parents
    ///   without a root, or a root that matches no parent.
    /// - [`StoreError::MissingDependency`] listing exactly the absent parents.
    /// - [`StoreError::OperationFailed`] / [`StoreError::Corrupt`] if parents
    ///   cannot be read.
    pub async fn validate(
        &self,
        candidate: &NewEvent,
        content: &dyn ContentStore,
        cancel: &Cancel,
    ) -> Result<ValidatedParents, StoreError> {
        let parents = candidate.normalized_parents();

        match (&candidate.root, parents.is_empty()) {
            (Some(_), true) => return Err(StoreError::invalid("root without dependency")),
            (None, false) => return Err(StoreError::invalid("missing root")),
            (None, true) => return Ok(ValidatedParents::default()),
            (Some(_), false) => {}
        }
        cancel.check()?;

        let records = content
            .get_many(&parents)
            .await
            .map_err(|e| StoreError::failed(Stage::ContentRead, e))?;

        let mut missing = Vec::new();
        let mut events = Vec::with_capacity(parents.len());
        for (key, record) in parents.iter().zip(records) {
            match record {
                Some(bytes) => events.push(Event::decode(key, &bytes)?),
                None => missing.push(key.clone()),
            }
        }
        if !missing.is_empty() {
            return Err(StoreError::MissingDependency(missing));
        }

        let root = candidate.root.as_ref();
        let matches = |e: &Event| Some(e.effective_root()) == root;
        let root_ok = match self.rule {
            RootRule::AnyParent => events.iter().any(matches),
            RootRule::AllParents => events.iter().all(matches),
        };
        if !root_ok {
            return Err(StoreError::invalid("root mismatch"));
        }

        Ok(ValidatedParents { events })
    }
}
