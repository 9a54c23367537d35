use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result};
use causal_core::{
    Cancel, Event, EventStore, EventStoreBuilder, Id, MemoryBackend, NewEvent, Query, StoreError,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::workload::LocalView;

/// Stable identifier for a simulated replica.
pub type ReplicaId = usize;

/// Page size used when a snapshot pages through the whole log.
const SNAPSHOT_PAGE: usize = 3;

/// What happened to a delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Delivery {
    /// Stored for the first time.
    Stored,
    /// Already present; the put was a no-op.
    Duplicate,
    /// Parents not here yet; held for retry.
    Parked,
}

/// Immutable snapshot of a replica's store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaState {
    pub id: ReplicaId,
    pub indexed: bool,
    /// Every stored key.
    pub keys: BTreeSet<Id>,
    /// Head set as tracked by the store, sorted.
    pub heads: Vec<Id>,
    /// Full unfiltered listing in store order.
    pub listing: Vec<Event>,
    /// Keys of the same listing read in small pages.
    pub paged: Vec<Id>,
    /// Events still waiting on parents.
    pub parked: usize,
}

/// One event store plus the bookkeeping a simulated writer needs.
#[derive(Debug)]
pub struct SimulatedReplica {
    id: ReplicaId,
    store: EventStore,
    roots: HashMap<Id, Id>,
    known: Vec<(Id, Id)>,
    authored: Vec<NewEvent>,
    parked: Vec<NewEvent>,
    serial: u64,
}

impl SimulatedReplica {
    /// Open an empty in-memory replica, indexed or walk-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails to open.
    pub async fn open(id: ReplicaId, indexed: bool) -> Result<Self> {
        let builder = EventStoreBuilder::with_backend(Arc::new(MemoryBackend::new()));
        let builder = if indexed { builder } else { builder.unindexed() };
        let store = builder
            .open(&Cancel::new())
            .await
            .with_context(|| format!("open replica {id}"))?;
        Ok(Self {
            id,
            store,
            roots: HashMap::new(),
            known: Vec::new(),
            authored: Vec::new(),
            parked: Vec::new(),
            serial: 0,
        })
    }

    #[must_use]
    pub const fn id(&self) -> ReplicaId {
        self.id
    }

    #[must_use]
    pub const fn store(&self) -> &EventStore {
        &self.store
    }

    /// The next authoring serial, advancing the counter.
    pub const fn next_serial(&mut self) -> u64 {
        let serial = self.serial;
        self.serial = self.serial.saturating_add(1);
        serial
    }

    /// Run `f` against the replica's current heads and known events.
    pub fn with_view<T>(&self, f: impl FnOnce(&LocalView<'_>) -> T) -> T {
        let heads = self.store.heads();
        f(&LocalView {
            heads: &heads,
            known: &self.known,
            authored: &self.authored,
        })
    }

    /// Store a locally authored event and remember it for resubmission.
    ///
    /// # Errors
    ///
    /// Fails on any store error; a local author only names parents it has.
    pub async fn author(&mut self, event: NewEvent, cancel: &Cancel) -> Result<Id> {
        let key = self
            .store
            .put(event.clone(), cancel)
            .await
            .with_context(|| format!("replica {} authoring", self.id))?;
        if self.learn(&key, &event) {
            self.authored.push(event);
        }
        self.retry_parked(cancel).await?;
        Ok(key)
    }

    /// Apply an event received from a peer.
    ///
    /// # Errors
    ///
    /// Fails on any store error other than a missing dependency, which parks
    /// the event instead.
    pub async fn receive(&mut self, event: NewEvent, cancel: &Cancel) -> Result<Delivery> {
        match self.store.put(event.clone(), cancel).await {
            Ok(key) => {
                let fresh = self.learn(&key, &event);
                if fresh {
                    self.retry_parked(cancel).await?;
                    Ok(Delivery::Stored)
                } else {
                    Ok(Delivery::Duplicate)
                }
            }
            Err(StoreError::MissingDependency(missing)) => {
                debug!(replica = self.id, missing = missing.len(), "parking event");
                self.parked.push(event);
                Ok(Delivery::Parked)
            }
            Err(err) => Err(err).with_context(|| format!("replica {} receiving", self.id)),
        }
    }

    /// Resubmit every stored event and report keys whose put changed the
    /// head set or returned a different key.
    ///
    /// # Errors
    ///
    /// Fails on any store error.
    pub async fn resubmit_all(&self, cancel: &Cancel) -> Result<Vec<(Id, Id)>> {
        let page = self.store.values(&Query::new(), cancel).await?;
        let mut changed = Vec::new();
        for event in page.items {
            let heads_before = self.store.heads();
            let resubmitted = NewEvent {
                event_type: event.event_type.clone(),
                payload: event.payload.clone(),
                parents: event.meta.parents.clone(),
                root: event.meta.root.clone(),
            };
            let returned = self.store.put(resubmitted, cancel).await?;
            if returned != event.key || self.store.heads() != heads_before {
                changed.push((event.key, returned));
            }
        }
        Ok(changed)
    }

    /// Read the replica's full state.
    ///
    /// # Errors
    ///
    /// Fails on any store error.
    pub async fn snapshot(&self, cancel: &Cancel) -> Result<ReplicaState> {
        let listing = self.store.values(&Query::new(), cancel).await?.items;

        let mut paged = Vec::new();
        let mut since = Vec::new();
        loop {
            let query = Query::new().since(since).limit(SNAPSHOT_PAGE);
            let page = self.store.keys(&query, cancel).await?;
            if page.is_empty() || paged.len() > listing.len() {
                break;
            }
            since = page.checkpoint;
            paged.extend(page.items);
        }

        Ok(ReplicaState {
            id: self.id,
            indexed: self.store.is_indexed(),
            keys: listing.iter().map(|e| e.key.clone()).collect(),
            heads: self.store.heads(),
            listing,
            paged,
            parked: self.parked.len(),
        })
    }

    #[must_use]
    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    /// Record a stored key; `true` when it was not known before.
    fn learn(&mut self, key: &Id, event: &NewEvent) -> bool {
        if self.roots.contains_key(key) {
            return false;
        }
        let root = event.root.clone().unwrap_or_else(|| key.clone());
        self.roots.insert(key.clone(), root.clone());
        self.known.push((key.clone(), root));
        true
    }

    /// Retry parked events until a full pass makes no progress.
    async fn retry_parked(&mut self, cancel: &Cancel) -> Result<()> {
        loop {
            let mut progressed = false;
            let mut still_parked = Vec::new();
            for event in std::mem::take(&mut self.parked) {
                match self.store.put(event.clone(), cancel).await {
                    Ok(key) => {
                        self.learn(&key, &event);
                        progressed = true;
                    }
                    Err(StoreError::MissingDependency(_)) => still_parked.push(event),
                    Err(err) => {
                        return Err(err).with_context(|| format!("replica {} retrying", self.id));
                    }
                }
            }
            self.parked = still_parked;
            if !progressed {
                return Ok(());
            }
        }
    }
}
