//! The event store facade.
//!
//! [`EventStore`] composes a content store, a sorted key-value store, a
//! hasher, a validator, a clock, the head set and an index policy. Writes go
//! through one pipeline:
//!
//! ```text
//! Received → Validating → Rejected
//!                       → TimestampAssigned → IndexUpdated → HeadSetUpdated → Persisted
//! ```
//!
//! Index entries and head-set changes are committed in one [`SortedKv`]
//! batch; the content record is written last. If that write fails the batch
//! is undone. Should the undo fail too, it is queued and committed at the
//! front of the next batch; until then queries skip the leftover entries
//! (see [`crate::query`]). A head left without content by a crash is replaced
//! by the heads it evicted when the store is next opened (see
//! [`HeadSet::recover`]).

use std::sync::{Arc, PoisonError};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{ContentStore, KvOp, SortedKv};
use crate::cancel::Cancel;
use crate::clock::{Clock, LogicalClock};
use crate::error::{Stage, StoreError};
use crate::event::{DEFAULT_TYPE_SEPARATORS, Event, NewEvent};
use crate::heads::{HeadChange, HeadSet};
use crate::id::{Blake3Hasher, ContentHasher, Id};
use crate::index::{CompositeIndex, IndexKeyEncoder, IndexPolicy, NoIndex, render_key};
use crate::query::{self, Page, Query, Sources};
use crate::validate::{CausalValidator, RootRule, ValidatedParents};

/// Result of one item of [`EventStore::put_many`].
#[derive(Debug)]
pub struct PutOutcome {
    pub key: Id,
    pub error: Option<StoreError>,
}

impl PutOutcome {
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Assembles an [`EventStore`] from its parts.
///
/// Defaults: [`Blake3Hasher`], a fresh [`LogicalClock`] (reseeded from the
/// stored heads at open), [`RootRule::AnyParent`], the default type
/// separators and a [`CompositeIndex`].
pub struct EventStoreBuilder {
    content: Arc<dyn ContentStore>,
    kv: Arc<dyn SortedKv>,
    hasher: Arc<dyn ContentHasher>,
    clock: Arc<dyn Clock>,
    index: Option<Arc<dyn IndexPolicy>>,
    separators: Vec<char>,
    root_rule: RootRule,
}

impl EventStoreBuilder {
    #[must_use]
    pub fn new(content: Arc<dyn ContentStore>, kv: Arc<dyn SortedKv>) -> Self {
        Self {
            content,
            kv,
            hasher: Arc::new(Blake3Hasher),
            clock: Arc::new(LogicalClock::new()),
            index: None,
            separators: DEFAULT_TYPE_SEPARATORS.to_vec(),
            root_rule: RootRule::default(),
        }
    }

    /// One backend value serving both storage roles.
    #[must_use]
    pub fn with_backend<B>(backend: Arc<B>) -> Self
    where
        B: ContentStore + SortedKv + 'static,
    {
        Self::new(backend.clone(), backend)
    }

    #[must_use]
    pub fn hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn index(mut self, index: Arc<dyn IndexPolicy>) -> Self {
        self.index = Some(index);
        self
    }

    /// Answer queries by walking the DAG instead of scanning an index.
    #[must_use]
    pub fn unindexed(self) -> Self {
        self.index(Arc::new(NoIndex))
    }

    #[must_use]
    pub fn type_separators(mut self, separators: impl IntoIterator<Item = char>) -> Self {
        self.separators = separators.into_iter().collect();
        self
    }

    #[must_use]
    pub const fn root_rule(mut self, rule: RootRule) -> Self {
        self.root_rule = rule;
        self
    }

    /// Recover the head set and reseed the clock from the stored events.
    ///
    /// Heads without a content record are replaced by the heads they evicted
    /// and the repair is written back. If that write fails it is retried
    /// with the first put.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::OperationFailed`] or [`StoreError::Corrupt`] if
    /// the persisted state cannot be read, [`StoreError::Cancelled`] if
    /// `cancel` fires.
    pub async fn open(self, cancel: &Cancel) -> Result<EventStore, StoreError> {
        let recovered = HeadSet::recover(self.content.as_ref(), self.kv.as_ref(), cancel).await?;
        let heads = recovered.heads;

        // The latest event never has a stored descendant, so it is always a
        // head once the set is recovered.
        let latest = recovered.events.iter().map(Event::time).max();
        if let Some(time) = latest {
            self.clock.observe(time);
            info!(heads = heads.len(), latest = %time, "reseeded clock from stored heads");
        }

        let index = self.index.unwrap_or_else(|| {
            Arc::new(CompositeIndex::new(IndexKeyEncoder::new(
                self.separators.iter().copied(),
            )))
        });

        let mut repairs = Vec::new();
        if !recovered.repairs.is_empty() {
            let mut ops = index.restore_heads(&recovered.restored);
            ops.extend(HeadSet::to_restore_ops(&recovered.repairs));
            match self.kv.apply(ops.clone()).await {
                Ok(()) => info!(
                    restored = recovered.restored.len(),
                    "repaired heads left without content"
                ),
                Err(error) => {
                    warn!(error = %error, "could not write head repair, retrying with next put");
                    repairs = ops;
                }
            }
        }

        Ok(EventStore {
            content: self.content,
            kv: self.kv,
            hasher: self.hasher,
            validator: CausalValidator::new(self.root_rule),
            clock: self.clock,
            heads,
            index,
            separators: self.separators,
            writer: Mutex::new(()),
            repairs: std::sync::Mutex::new(repairs),
        })
    }
}

/// Append-only causal event log.
///
/// Writes are serialised by an internal lock; reads run concurrently with
/// them. Only one `EventStore` may write a given backing store at a time.
pub struct EventStore {
    content: Arc<dyn ContentStore>,
    kv: Arc<dyn SortedKv>,
    hasher: Arc<dyn ContentHasher>,
    validator: CausalValidator,
    clock: Arc<dyn Clock>,
    heads: HeadSet,
    index: Arc<dyn IndexPolicy>,
    separators: Vec<char>,
    writer: Mutex<()>,
    /// Undo ops that could not be committed, prepended to the next batch.
    repairs: std::sync::Mutex<Vec<KvOp>>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStore")
            .field("hasher", &self.hasher)
            .field("validator", &self.validator)
            .field("clock", &self.clock)
            .field("heads", &self.heads.len())
            .field("index", &self.index)
            .field("separators", &self.separators)
            .field("pending_repairs", &self.pending_repairs().len())
            .finish_non_exhaustive()
    }
}

impl EventStore {
    /// Key `event` would be stored under.
    #[must_use]
    pub fn key_of(&self, event: &NewEvent) -> Id {
        event.key_with(self.hasher.as_ref())
    }

    /// Whether queries are answered from the secondary index.
    #[must_use]
    pub fn is_indexed(&self) -> bool {
        self.index.encoder().is_some()
    }

    /// # Errors
    ///
    /// Fails on backend errors, undecodable records or cancellation.
    pub async fn get(&self, key: &Id, cancel: &Cancel) -> Result<Option<Event>, StoreError> {
        cancel.check()?;
        query::fetch(self.content.as_ref(), key).await
    }

    /// Events for `keys`, in the same order; absent keys yield `None`.
    ///
    /// # Errors
    ///
    /// Fails on backend errors, undecodable records or cancellation.
    pub async fn get_many(
        &self,
        keys: &[Id],
        cancel: &Cancel,
    ) -> Result<Vec<Option<Event>>, StoreError> {
        cancel.check()?;
        let records = self
            .content
            .get_many(keys)
            .await
            .map_err(|e| StoreError::failed(Stage::ContentRead, e))?;
        keys.iter()
            .zip(records)
            .map(|(key, record)| record.map(|bytes| Event::decode(key, &bytes)).transpose())
            .collect()
    }

    /// # Errors
    ///
    /// Fails on backend errors or cancellation.
    pub async fn has(&self, key: &Id, cancel: &Cancel) -> Result<bool, StoreError> {
        cancel.check()?;
        self.content
            .has(key)
            .await
            .map_err(|e| StoreError::failed(Stage::ContentRead, e))
    }

    /// # Errors
    ///
    /// Fails on backend errors or cancellation.
    pub async fn has_many(&self, keys: &[Id], cancel: &Cancel) -> Result<Vec<bool>, StoreError> {
        cancel.check()?;
        self.content
            .has_many(keys)
            .await
            .map_err(|e| StoreError::failed(Stage::ContentRead, e))
    }

    /// Validate and append `event`, returning its key.
    ///
    /// Putting an already stored event is a no-op that returns the existing
    /// key.
    ///
    /// # Errors
    ///
    /// - [`StoreError::InvalidArgument`] / [`StoreError::MissingDependency`]
    ///   if validation fails; nothing is written.
    /// - [`StoreError::OperationFailed`] if a backing-store write fails.
    /// - [`StoreError::Cancelled`] if `cancel` fires before the write begins.
    pub async fn put(&self, event: NewEvent, cancel: &Cancel) -> Result<Id, StoreError> {
        cancel.check()?;
        let key = self.key_of(&event);
        self.put_keyed(key, event, cancel).await
    }

    /// Put each event in order, continuing past individual failures.
    ///
    /// Once `cancel` fires, every remaining item reports
    /// [`StoreError::Cancelled`].
    pub async fn put_many(
        &self,
        events: impl IntoIterator<Item = NewEvent>,
        cancel: &Cancel,
    ) -> Vec<PutOutcome> {
        let mut outcomes = Vec::new();
        for event in events {
            let key = self.key_of(&event);
            let error = if cancel.is_cancelled() {
                Some(StoreError::Cancelled)
            } else {
                self.put_keyed(key.clone(), event, cancel).await.err()
            };
            outcomes.push(PutOutcome { key, error });
        }
        outcomes
    }

    async fn put_keyed(&self, key: Id, event: NewEvent, cancel: &Cancel) -> Result<Id, StoreError> {
        match self.insert(key, event, cancel).await {
            Err(StoreError::AlreadyExists(key)) => {
                debug!(key = %key, "event already stored");
                Ok(key)
            }
            other => other,
        }
    }

    async fn insert(&self, key: Id, new: NewEvent, cancel: &Cancel) -> Result<Id, StoreError> {
        let _writer = self.writer.lock().await;

        let exists = self
            .content
            .has(&key)
            .await
            .map_err(|e| StoreError::failed(Stage::ContentRead, e))?;
        if exists {
            return Err(StoreError::AlreadyExists(key));
        }

        let parents = self
            .validator
            .validate(&new, self.content.as_ref(), cancel)
            .await?;
        cancel.check()?;

        let time = self.clock.tick(parents.max_time());
        let event = new.into_event(key.clone(), time);
        let record = event.encode()?;
        let changes = self.heads.plan(&key, &parents.keys());

        let mut ops = self.pending_repairs();
        let repaired = ops.len();
        ops.extend(self.index.on_before_persist(&event, &parents));
        ops.extend(HeadSet::to_ops(&changes));
        let batch = ops.len();
        if let Err(cause) = self.kv.apply(ops).await {
            return Err(StoreError::OperationFailed {
                stage: Stage::IndexWrite,
                keys: self.batch_keys(&event, &parents, &changes),
                cause,
            });
        }
        if repaired > 0 {
            self.repairs
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
            info!(ops = repaired, "committed queued rollback");
        }

        if let Err(cause) = self.content.put(&key, record).await {
            let keys = self.batch_keys(&event, &parents, &changes);
            self.roll_back(&event, &parents, &changes).await;
            return Err(StoreError::OperationFailed {
                stage: Stage::ContentWrite,
                keys,
                cause,
            });
        }
        self.heads.apply(&changes);

        debug!(
            key = %key,
            event_type = %event.event_type,
            time = %time,
            parents = parents.events().len(),
            index_ops = batch,
            "stored event"
        );
        Ok(key)
    }

    /// Undo the committed batch of an event whose content write failed.
    ///
    /// If this also fails the undo is queued for the next batch. Until then
    /// queries skip the entries because the event has no content record, or
    /// a different time once a retry stores it.
    async fn roll_back(&self, event: &Event, parents: &ValidatedParents, changes: &[(Id, HeadChange)]) {
        let former_heads =
            parents.subset(|k| changes.contains(&(k.clone(), HeadChange::Remove)));
        let mut ops = self.index.on_abort(event, &former_heads);
        ops.extend(HeadSet::to_restore_ops(&HeadSet::invert(changes)));
        match self.kv.apply(ops.clone()).await {
            Ok(()) => debug!(key = %event.key, "rolled back index entries"),
            Err(error) => {
                warn!(
                    key = %event.key,
                    error = %error,
                    "could not roll back index entries of unstored event, queued for next put"
                );
                self.repairs
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend(ops);
            }
        }
    }

    fn pending_repairs(&self) -> Vec<KvOp> {
        self.repairs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rendered keys of the batch written for `event`.
    fn batch_keys(
        &self,
        event: &Event,
        parents: &ValidatedParents,
        changes: &[(Id, HeadChange)],
    ) -> Vec<String> {
        let mut ops = self.index.on_before_persist(event, parents);
        ops.extend(HeadSet::to_ops(changes));
        ops.iter().map(|op| render_key(op.key())).collect()
    }

    /// Keys matching `query`, parents before children.
    ///
    /// # Errors
    ///
    /// - [`StoreError::MissingDependency`] if a `since` key is not stored.
    /// - [`StoreError::OperationFailed`] / [`StoreError::Corrupt`] on read
    ///   failures, [`StoreError::Cancelled`] on cancellation.
    pub async fn keys(&self, query: &Query, cancel: &Cancel) -> Result<Page<Id>, StoreError> {
        Ok(self.values(query, cancel).await?.map(|e| e.key))
    }

    /// Keys and events matching `query`.
    ///
    /// # Errors
    ///
    /// As [`EventStore::keys`].
    pub async fn entries(
        &self,
        query: &Query,
        cancel: &Cancel,
    ) -> Result<Page<(Id, Event)>, StoreError> {
        Ok(self
            .values(query, cancel)
            .await?
            .map(|e| (e.key.clone(), e)))
    }

    /// Events matching `query`.
    ///
    /// # Errors
    ///
    /// As [`EventStore::keys`].
    pub async fn values(&self, query: &Query, cancel: &Cancel) -> Result<Page<Event>, StoreError> {
        cancel.check()?;
        let src = Sources {
            content: self.content.as_ref(),
            kv: self.kv.as_ref(),
            heads: &self.heads,
            separators: &self.separators,
        };
        match self.index.encoder() {
            Some(encoder) => query::indexed::run(src, encoder, query, cancel).await,
            None => query::walk::run(src, query, cancel).await,
        }
    }

    /// Current heads in key order.
    #[must_use]
    pub fn heads(&self) -> Vec<Id> {
        self.heads.snapshot()
    }
}
