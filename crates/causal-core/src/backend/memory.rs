//! In-process backend for tests, simulation and ephemeral stores.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use super::{BackendError, ContentStore, KvOp, RangeScan, SortedKv};
use crate::cancel::Cancel;
use crate::id::Id;

/// Records in a `HashMap`, index entries in a `BTreeMap`.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<Id, Vec<u8>>>,
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored content records.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Poisoned`] if a writer panicked.
    pub fn record_count(&self) -> Result<usize, BackendError> {
        Ok(self.records()?.len())
    }

    /// Number of sorted-map entries (index plus head set).
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Poisoned`] if a writer panicked.
    pub fn entry_count(&self) -> Result<usize, BackendError> {
        Ok(self.entries()?.len())
    }

    /// Copy of every sorted-map key, in order.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Poisoned`] if a writer panicked.
    pub fn entry_keys(&self) -> Result<Vec<Vec<u8>>, BackendError> {
        Ok(self.entries()?.keys().cloned().collect())
    }

    fn records(&self) -> Result<RwLockReadGuard<'_, HashMap<Id, Vec<u8>>>, BackendError> {
        self.records.read().map_err(|_| BackendError::Poisoned)
    }

    fn records_mut(&self) -> Result<RwLockWriteGuard<'_, HashMap<Id, Vec<u8>>>, BackendError> {
        self.records.write().map_err(|_| BackendError::Poisoned)
    }

    fn entries(&self) -> Result<RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>, BackendError> {
        self.entries.read().map_err(|_| BackendError::Poisoned)
    }

    fn entries_mut(
        &self,
    ) -> Result<RwLockWriteGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>>, BackendError> {
        self.entries.write().map_err(|_| BackendError::Poisoned)
    }
}

#[async_trait]
impl ContentStore for MemoryBackend {
    async fn get(&self, key: &Id) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.records()?.get(key).cloned())
    }

    async fn has(&self, key: &Id) -> Result<bool, BackendError> {
        Ok(self.records()?.contains_key(key))
    }

    async fn put(&self, key: &Id, record: Vec<u8>) -> Result<(), BackendError> {
        self.records_mut()?.entry(key.clone()).or_insert(record);
        Ok(())
    }

    async fn delete(&self, key: &Id) -> Result<(), BackendError> {
        self.records_mut()?.remove(key);
        Ok(())
    }

    async fn get_many(&self, keys: &[Id]) -> Result<Vec<Option<Vec<u8>>>, BackendError> {
        let records = self.records()?;
        Ok(keys.iter().map(|key| records.get(key).cloned()).collect())
    }

    async fn has_many(&self, keys: &[Id]) -> Result<Vec<bool>, BackendError> {
        let records = self.records()?;
        Ok(keys.iter().map(|key| records.contains_key(key)).collect())
    }
}

#[async_trait]
impl SortedKv for MemoryBackend {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.entries()?.get(key).cloned())
    }

    async fn apply(&self, ops: Vec<KvOp>) -> Result<(), BackendError> {
        let mut entries = self.entries_mut()?;
        for op in ops {
            match op {
                KvOp::Set { key, value } => {
                    entries.insert(key, value);
                }
                KvOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn scan(
        &self,
        range: &RangeScan,
        cancel: &Cancel,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BackendError> {
        if is_empty_range(range) {
            return Ok(Vec::new());
        }
        let entries = self.entries()?;
        let bounds = (range.lower.clone(), range.upper.clone());
        let limit = range.limit.unwrap_or(usize::MAX);

        let rows: Box<dyn Iterator<Item = (&Vec<u8>, &Vec<u8>)>> = if range.reverse {
            Box::new(entries.range::<Vec<u8>, _>(bounds).rev())
        } else {
            Box::new(entries.range::<Vec<u8>, _>(bounds))
        };

        let mut out = Vec::new();
        for (key, value) in rows.take(limit) {
            if cancel.is_cancelled() {
                return Err(BackendError::Cancelled);
            }
            out.push((key.clone(), value.clone()));
        }
        Ok(out)
    }
}

/// `BTreeMap::range` panics on inverted bounds; treat them as empty.
fn is_empty_range(range: &RangeScan) -> bool {
    use std::ops::Bound::{Excluded, Included};

    match (&range.lower, &range.upper) {
        (Included(lower), Included(upper)) => lower > upper,
        (Included(lower) | Excluded(lower), Excluded(upper))
        | (Excluded(lower), Included(upper)) => lower >= upper,
        _ => false,
    }
}
