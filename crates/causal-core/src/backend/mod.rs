//! Backing-store contracts and the reference implementations.
//!
//! The event store talks to two collaborators:
//!
//! - [`ContentStore`]: the append-only primary log, keyed by content hash.
//! - [`SortedKv`]: a byte-ordered map with atomic batches and range scans,
//!   holding the secondary index and the head set.
//!
//! [`MemoryBackend`] and [`SqliteBackend`] each implement both traits, so a
//! single value can back a whole store.

pub mod memory;
pub mod sqlite;

use std::ops::Bound;

use async_trait::async_trait;

use crate::cancel::Cancel;
use crate::id::Id;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Errors raised by a backing store.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("backend lock poisoned")]
    Poisoned,

    #[error("scan cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

/// One mutation in a [`SortedKv::apply`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvOp {
    Set { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl KvOp {
    #[must_use]
    pub fn key(&self) -> &[u8] {
        match self {
            Self::Set { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// A range scan over a [`SortedKv`].
///
/// `Bound::Excluded` gives an open end, `Bound::Included` a closed one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeScan {
    pub lower: Bound<Vec<u8>>,
    pub upper: Bound<Vec<u8>>,
    pub reverse: bool,
    pub limit: Option<usize>,
}

impl RangeScan {
    /// Every key in `[lower, upper)`.
    #[must_use]
    pub const fn between(lower: Vec<u8>, upper: Vec<u8>) -> Self {
        Self {
            lower: Bound::Included(lower),
            upper: Bound::Excluded(upper),
            reverse: false,
            limit: None,
        }
    }

    /// Every key starting with `prefix`.
    #[must_use]
    pub fn prefix(prefix: &[u8]) -> Self {
        Self {
            lower: Bound::Included(prefix.to_vec()),
            upper: prefix_successor(prefix).map_or(Bound::Unbounded, Bound::Excluded),
            reverse: false,
            limit: None,
        }
    }

    #[must_use]
    pub const fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `key` falls inside the bounds.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        let above = match &self.lower {
            Bound::Included(lower) => key >= lower.as_slice(),
            Bound::Excluded(lower) => key > lower.as_slice(),
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(upper) => key <= upper.as_slice(),
            Bound::Excluded(upper) => key < upper.as_slice(),
            Bound::Unbounded => true,
        };
        above && below
    }
}

/// Smallest key greater than every key starting with `prefix`, or `None` if
/// the prefix is all `0xff`.
#[must_use]
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.pop() {
        if last < u8::MAX {
            out.push(last + 1);
            return Some(out);
        }
    }
    None
}

/// Append-only, content-addressed record map.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get(&self, key: &Id) -> Result<Option<Vec<u8>>, BackendError>;

    async fn has(&self, key: &Id) -> Result<bool, BackendError>;

    /// Store `record` under `key`. Writing an existing key is a no-op.
    async fn put(&self, key: &Id, record: Vec<u8>) -> Result<(), BackendError>;

    async fn delete(&self, key: &Id) -> Result<(), BackendError>;

    async fn get_many(&self, keys: &[Id]) -> Result<Vec<Option<Vec<u8>>>, BackendError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    async fn has_many(&self, keys: &[Id]) -> Result<Vec<bool>, BackendError> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.has(key).await?);
        }
        Ok(out)
    }
}

/// Byte-ordered key/value map with atomic batches and range scans.
#[async_trait]
pub trait SortedKv: Send + Sync {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BackendError>;

    /// Apply every op or none of them.
    async fn apply(&self, ops: Vec<KvOp>) -> Result<(), BackendError>;

    /// Entries inside `range`, in key order (descending when `reverse`).
    ///
    /// Implementations check `cancel` for every row and return
    /// [`BackendError::Cancelled`] once it fires.
    async fn scan(
        &self,
        range: &RangeScan,
        cancel: &Cancel,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BackendError>;
}
