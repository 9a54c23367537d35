//! The head set: events with no recorded descendant.
//!
//! Every accepted event joins the set and evicts each of its parents. The
//! changes for one put are planned up front and written in the same
//! [`SortedKv`] batch as the event's index entries, so readers never see the
//! new head without the parents' eviction (or the reverse) for longer than
//! one backing-store transaction. An in-memory mirror serves reads.
//!
//! Each persisted entry's value lists the heads it evicted, newline
//! separated. A head whose content record never landed (a crash or a failed
//! rollback after the batch committed) is replaced by those heads when the
//! set is recovered at open.

use std::collections::BTreeSet;
use std::sync::{PoisonError, RwLock};

use tracing::{debug, warn};

use crate::backend::{ContentStore, KvOp, RangeScan, SortedKv};
use crate::cancel::Cancel;
use crate::error::{Stage, StoreError};
use crate::event::Event;
use crate::id::Id;
use crate::query::fetch;

/// Key namespace of persisted head entries. Its first byte (`h`) differs from
/// every index axis tag.
pub const HEADS_NAMESPACE: &[u8] = b"heads\x00";

/// Direction of a head-set change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadChange {
    Add,
    Remove,
}

/// A persisted head and the heads its put evicted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadEntry {
    pub key: Id,
    pub evicted: Vec<Id>,
}

/// Head set rebuilt from the persisted entries, see [`HeadSet::recover`].
#[derive(Debug)]
pub struct Recovered {
    pub heads: HeadSet,
    /// Stored events of every recovered head.
    pub events: Vec<Event>,
    /// Earlier heads brought back in place of heads without content.
    pub restored: Vec<Event>,
    /// Changes turning the persisted set into `heads`; empty when every
    /// persisted head has content.
    pub repairs: Vec<(Id, HeadChange)>,
}

#[derive(Debug, Default)]
pub struct HeadSet {
    members: RwLock<BTreeSet<Id>>,
}

impl HeadSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the persisted head set as stored, without checking content.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::OperationFailed`] if the scan fails or
    /// [`StoreError::Corrupt`] for an undecodable entry.
    pub async fn load(kv: &dyn SortedKv, cancel: &Cancel) -> Result<Self, StoreError> {
        let members: BTreeSet<Id> = Self::load_entries(kv, cancel)
            .await?
            .into_iter()
            .map(|entry| entry.key)
            .collect();
        debug!(heads = members.len(), "loaded head set");
        Ok(Self {
            members: RwLock::new(members),
        })
    }

    /// Every persisted head entry in key order.
    ///
    /// # Errors
    ///
    /// As [`HeadSet::load`].
    pub async fn load_entries(
        kv: &dyn SortedKv,
        cancel: &Cancel,
    ) -> Result<Vec<HeadEntry>, StoreError> {
        let rows = kv
            .scan(&RangeScan::prefix(HEADS_NAMESPACE), cancel)
            .await
            .map_err(|e| StoreError::failed(Stage::IndexRead, e))?;

        rows.into_iter()
            .map(|(key, value)| {
                let corrupt = |reason: String| StoreError::Corrupt {
                    key: String::from_utf8_lossy(&key).into_owned(),
                    reason,
                };
                let id = Id::from_bytes(&key[HEADS_NAMESPACE.len()..])
                    .map_err(|e| corrupt(e.to_string()))?;
                let evicted = value
                    .split(|b| *b == b'\n')
                    .filter(|raw| !raw.is_empty())
                    .map(Id::from_bytes)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| corrupt(e.to_string()))?;
                Ok(HeadEntry { key: id, evicted })
            })
            .collect()
    }

    /// Load the persisted head set, replacing every head without a content
    /// record by the stored heads it evicted.
    ///
    /// Evicted heads were parents of the missing event and so were stored
    /// when it was validated. The caller persists [`Recovered::repairs`].
    ///
    /// # Errors
    ///
    /// As [`HeadSet::load`], plus content read failures and cancellation.
    pub async fn recover(
        content: &dyn ContentStore,
        kv: &dyn SortedKv,
        cancel: &Cancel,
    ) -> Result<Recovered, StoreError> {
        let entries = Self::load_entries(kv, cancel).await?;
        let listed: BTreeSet<Id> = entries.iter().map(|e| e.key.clone()).collect();

        let mut members = BTreeSet::new();
        let mut events = Vec::with_capacity(entries.len());
        let mut restored = Vec::new();
        let mut repairs = Vec::new();
        for entry in entries {
            cancel.check()?;
            if let Some(event) = fetch(content, &entry.key).await? {
                members.insert(entry.key);
                events.push(event);
                continue;
            }

            warn!(
                key = %entry.key,
                evicted = entry.evicted.len(),
                "head without content record, restoring the heads it replaced"
            );
            repairs.push((entry.key, HeadChange::Remove));
            for parent in entry.evicted {
                if listed.contains(&parent) || members.contains(&parent) {
                    continue;
                }
                match fetch(content, &parent).await? {
                    Some(event) => {
                        members.insert(parent.clone());
                        repairs.push((parent, HeadChange::Add));
                        restored.push(event.clone());
                        events.push(event);
                    }
                    None => warn!(key = %parent, "replaced head has no content record either"),
                }
            }
        }

        debug!(heads = members.len(), repairs = repairs.len(), "recovered head set");
        Ok(Recovered {
            heads: Self {
                members: RwLock::new(members),
            },
            events,
            restored,
            repairs,
        })
    }

    /// Changes caused by accepting `new_key` with `parents`: every parent
    /// that is currently a head leaves the set, then `new_key` joins it.
    #[must_use]
    pub fn plan(&self, new_key: &Id, parents: &[Id]) -> Vec<(Id, HeadChange)> {
        let members = self.members.read().unwrap_or_else(PoisonError::into_inner);
        let mut changes: Vec<(Id, HeadChange)> = parents
            .iter()
            .filter(|p| members.contains(*p))
            .map(|p| (p.clone(), HeadChange::Remove))
            .collect();
        changes.push((new_key.clone(), HeadChange::Add));
        changes
    }

    /// Changes undoing `changes`.
    #[must_use]
    pub fn invert(changes: &[(Id, HeadChange)]) -> Vec<(Id, HeadChange)> {
        changes
            .iter()
            .rev()
            .map(|(id, change)| {
                let undo = match change {
                    HeadChange::Add => HeadChange::Remove,
                    HeadChange::Remove => HeadChange::Add,
                };
                (id.clone(), undo)
            })
            .collect()
    }

    /// Persisted form of `changes`, to be merged into the put's batch. The
    /// added head's entry records the heads removed alongside it.
    #[must_use]
    pub fn to_ops(changes: &[(Id, HeadChange)]) -> Vec<KvOp> {
        let mut evicted = Vec::new();
        for (id, change) in changes {
            if *change == HeadChange::Remove {
                if !evicted.is_empty() {
                    evicted.push(b'\n');
                }
                evicted.extend_from_slice(id.as_bytes());
            }
        }
        Self::ops(changes, &evicted)
    }

    /// Persisted form of `changes` that bring earlier heads back, as in a
    /// rollback or a recovery. The entries record no evictions.
    #[must_use]
    pub fn to_restore_ops(changes: &[(Id, HeadChange)]) -> Vec<KvOp> {
        Self::ops(changes, &[])
    }

    fn ops(changes: &[(Id, HeadChange)], value: &[u8]) -> Vec<KvOp> {
        changes
            .iter()
            .map(|(id, change)| {
                let key = entry_key(id);
                match change {
                    HeadChange::Add => KvOp::Set {
                        key,
                        value: value.to_vec(),
                    },
                    HeadChange::Remove => KvOp::Delete { key },
                }
            })
            .collect()
    }

    /// Mirror committed `changes` in memory.
    pub fn apply(&self, changes: &[(Id, HeadChange)]) {
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        for (id, change) in changes {
            match change {
                HeadChange::Add => {
                    members.insert(id.clone());
                }
                HeadChange::Remove => {
                    members.remove(id);
                }
            }
        }
    }

    #[must_use]
    pub fn contains(&self, id: &Id) -> bool {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }

    /// Current heads in key order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Id> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn entry_key(id: &Id) -> Vec<u8> {
    let mut key = Vec::with_capacity(HEADS_NAMESPACE.len() + id.as_bytes().len());
    key.extend_from_slice(HEADS_NAMESPACE);
    key.extend_from_slice(id.as_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::event::{EventType, LogicalTime, NewEvent};
    use crate::id::{Blake3Hasher, ContentHasher};
    use serde_json::json;

    fn id(name: &str) -> Id {
        Blake3Hasher.hash(name.as_bytes())
    }

    fn accept(heads: &HeadSet, key: &str, parents: &[&str]) -> Vec<(Id, HeadChange)> {
        let parents: Vec<Id> = parents.iter().map(|p| id(p)).collect();
        let changes = heads.plan(&id(key), &parents);
        heads.apply(&changes);
        changes
    }

    #[test]
    fn plan_evicts_current_heads_then_adds_child() {
        let heads = HeadSet::new();
        accept(&heads, "a", &[]);
        accept(&heads, "b", &[]);

        let changes = heads.plan(&id("c"), &[id("a"), id("b")]);
        assert_eq!(
            changes,
            vec![
                (id("a"), HeadChange::Remove),
                (id("b"), HeadChange::Remove),
                (id("c"), HeadChange::Add),
            ]
        );
    }

    #[test]
    fn plan_skips_parents_that_are_no_longer_heads() {
        let heads = HeadSet::new();
        accept(&heads, "g", &[]);
        accept(&heads, "a", &["g"]);

        let changes = heads.plan(&id("b"), &[id("g")]);
        assert_eq!(changes, vec![(id("b"), HeadChange::Add)]);
    }

    #[test]
    fn invert_undoes_plan() {
        let heads = HeadSet::new();
        accept(&heads, "a", &[]);
        accept(&heads, "b", &[]);
        let changes = accept(&heads, "c", &["a", "b"]);
        assert_eq!(heads.snapshot(), vec![id("c")]);

        heads.apply(&HeadSet::invert(&changes));
        let mut expected = vec![id("a"), id("b")];
        expected.sort();
        assert_eq!(heads.snapshot(), expected);
    }

    #[test]
    fn chain_fork_merge() {
        let heads = HeadSet::new();
        accept(&heads, "g", &[]);
        accept(&heads, "a", &["g"]);
        accept(&heads, "b", &["a"]);
        assert_eq!(heads.snapshot(), vec![id("b")]);

        accept(&heads, "c", &["g"]);
        let mut expected = vec![id("b"), id("c")];
        expected.sort();
        assert_eq!(heads.snapshot(), expected);

        accept(&heads, "d", &["b", "c"]);
        assert_eq!(heads.snapshot(), vec![id("d")]);
        assert!(heads.contains(&id("d")));
        assert!(!heads.contains(&id("g")));
    }

    #[tokio::test]
    async fn persisted_changes_reload() {
        let kv = MemoryBackend::new();
        let cancel = Cancel::new();
        let heads = HeadSet::new();

        for (key, parents) in [("g", vec![]), ("a", vec!["g"]), ("b", vec!["g"])] {
            let changes = accept(&heads, key, &parents);
            kv.apply(HeadSet::to_ops(&changes)).await.unwrap();
        }

        let loaded = HeadSet::load(&kv, &cancel).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.contains(&id("b")));
        assert_eq!(loaded.snapshot(), heads.snapshot());
    }

    #[tokio::test]
    async fn entries_record_evicted_heads() {
        let kv = MemoryBackend::new();
        let cancel = Cancel::new();
        let heads = HeadSet::new();

        for (key, parents) in [("a", vec![]), ("b", vec![]), ("c", vec!["a", "b"])] {
            let changes = accept(&heads, key, &parents);
            kv.apply(HeadSet::to_ops(&changes)).await.unwrap();
        }

        let entries = HeadSet::load_entries(&kv, &cancel).await.unwrap();
        let mut evicted = vec![id("a"), id("b")];
        evicted.sort();
        assert_eq!(
            entries,
            vec![HeadEntry {
                key: id("c"),
                evicted
            }]
        );
    }

    #[tokio::test]
    async fn recover_replaces_head_without_content() {
        let backend = MemoryBackend::new();
        let cancel = Cancel::new();
        let heads = HeadSet::new();

        let g_new = NewEvent::genesis(EventType::new("doc.new").unwrap(), json!({}));
        let g_key = g_new.key_with(&Blake3Hasher);
        let g = g_new.into_event(g_key.clone(), LogicalTime::ZERO);
        ContentStore::put(&backend, &g_key, g.encode().unwrap()).await.unwrap();
        let changes = heads.plan(&g_key, &[]);
        backend.apply(HeadSet::to_ops(&changes)).await.unwrap();
        heads.apply(&changes);

        // A child whose batch committed but whose content never did.
        let lost = id("lost");
        backend
            .apply(HeadSet::to_ops(&heads.plan(&lost, &[g_key.clone()])))
            .await
            .unwrap();
        assert_eq!(HeadSet::load(&backend, &cancel).await.unwrap().snapshot(), vec![lost.clone()]);

        let recovered = HeadSet::recover(&backend, &backend, &cancel).await.unwrap();
        assert_eq!(recovered.heads.snapshot(), vec![g_key.clone()]);
        assert_eq!(recovered.restored, vec![g.clone()]);
        assert_eq!(recovered.events, vec![g]);
        assert_eq!(
            recovered.repairs,
            vec![(lost, HeadChange::Remove), (g_key.clone(), HeadChange::Add)]
        );

        backend
            .apply(HeadSet::to_restore_ops(&recovered.repairs))
            .await
            .unwrap();
        let again = HeadSet::recover(&backend, &backend, &cancel).await.unwrap();
        assert_eq!(again.heads.snapshot(), vec![g_key]);
        assert!(again.repairs.is_empty());
    }
}
