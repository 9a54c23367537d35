//! Secondary index policies.
//!
//! An [`IndexPolicy`] turns an accepted event into the [`KvOp`]s written
//! alongside it. The store picks its query strategy from the policy: a
//! policy with an encoder is answered by range scans, one without by a graph
//! walk.

pub mod key;

use std::fmt;

pub use key::{Axis, HEAD_FLAG, IndexKeyEncoder, SEP, entry_time, render_key};

use crate::backend::KvOp;
use crate::event::Event;
use crate::validate::ValidatedParents;

pub trait IndexPolicy: Send + Sync + fmt::Debug {
    /// Index writes for `event`, applied before its content record is stored.
    fn on_before_persist(&self, event: &Event, parents: &ValidatedParents) -> Vec<KvOp>;

    /// Writes undoing [`IndexPolicy::on_before_persist`] when the event's
    /// content record could not be stored.
    fn on_abort(&self, event: &Event, parents: &ValidatedParents) -> Vec<KvOp>;

    /// Writes giving `heads` their head-only entries back.
    fn restore_heads(&self, heads: &[Event]) -> Vec<KvOp>;

    /// Key encoder for range-scan queries, or `None` if nothing is indexed.
    fn encoder(&self) -> Option<&IndexKeyEncoder>;
}

/// Four-axis composite index with head-only duplicates.
///
/// Each entry maps an index key to the event key. A parent's head entries are
/// deleted when a child is accepted; permanent entries are never removed.
#[derive(Debug, Clone, Default)]
pub struct CompositeIndex {
    encoder: IndexKeyEncoder,
}

impl CompositeIndex {
    #[must_use]
    pub const fn new(encoder: IndexKeyEncoder) -> Self {
        Self { encoder }
    }
}

impl IndexPolicy for CompositeIndex {
    fn on_before_persist(&self, event: &Event, parents: &ValidatedParents) -> Vec<KvOp> {
        let value = event.key.as_bytes().to_vec();
        let mut ops: Vec<KvOp> = self
            .encoder
            .entries_for(event)
            .into_iter()
            .map(|key| KvOp::Set {
                key,
                value: value.clone(),
            })
            .collect();
        for parent in parents.events() {
            ops.extend(
                self.encoder
                    .head_entries_for(parent)
                    .into_iter()
                    .map(|key| KvOp::Delete { key }),
            );
        }
        ops
    }

    fn on_abort(&self, event: &Event, parents: &ValidatedParents) -> Vec<KvOp> {
        let mut ops: Vec<KvOp> = self
            .encoder
            .entries_for(event)
            .into_iter()
            .map(|key| KvOp::Delete { key })
            .collect();
        ops.extend(self.restore_heads(parents.events()));
        ops
    }

    fn restore_heads(&self, heads: &[Event]) -> Vec<KvOp> {
        heads
            .iter()
            .flat_map(|head| {
                let value = head.key.as_bytes().to_vec();
                self.encoder
                    .head_entries_for(head)
                    .into_iter()
                    .map(move |key| KvOp::Set {
                        key,
                        value: value.clone(),
                    })
            })
            .collect()
    }

    fn encoder(&self) -> Option<&IndexKeyEncoder> {
        Some(&self.encoder)
    }
}

/// Writes nothing; queries fall back to walking the DAG from the heads.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIndex;

impl IndexPolicy for NoIndex {
    fn on_before_persist(&self, _event: &Event, _parents: &ValidatedParents) -> Vec<KvOp> {
        Vec::new()
    }

    fn on_abort(&self, _event: &Event, _parents: &ValidatedParents) -> Vec<KvOp> {
        Vec::new()
    }

    fn restore_heads(&self, _heads: &[Event]) -> Vec<KvOp> {
        Vec::new()
    }

    fn encoder(&self) -> Option<&IndexKeyEncoder> {
        None
    }
}
