//! Composite index keys.
//!
//! ```text
//! [H] tag [SEP root] [SEP type-prefix] SEP time(8, big-endian) SEP key
//! ```
//!
//! `SEP` is `0x00`, which cannot occur in an [`Id`] or an [`EventType`], so
//! every axis prefix is unambiguous and a forward scan of one prefix yields
//! entries in ascending logical time. The leading `H` marks head entries.

use std::fmt::Write as _;
use std::ops::Bound;

use crate::backend::{RangeScan, prefix_successor};
use crate::event::{DEFAULT_TYPE_SEPARATORS, Event, EventType, LogicalTime};
use crate::id::Id;

/// Separator between key segments.
pub const SEP: u8 = 0x00;

/// Flag prepended to head-only entries.
pub const HEAD_FLAG: u8 = b'H';

/// One of the four query axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis<'a> {
    Time,
    Root(&'a Id),
    Type(&'a str),
    RootType(&'a Id, &'a str),
}

impl<'a> Axis<'a> {
    /// Axis serving a query filtered by `root` and/or `event_type`.
    #[must_use]
    pub fn select(root: Option<&'a Id>, event_type: Option<&'a EventType>) -> Self {
        match (root, event_type) {
            (None, None) => Self::Time,
            (Some(root), None) => Self::Root(root),
            (None, Some(ty)) => Self::Type(ty.as_str()),
            (Some(root), Some(ty)) => Self::RootType(root, ty.as_str()),
        }
    }

    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Time => b'T',
            Self::Root(_) => b'R',
            Self::Type(_) => b'Y',
            Self::RootType(..) => b'B',
        }
    }
}

/// Builds index keys, splitting type names on the configured separators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexKeyEncoder {
    separators: Vec<char>,
}

impl Default for IndexKeyEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_TYPE_SEPARATORS)
    }
}

impl IndexKeyEncoder {
    #[must_use]
    pub fn new(separators: impl IntoIterator<Item = char>) -> Self {
        Self {
            separators: separators.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn separators(&self) -> &[char] {
        &self.separators
    }

    /// Everything before the time segment, including its leading `SEP`.
    #[must_use]
    pub fn prefix(&self, axis: Axis<'_>, head: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(96);
        if head {
            out.push(HEAD_FLAG);
        }
        out.push(axis.tag());
        match axis {
            Axis::Time => {}
            Axis::Root(root) => push_segment(&mut out, root.as_bytes()),
            Axis::Type(ty) => push_segment(&mut out, ty.as_bytes()),
            Axis::RootType(root, ty) => {
                push_segment(&mut out, root.as_bytes());
                push_segment(&mut out, ty.as_bytes());
            }
        }
        out.push(SEP);
        out
    }

    #[must_use]
    pub fn encode(&self, axis: Axis<'_>, head: bool, time: LogicalTime, key: &Id) -> Vec<u8> {
        let mut out = self.prefix(axis, head);
        out.extend_from_slice(&time.to_be_bytes());
        out.push(SEP);
        out.extend_from_slice(key.as_bytes());
        out
    }

    /// Keys of every axis entry for `event`, permanent or head-only.
    ///
    /// Type axes get one entry per hierarchical prefix of the event type.
    #[must_use]
    pub fn keys_for(&self, event: &Event, head: bool) -> Vec<Vec<u8>> {
        let root = event.effective_root();
        let time = event.time();
        let prefixes = event.event_type.prefixes(&self.separators);

        let mut keys = Vec::with_capacity(2 + 2 * prefixes.len());
        keys.push(self.encode(Axis::Time, head, time, &event.key));
        keys.push(self.encode(Axis::Root(root), head, time, &event.key));
        for prefix in &prefixes {
            keys.push(self.encode(Axis::Type(prefix), head, time, &event.key));
            keys.push(self.encode(Axis::RootType(root, prefix), head, time, &event.key));
        }
        keys
    }

    /// Permanent and head entries for a freshly accepted event.
    #[must_use]
    pub fn entries_for(&self, event: &Event) -> Vec<Vec<u8>> {
        let mut keys = self.keys_for(event, false);
        keys.extend(self.keys_for(event, true));
        keys
    }

    /// Head entries retired once `event` gains a descendant.
    #[must_use]
    pub fn head_entries_for(&self, event: &Event) -> Vec<Vec<u8>> {
        self.keys_for(event, true)
    }

    /// Forward scan over `axis` for entries with time `>= from`.
    #[must_use]
    pub fn time_range(&self, axis: Axis<'_>, head: bool, from: LogicalTime) -> RangeScan {
        let prefix = self.prefix(axis, head);
        let upper = prefix_successor(&prefix).map_or(Bound::Unbounded, Bound::Excluded);
        let mut lower = prefix;
        lower.extend_from_slice(&from.to_be_bytes());
        RangeScan {
            lower: Bound::Included(lower),
            upper,
            reverse: false,
            limit: None,
        }
    }
}

/// Time segment of an entry whose axis prefix is `prefix_len` bytes long.
#[must_use]
pub fn entry_time(entry: &[u8], prefix_len: usize) -> Option<LogicalTime> {
    let bytes: [u8; 8] = entry.get(prefix_len..prefix_len + 8)?.try_into().ok()?;
    Some(LogicalTime::from_be_bytes(bytes))
}

fn push_segment(out: &mut Vec<u8>, segment: &[u8]) {
    out.push(SEP);
    out.extend_from_slice(segment);
}

/// Printable form of a binary index key for error reports and logs.
#[must_use]
pub fn render_key(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len() + 16);
    for &byte in key {
        if byte.is_ascii_graphic() {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "\\x{byte:02x}");
        }
    }
    out
}
