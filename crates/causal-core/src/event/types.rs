//! Event type names and logical timestamps.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Separators used to split a type name into hierarchical prefixes when no
/// other set is configured.
pub const DEFAULT_TYPE_SEPARATORS: [char; 4] = ['.', '_', '-', '/'];

/// Error returned for a malformed event type name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventTypeError {
    #[error("event type must not be empty")]
    Empty,
    #[error("event type {0:?} contains a control character")]
    ControlCharacter(String),
}

/// A scoped event type name such as `order.created`.
///
/// Any non-empty string without control characters is accepted. Control
/// characters are rejected because index keys use `0x00` as a field
/// separator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    /// Validate and wrap a type name.
    ///
    /// # Errors
    ///
    /// Returns [`EventTypeError`] for an empty name or one containing control
    /// characters.
    pub fn new(name: impl Into<String>) -> Result<Self, EventTypeError> {
        let name = name.into();
        if name.is_empty() {
            return Err(EventTypeError::Empty);
        }
        if name.chars().any(char::is_control) {
            return Err(EventTypeError::ControlCharacter(name));
        }
        Ok(Self(name))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Hierarchical prefixes of this name, shortest first, ending with the
    /// full name.
    ///
    /// `order.created.v2` split on `.` yields `order`, `order.created`,
    /// `order.created.v2`. Empty prefixes (a leading separator) are skipped.
    #[must_use]
    pub fn prefixes(&self, separators: &[char]) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .0
            .char_indices()
            .filter(|(idx, c)| *idx > 0 && separators.contains(c))
            .map(|(idx, _)| &self.0[..idx])
            .collect();
        out.push(&self.0);
        out.dedup();
        out
    }

    /// Whether this type equals `filter` or has it as a hierarchical prefix.
    #[must_use]
    pub fn matches(&self, filter: &Self, separators: &[char]) -> bool {
        self.prefixes(separators).contains(&filter.as_str())
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EventType {
    type Err = EventTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for EventType {
    type Error = EventTypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for EventType {
    type Error = EventTypeError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.0
    }
}

/// Store-assigned logical timestamp.
///
/// Strictly greater than every parent's time; unique per store instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LogicalTime(u64);

impl LogicalTime {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// The following tick, saturating at `u64::MAX`.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Fixed-width big-endian encoding; byte order equals numeric order.
    #[must_use]
    pub const fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    #[must_use]
    pub const fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for LogicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
