use std::fmt;

use crate::backend::BackendError;
use crate::id::Id;

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    MissingDependency,
    InvalidArgument,
    AlreadyExists,
    CorruptRecord,
    OperationFailed,
    LockContention,
    Cancelled,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1002",
            Self::MissingDependency => "E2001",
            Self::InvalidArgument => "E2002",
            Self::AlreadyExists => "E3001",
            Self::CorruptRecord => "E3002",
            Self::OperationFailed => "E5001",
            Self::LockContention => "E5002",
            Self::Cancelled => "E5003",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::MissingDependency => "Missing causal dependency",
            Self::InvalidArgument => "Invalid argument",
            Self::AlreadyExists => "Event already exists",
            Self::CorruptRecord => "Corrupt event record",
            Self::OperationFailed => "Storage operation failed",
            Self::LockContention => "Lock contention",
            Self::Cancelled => "Operation cancelled",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in the store config file and retry."),
            Self::MissingDependency => {
                Some("Fetch or replicate the listed parent events, then resubmit.")
            }
            Self::InvalidArgument => {
                Some("Check the event's type, parents and root before resubmitting.")
            }
            Self::AlreadyExists | Self::Cancelled => None,
            Self::CorruptRecord => Some("Restore the event record from a replica."),
            Self::OperationFailed => Some("Check disk space and write permissions."),
            Self::LockContention => Some("Retry after the other writer releases its lock."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Step of the read/write path where a backing-store call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ContentRead,
    IndexRead,
    IndexWrite,
    ContentWrite,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ContentRead => "content read",
            Self::IndexRead => "index read",
            Self::IndexWrite => "index write",
            Self::ContentWrite => "content write",
        };
        f.write_str(name)
    }
}

/// Errors surfaced by the event store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// One or more declared parents are not stored yet.
    ///
    /// The only retryable condition: fetch the listed events and resubmit.
    #[error("missing dependencies: {}", join_ids(.0))]
    MissingDependency(Vec<Id>),

    /// The event or query is structurally malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The event is already stored. Never returned from `put`; the store
    /// converts it into a successful result carrying the existing key.
    #[error("event {0} already exists")]
    AlreadyExists(Id),

    /// A backing-store call failed.
    ///
    /// `keys` lists the index keys of the batch that was being written, so
    /// callers can tell which axis entries may be missing.
    #[error("{stage} failed ({} index keys in batch): {cause}", .keys.len())]
    OperationFailed {
        stage: Stage,
        keys: Vec<String>,
        #[source]
        cause: BackendError,
    },

    /// A stored record could not be decoded.
    #[error("record {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },

    /// The caller's cancellation signal fired.
    #[error("operation cancelled")]
    Cancelled,
}

impl StoreError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub(crate) fn failed(stage: Stage, cause: BackendError) -> Self {
        if matches!(cause, BackendError::Cancelled) {
            return Self::Cancelled;
        }
        Self::OperationFailed {
            stage,
            keys: Vec::new(),
            cause,
        }
    }

    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MissingDependency(_) => ErrorCode::MissingDependency,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::OperationFailed { .. } => ErrorCode::OperationFailed,
            Self::Corrupt { .. } => ErrorCode::CorruptRecord,
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }

    /// Whether resubmitting the same event can succeed once the caller has
    /// resolved the condition.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::MissingDependency(_))
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

fn join_ids(ids: &[Id]) -> String {
    ids.iter().map(Id::as_str).collect::<Vec<_>>().join(", ")
}
