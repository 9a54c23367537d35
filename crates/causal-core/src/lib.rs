//! causal-core: an append-only, content-addressed event log whose records
//! form a DAG of causal dependencies.
//!
//! Events are validated against their parents, stamped by a logical clock,
//! tracked in a head set and indexed by root, type and time so queries can
//! resume from a checkpoint without rescanning the log.
//!
//! ```no_run
//! # async fn demo() -> Result<(), causal_core::StoreError> {
//! use std::sync::Arc;
//! use causal_core::{Cancel, EventStoreBuilder, MemoryBackend, NewEvent, Query};
//! use causal_core::event::EventType;
//! use serde_json::json;
//!
//! let cancel = Cancel::new();
//! let store = EventStoreBuilder::with_backend(Arc::new(MemoryBackend::new()))
//!     .open(&cancel)
//!     .await?;
//!
//! let doc = store
//!     .put(NewEvent::genesis(EventType::new("doc.new").unwrap(), json!({})), &cancel)
//!     .await?;
//! let page = store.keys(&Query::new().root(doc), &cancel).await?;
//! # let _ = page;
//! # Ok(())
//! # }
//! ```
//!
//! # Conventions
//!
//! - **Errors**: [`StoreError`] for library operations, `anyhow::Result`
//!   at the config edge.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `debug!`).

pub mod backend;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod heads;
pub mod id;
pub mod index;
pub mod lock;
pub mod query;
pub mod store;
pub mod validate;

pub use backend::{ContentStore, MemoryBackend, SortedKv, SqliteBackend};
pub use cancel::Cancel;
pub use config::{BackendConfig, IndexMode, OpenedStore, StoreConfig, load_config, open_store};
pub use error::{ErrorCode, Stage, StoreError};
pub use event::{Event, EventType, LogicalTime, NewEvent};
pub use id::{Blake3Hasher, ContentHasher, Id};
pub use query::{Page, Query};
pub use store::{EventStore, EventStoreBuilder, PutOutcome};
pub use validate::RootRule;
