use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{MemoryBackend, SqliteBackend};
use crate::cancel::Cancel;
use crate::error::ErrorCode;
use crate::event::DEFAULT_TYPE_SEPARATORS;
use crate::lock::WriterLock;
use crate::store::{EventStore, EventStoreBuilder};
use crate::validate::RootRule;

/// Which query strategy the store is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexMode {
    /// Four-axis composite index; queries are range scans.
    #[default]
    Composite,
    /// No secondary index; queries walk the DAG from the heads.
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BackendConfig {
    #[default]
    Memory,
    Sqlite { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub index: IndexMode,
    #[serde(default)]
    pub root_rule: RootRule,
    #[serde(default = "default_type_separators")]
    pub type_separators: Vec<char>,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            index: IndexMode::default(),
            root_rule: RootRule::default(),
            type_separators: default_type_separators(),
            backend: BackendConfig::default(),
            busy_timeout_ms: default_busy_timeout_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl StoreConfig {
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

fn default_type_separators() -> Vec<char> {
    DEFAULT_TYPE_SEPARATORS.to_vec()
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_lock_timeout_ms() -> u64 {
    1_000
}

/// Read a TOML store config; a missing file yields the defaults.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or is not a valid
/// store config (`E1002`).
pub fn load_config(path: &Path) -> Result<StoreConfig> {
    if !path.exists() {
        return Ok(StoreConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<StoreConfig>(&content).with_context(|| {
        format!(
            "{}: failed to parse {}",
            ErrorCode::ConfigParseError.code(),
            path.display()
        )
    })
}

/// A store opened from config, with the writer lock that guards it.
#[derive(Debug)]
pub struct OpenedStore {
    pub store: EventStore,
    /// Held for SQLite stores; dropping it lets another process write.
    pub lock: Option<WriterLock>,
}

/// Build a ready store from `config`.
///
/// SQLite stores take an exclusive [`WriterLock`] on `<db>.lock` before the
/// database is opened.
///
/// # Errors
///
/// Returns an error if the writer lock is held past the lock timeout, the
/// SQLite database cannot be opened or migrated, or recovering the stored
/// head set fails.
pub async fn open_store(config: &StoreConfig) -> Result<OpenedStore> {
    let (builder, lock) = match &config.backend {
        BackendConfig::Memory => (
            EventStoreBuilder::with_backend(Arc::new(MemoryBackend::new())),
            None,
        ),
        BackendConfig::Sqlite { path } => {
            let lock_path = path.with_extension("lock");
            let timeout = config.lock_timeout();
            let lock = tokio::task::spawn_blocking(move || WriterLock::acquire(&lock_path, timeout))
                .await
                .with_context(|| format!("{}: lock task failed", ErrorCode::InternalUnexpected.code()))??;

            let db_path = path.clone();
            let busy = config.busy_timeout();
            let backend = tokio::task::spawn_blocking(move || SqliteBackend::open(&db_path, busy))
                .await
                .with_context(|| format!("{}: open task failed", ErrorCode::InternalUnexpected.code()))?
                .with_context(|| format!("Failed to open store at {}", path.display()))?;
            (EventStoreBuilder::with_backend(Arc::new(backend)), Some(lock))
        }
    };

    let builder = builder
        .type_separators(config.type_separators.iter().copied())
        .root_rule(config.root_rule);
    let builder = match config.index {
        IndexMode::Composite => builder,
        IndexMode::None => builder.unindexed(),
    };

    let store = builder
        .open(&Cancel::new())
        .await
        .context("Failed to load store state")?;
    tracing::info!(
        backend = ?config.backend,
        indexed = store.is_indexed(),
        "opened event store"
    );
    Ok(OpenedStore { store, lock })
}
