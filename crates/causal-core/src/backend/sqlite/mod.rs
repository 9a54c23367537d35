//! SQLite-backed content store and sorted map.
//!
//! Runtime defaults follow the usual embedded-writer setup:
//! - `journal_mode = WAL` to allow concurrent readers while a writer appends
//! - `busy_timeout` (default 5s) to ride out transient lock contention
//! - every [`SortedKv::apply`] batch runs in one transaction
//!
//! rusqlite is blocking, so every call runs on tokio's blocking pool with the
//! connection behind a mutex.

pub mod migrations;
pub mod schema;

use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};

use super::{BackendError, ContentStore, KvOp, RangeScan, SortedKv};
use crate::cancel::Cancel;
use crate::id::Id;

/// Busy timeout used when none is configured.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One SQLite connection serving both backend traits.
#[derive(Debug)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteBackend {
    /// Open (or create) the database at `path`, apply runtime pragmas and
    /// migrate the schema to the latest version.
    ///
    /// Blocks; call it from `spawn_blocking` inside a runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or
    /// opening/configuring/migrating the database fails.
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, BackendError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                BackendError::Other(format!(
                    "create store directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let mut conn = Connection::open(path)?;
        configure_connection(&conn, busy_timeout)?;
        migrations::migrate(&mut conn)?;
        tracing::info!(path = %path.display(), "opened sqlite event store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// A private in-memory database, mainly for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if migrating the schema fails.
    pub fn open_in_memory() -> Result<Self, BackendError> {
        let mut conn = Connection::open_in_memory()?;
        migrations::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Database file path, `None` for in-memory databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, BackendError>
    where
        F: FnOnce(&mut Connection) -> Result<T, BackendError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| BackendError::Poisoned)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| BackendError::Other(format!("sqlite task failed: {e}")))?
    }
}

fn configure_connection(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.busy_timeout(busy_timeout)?;
    Ok(())
}

#[async_trait]
impl ContentStore for SqliteBackend {
    async fn get(&self, key: &Id) -> Result<Option<Vec<u8>>, BackendError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let record = conn
                .query_row(
                    "SELECT record FROM event_records WHERE key = ?1",
                    params![key.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    async fn has(&self, key: &Id) -> Result<bool, BackendError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let exists = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM event_records WHERE key = ?1)",
                params![key.as_str()],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
        .await
    }

    async fn put(&self, key: &Id, record: Vec<u8>) -> Result<(), BackendError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO event_records (key, record) VALUES (?1, ?2)",
                params![key.as_str(), record],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &Id) -> Result<(), BackendError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM event_records WHERE key = ?1",
                params![key.as_str()],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_many(&self, keys: &[Id]) -> Result<Vec<Option<Vec<u8>>>, BackendError> {
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            let mut stmt =
                conn.prepare_cached("SELECT record FROM event_records WHERE key = ?1")?;
            let mut out = Vec::with_capacity(keys.len());
            for key in &keys {
                out.push(
                    stmt.query_row(params![key.as_str()], |row| row.get(0))
                        .optional()?,
                );
            }
            Ok(out)
        })
        .await
    }

    async fn has_many(&self, keys: &[Id]) -> Result<Vec<bool>, BackendError> {
        let keys = keys.to_vec();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare_cached("SELECT EXISTS(SELECT 1 FROM event_records WHERE key = ?1)")?;
            let mut out = Vec::with_capacity(keys.len());
            for key in &keys {
                out.push(stmt.query_row(params![key.as_str()], |row| row.get(0))?);
            }
            Ok(out)
        })
        .await
    }
}

#[async_trait]
impl SortedKv for SqliteBackend {
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BackendError> {
        let key = key.to_vec();
        self.with_conn(move |conn| {
            let value = conn
                .query_row(
                    "SELECT v FROM index_entries WHERE k = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value)
        })
        .await
    }

    async fn apply(&self, ops: Vec<KvOp>) -> Result<(), BackendError> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            {
                let mut set = tx.prepare_cached(
                    "INSERT OR REPLACE INTO index_entries (k, v) VALUES (?1, ?2)",
                )?;
                let mut delete = tx.prepare_cached("DELETE FROM index_entries WHERE k = ?1")?;
                for op in &ops {
                    match op {
                        KvOp::Set { key, value } => {
                            set.execute(params![key, value])?;
                        }
                        KvOp::Delete { key } => {
                            delete.execute(params![key])?;
                        }
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn scan(
        &self,
        range: &RangeScan,
        cancel: &Cancel,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, BackendError> {
        let (sql, args) = scan_sql(range);
        let cancel = cancel.clone();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let mut rows = stmt.query(params_from_iter(args))?;

            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                if cancel.is_cancelled() {
                    return Err(BackendError::Cancelled);
                }
                out.push((row.get(0)?, row.get(1)?));
            }
            Ok(out)
        })
        .await
    }
}

/// Build the `SELECT` for a range scan plus its positional arguments.
fn scan_sql(range: &RangeScan) -> (String, Vec<Value>) {
    let mut clauses = Vec::new();
    let mut args = Vec::new();

    match &range.lower {
        Bound::Included(lower) => {
            args.push(Value::Blob(lower.clone()));
            clauses.push(format!("k >= ?{}", args.len()));
        }
        Bound::Excluded(lower) => {
            args.push(Value::Blob(lower.clone()));
            clauses.push(format!("k > ?{}", args.len()));
        }
        Bound::Unbounded => {}
    }
    match &range.upper {
        Bound::Included(upper) => {
            args.push(Value::Blob(upper.clone()));
            clauses.push(format!("k <= ?{}", args.len()));
        }
        Bound::Excluded(upper) => {
            args.push(Value::Blob(upper.clone()));
            clauses.push(format!("k < ?{}", args.len()));
        }
        Bound::Unbounded => {}
    }

    let mut sql = String::from("SELECT k, v FROM index_entries");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(if range.reverse {
        " ORDER BY k DESC"
    } else {
        " ORDER BY k ASC"
    });
    if let Some(limit) = range.limit {
        args.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        sql.push_str(&format!(" LIMIT ?{}", args.len()));
    }

    (sql, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{Blake3Hasher, ContentHasher};
    use tempfile::TempDir;

    fn temp_db_path() -> (TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("events.sqlite3");
        (dir, path)
    }

    fn set(key: &[u8]) -> KvOp {
        KvOp::Set {
            key: key.to_vec(),
            value: b"v".to_vec(),
        }
    }

    #[test]
    fn open_sets_wal_and_busy_timeout() {
        let (_dir, path) = temp_db_path();
        let backend = SqliteBackend::open(&path, DEFAULT_BUSY_TIMEOUT).expect("open db");
        let conn = backend.conn.lock().expect("lock");

        let journal_mode: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .expect("query journal_mode");
        assert_eq!(journal_mode.to_ascii_lowercase(), "wal");

        let busy_timeout_ms: u64 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .expect("query busy_timeout");
        assert_eq!(
            u128::from(busy_timeout_ms),
            DEFAULT_BUSY_TIMEOUT.as_millis()
        );
    }

    #[tokio::test]
    async fn records_survive_reopen() {
        let (_dir, path) = temp_db_path();
        let key = Blake3Hasher.hash(b"record");
        {
            let backend = SqliteBackend::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap();
            ContentStore::put(&backend, &key, b"payload".to_vec()).await.unwrap();
            backend.apply(vec![set(b"T\0k")]).await.unwrap();
        }
        let backend = SqliteBackend::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap();
        assert!(backend.has(&key).await.unwrap());
        assert_eq!(
            ContentStore::get(&backend, &key).await.unwrap(),
            Some(b"payload".to_vec())
        );
        assert_eq!(
            SortedKv::get(&backend, b"T\0k").await.unwrap(),
            Some(b"v".to_vec())
        );
    }

    #[tokio::test]
    async fn many_variants_preserve_order() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let a = Blake3Hasher.hash(b"a");
        let b = Blake3Hasher.hash(b"b");
        ContentStore::put(&backend, &b, b"bee".to_vec()).await.unwrap();

        let got = backend.get_many(&[a.clone(), b.clone()]).await.unwrap();
        assert_eq!(got, vec![None, Some(b"bee".to_vec())]);
        assert_eq!(backend.has_many(&[b, a]).await.unwrap(), vec![true, false]);
    }

    #[tokio::test]
    async fn scan_matches_memory_semantics() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .apply(vec![
                set(&[b'T', 0, 1]),
                set(&[b'T', 0, 2]),
                set(&[b'T', 0, 0xff]),
                set(&[b'U', 0]),
            ])
            .await
            .unwrap();
        backend
            .apply(vec![KvOp::Delete {
                key: vec![b'T', 0, 2],
            }])
            .await
            .unwrap();
        let cancel = Cancel::new();

        let rows = backend
            .scan(&RangeScan::prefix(&[b'T', 0]), &cancel)
            .await
            .unwrap();
        let keys: Vec<Vec<u8>> = rows.into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![vec![b'T', 0, 1], vec![b'T', 0, 0xff]]);

        let rows = backend
            .scan(&RangeScan::prefix(&[b'T', 0]).reversed().limit(1), &cancel)
            .await
            .unwrap();
        assert_eq!(rows[0].0, vec![b'T', 0, 0xff]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_tasks_share_one_connection() {
        let (_dir, path) = temp_db_path();
        let backend = Arc::new(SqliteBackend::open(&path, DEFAULT_BUSY_TIMEOUT).unwrap());

        let tasks: Vec<_> = (0..16u8)
            .map(|n| {
                let backend = Arc::clone(&backend);
                tokio::spawn(async move {
                    let key = Blake3Hasher.hash(&[n]);
                    ContentStore::put(backend.as_ref(), &key, vec![n]).await?;
                    backend.apply(vec![set(&[b'T', 0, n])]).await?;
                    backend.get_many(&[key]).await
                })
            })
            .collect();
        for (n, task) in (0..16u8).zip(tasks) {
            assert_eq!(task.await.unwrap().unwrap(), vec![Some(vec![n])]);
        }

        let rows = backend
            .scan(&RangeScan::prefix(&[b'T', 0]), &Cancel::new())
            .await
            .unwrap();
        assert_eq!(rows.len(), 16);
    }

    #[test]
    fn scan_sql_numbers_placeholders_in_order() {
        let range = RangeScan {
            lower: Bound::Excluded(vec![1]),
            upper: Bound::Included(vec![9]),
            reverse: true,
            limit: Some(3),
        };
        let (sql, args) = scan_sql(&range);
        assert_eq!(
            sql,
            "SELECT k, v FROM index_entries WHERE k > ?1 AND k <= ?2 ORDER BY k DESC LIMIT ?3"
        );
        assert_eq!(args.len(), 3);
    }
}
