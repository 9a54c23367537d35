//! SQLite schema for the persistent backend.
//!
//! - `event_records` is the content-addressed primary log (key → record)
//! - `index_entries` is the byte-ordered map holding composite index keys and
//!   the head set; `WITHOUT ROWID` keeps it clustered on `k`, and SQLite
//!   compares BLOBs with `memcmp`, so range scans follow byte order
//! - `store_meta` records the schema version for diagnostics

/// Migration v1: record log, sorted entry map and metadata.
pub const MIGRATION_V1_SQL: &str = r"
CREATE TABLE IF NOT EXISTS event_records (
    key TEXT PRIMARY KEY,
    record BLOB NOT NULL,
    CHECK (key LIKE '%:%')
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS index_entries (
    k BLOB PRIMARY KEY,
    v BLOB NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS store_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    schema_version INTEGER NOT NULL
);

INSERT OR IGNORE INTO store_meta (id, schema_version) VALUES (1, 1);
";

/// Tables every migrated database must contain.
pub const REQUIRED_TABLES: &[&str] = &["event_records", "index_entries", "store_meta"];
