//! SQLite schema migrations for the persistent backend.

use super::schema;
use rusqlite::{Connection, types::Type};

/// Latest schema version understood by this binary.
pub const LATEST_SCHEMA_VERSION: u32 = 1;

const MIGRATIONS: &[(u32, &str)] = &[(1, schema::MIGRATION_V1_SQL)];

/// Read `PRAGMA user_version` and convert it to a Rust `u32`.
///
/// # Errors
///
/// Returns an error if querying SQLite fails or the version value cannot be
/// represented as `u32`.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

/// Apply all pending migrations in ascending order, each in its own
/// transaction.
///
/// # Errors
///
/// Returns an error if any migration fails.
pub fn migrate(conn: &mut Connection) -> rusqlite::Result<u32> {
    let mut current = current_schema_version(conn)?;

    for (version, sql) in MIGRATIONS {
        if *version <= current {
            continue;
        }

        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.pragma_update(None, "user_version", i64::from(*version))?;
        tx.execute(
            "UPDATE store_meta SET schema_version = ?1 WHERE id = 1",
            [i64::from(*version)],
        )?;
        tx.commit()?;
        tracing::info!(version, "applied store schema migration");
        current = *version;
    }

    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::{LATEST_SCHEMA_VERSION, current_schema_version, migrate};
    use crate::backend::sqlite::schema;
    use rusqlite::{Connection, params};

    fn table_sql(conn: &Connection, table: &str) -> rusqlite::Result<String> {
        conn.query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )
    }

    #[test]
    fn migrate_empty_db_to_latest() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;

        let applied = migrate(&mut conn)?;
        assert_eq!(applied, LATEST_SCHEMA_VERSION);
        assert_eq!(current_schema_version(&conn)?, LATEST_SCHEMA_VERSION);

        // Both stores are clustered on their key, so lookups and range scans
        // never go through a rowid.
        for table in schema::REQUIRED_TABLES {
            let sql = table_sql(&conn, table)?;
            if *table != "store_meta" {
                assert!(sql.contains("WITHOUT ROWID"), "{table} is a rowid table");
            }
        }

        Ok(())
    }

    #[test]
    fn v1_records_are_write_once_and_keyed_by_id() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;

        let insert = "INSERT OR IGNORE INTO event_records (key, record) VALUES (?1, ?2)";
        conn.execute(insert, params!["blake3:00", b"first".to_vec()])?;
        conn.execute(insert, params!["blake3:00", b"second".to_vec()])?;
        let record: Vec<u8> = conn.query_row(
            "SELECT record FROM event_records WHERE key = 'blake3:00'",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(record, b"first");

        let unprefixed = conn.execute(
            "INSERT INTO event_records (key, record) VALUES ('00ff', x'')",
            [],
        );
        assert!(unprefixed.is_err(), "key without algorithm prefix accepted");

        let replace = "INSERT OR REPLACE INTO index_entries (k, v) VALUES (?1, ?2)";
        conn.execute(replace, params![b"H".to_vec(), b"1".to_vec()])?;
        conn.execute(replace, params![b"H".to_vec(), b"2".to_vec()])?;
        let value: Vec<u8> =
            conn.query_row("SELECT v FROM index_entries", [], |row| row.get(0))?;
        assert_eq!(value, b"2");

        Ok(())
    }

    #[test]
    fn migrate_is_idempotent() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;

        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);
        assert_eq!(migrate(&mut conn)?, LATEST_SCHEMA_VERSION);

        let meta_rows: i64 =
            conn.query_row("SELECT COUNT(*) FROM store_meta", [], |row| row.get(0))?;
        assert_eq!(meta_rows, 1);

        let schema_version: i64 = conn.query_row(
            "SELECT schema_version FROM store_meta WHERE id = 1",
            [],
            |row| row.get(0),
        )?;
        assert_eq!(schema_version, i64::from(LATEST_SCHEMA_VERSION));

        Ok(())
    }

    #[test]
    fn blob_keys_sort_bytewise() -> rusqlite::Result<()> {
        let mut conn = Connection::open_in_memory()?;
        migrate(&mut conn)?;

        for key in [&[0x01_u8, 0xff][..], &[0x01, 0x00, 0x05], &[0x00], &[0x01]] {
            conn.execute(
                "INSERT INTO index_entries (k, v) VALUES (?1, x'')",
                params![key],
            )?;
        }

        let mut stmt = conn.prepare("SELECT k FROM index_entries ORDER BY k")?;
        let keys: Vec<Vec<u8>> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        assert_eq!(
            keys,
            vec![vec![0x00], vec![0x01], vec![0x01, 0x00, 0x05], vec![0x01, 0xff]]
        );

        Ok(())
    }
}
