//! SQLite storage backend
//!
//! One table, `documents`, keyed by `(namespace, key)` with an integer
//! `version` column. Compare-and-swap is a single `UPDATE ... WHERE version = ?`
//! statement, so it stays atomic across every connection and process that
//! opens the same database file.
//!
//! Deleting a document leaves its last version in `tombstones`, and a
//! re-created document continues numbering from there.

use super::traits::{
    OpenStore, StorageError, StorageResult, VersionedRecord, VersionedStore, WritePrecondition,
    WriteResult,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Default bound on how long a statement waits for another writer.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed versioned store
///
/// Thread-safe via internal mutex on the connection. Cross-process safety
/// comes from SQLite's own locking; a writer that cannot get the lock within
/// the busy timeout fails with a transient error.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file with an explicit busy timeout.
    pub fn open_with_timeout(path: impl AsRef<Path>, busy_timeout: Duration) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> StorageResult<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                value_json TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (namespace, key)
            );

            CREATE TABLE IF NOT EXISTS tombstones (
                namespace TEXT NOT NULL,
                key TEXT NOT NULL,
                version INTEGER NOT NULL,
                PRIMARY KEY (namespace, key)
            );

            -- Enable WAL mode so status reads do not wait on completion writes
            PRAGMA journal_mode = WAL;
            "#,
        )?;
        Ok(())
    }

    fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A panic while holding the guard cannot leave a half-applied
        // statement behind; SQLite rolls back on its own.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn current_version(conn: &Connection, namespace: &str, key: &str) -> StorageResult<Option<u64>> {
        let version: Option<i64> = conn
            .query_row(
                "SELECT version FROM documents WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version.map(|v| v as u64))
    }

    fn row_to_record(key: String, value: String, version: i64, updated_at: String) -> StorageResult<VersionedRecord> {
        Ok(VersionedRecord {
            key,
            value,
            version: version as u64,
            updated_at: DateTime::parse_from_rfc3339(&updated_at)
                .map_err(|e| StorageError::DateParse(e.to_string()))?
                .with_timezone(&Utc),
        })
    }
}

impl OpenStore for SqliteStore {
    fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl VersionedStore for SqliteStore {
    fn get(&self, namespace: &str, key: &str) -> StorageResult<Option<VersionedRecord>> {
        let conn = self.connection();

        let row: Option<(String, String, i64, String)> = conn
            .query_row(
                "SELECT key, value_json, version, updated_at
                 FROM documents WHERE namespace = ?1 AND key = ?2",
                params![namespace, key],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        match row {
            Some((key, value, version, updated_at)) => {
                Ok(Some(Self::row_to_record(key, value, version, updated_at)?))
            }
            None => Ok(None),
        }
    }

    fn put(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        precondition: WritePrecondition,
    ) -> StorageResult<WriteResult> {
        let conn = self.connection();
        let now = Utc::now().to_rfc3339();

        match precondition {
            WritePrecondition::None => {
                let version: i64 = conn.query_row(
                    r#"
                    INSERT INTO documents (namespace, key, value_json, version, updated_at)
                    VALUES (?1, ?2, ?3,
                        COALESCE((SELECT version FROM tombstones WHERE namespace = ?1 AND key = ?2), 0) + 1,
                        ?4)
                    ON CONFLICT(namespace, key) DO UPDATE SET
                        value_json = excluded.value_json,
                        version = documents.version + 1,
                        updated_at = excluded.updated_at
                    RETURNING version
                    "#,
                    params![namespace, key, value, now],
                    |row| row.get(0),
                )?;
                Ok(WriteResult::Success { version: version as u64 })
            }
            WritePrecondition::DoesNotExist => {
                let inserted: Option<i64> = conn
                    .query_row(
                        r#"
                        INSERT INTO documents (namespace, key, value_json, version, updated_at)
                        VALUES (?1, ?2, ?3,
                            COALESCE((SELECT version FROM tombstones WHERE namespace = ?1 AND key = ?2), 0) + 1,
                            ?4)
                        ON CONFLICT(namespace, key) DO NOTHING
                        RETURNING version
                        "#,
                        params![namespace, key, value, now],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(version) = inserted {
                    Ok(WriteResult::Success { version: version as u64 })
                } else {
                    Ok(WriteResult::PreconditionFailed {
                        current_version: Self::current_version(&conn, namespace, key)?,
                    })
                }
            }
            WritePrecondition::MatchesVersion(expected) => {
                let updated = conn.execute(
                    r#"
                    UPDATE documents
                    SET value_json = ?3, version = version + 1, updated_at = ?4
                    WHERE namespace = ?1 AND key = ?2 AND version = ?5
                    "#,
                    params![namespace, key, value, now, expected as i64],
                )?;
                if updated == 1 {
                    Ok(WriteResult::Success { version: expected + 1 })
                } else {
                    Ok(WriteResult::PreconditionFailed {
                        current_version: Self::current_version(&conn, namespace, key)?,
                    })
                }
            }
        }
    }

    fn delete(
        &self,
        namespace: &str,
        key: &str,
        precondition: WritePrecondition,
    ) -> StorageResult<WriteResult> {
        let mut conn = self.connection();
        let tx = conn.transaction()?;

        let deleted: Option<i64> = match precondition {
            WritePrecondition::DoesNotExist => None,
            WritePrecondition::None => tx
                .query_row(
                    "DELETE FROM documents WHERE namespace = ?1 AND key = ?2 RETURNING version",
                    params![namespace, key],
                    |row| row.get(0),
                )
                .optional()?,
            WritePrecondition::MatchesVersion(expected) => tx
                .query_row(
                    "DELETE FROM documents WHERE namespace = ?1 AND key = ?2 AND version = ?3
                     RETURNING version",
                    params![namespace, key, expected as i64],
                    |row| row.get(0),
                )
                .optional()?,
        };

        let result = match deleted {
            Some(version) => {
                tx.execute(
                    r#"
                    INSERT INTO tombstones (namespace, key, version) VALUES (?1, ?2, ?3)
                    ON CONFLICT(namespace, key) DO UPDATE SET version = excluded.version
                    "#,
                    params![namespace, key, version],
                )?;
                WriteResult::Success { version: version as u64 }
            }
            None => WriteResult::PreconditionFailed {
                current_version: Self::current_version(&tx, namespace, key)?,
            },
        };
        tx.commit()?;
        Ok(result)
    }

    fn list(&self, namespace: &str) -> StorageResult<Vec<VersionedRecord>> {
        let conn = self.connection();
        let mut stmt = conn.prepare(
            "SELECT key, value_json, version, updated_at
             FROM documents WHERE namespace = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![namespace], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (key, value, version, updated_at) = row?;
            records.push(Self::row_to_record(key, value, version, updated_at)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    #[test]
    fn test_create_then_conflict() {
        let store = create_test_store();
        let first = store.put("ns", "a", "{}", WritePrecondition::DoesNotExist).unwrap();
        assert_eq!(first, WriteResult::Success { version: 1 });

        let again = store.put("ns", "a", "{}", WritePrecondition::DoesNotExist).unwrap();
        assert_eq!(again, WriteResult::PreconditionFailed { current_version: Some(1) });
    }

    #[test]
    fn test_compare_and_swap() {
        let store = create_test_store();
        store.put("ns", "a", "\"v1\"", WritePrecondition::None).unwrap();

        let ok = store.put("ns", "a", "\"v2\"", WritePrecondition::MatchesVersion(1)).unwrap();
        assert_eq!(ok, WriteResult::Success { version: 2 });

        let stale = store.put("ns", "a", "\"v3\"", WritePrecondition::MatchesVersion(1)).unwrap();
        assert_eq!(stale, WriteResult::PreconditionFailed { current_version: Some(2) });

        let rec = store.get("ns", "a").unwrap().unwrap();
        assert_eq!(rec.value, "\"v2\"");
        assert_eq!(rec.version, 2);
    }

    #[test]
    fn test_unconditional_put_bumps_version() {
        let store = create_test_store();
        assert_eq!(
            store.put("ns", "a", "1", WritePrecondition::None).unwrap(),
            WriteResult::Success { version: 1 }
        );
        assert_eq!(
            store.put("ns", "a", "2", WritePrecondition::None).unwrap(),
            WriteResult::Success { version: 2 }
        );
    }

    #[test]
    fn test_cas_on_missing_key_fails() {
        let store = create_test_store();
        let res = store.put("ns", "missing", "1", WritePrecondition::MatchesVersion(1)).unwrap();
        assert_eq!(res, WriteResult::PreconditionFailed { current_version: None });
    }

    #[test]
    fn test_conditional_delete() {
        let store = create_test_store();
        store.put("ns", "a", "1", WritePrecondition::None).unwrap();

        let stale = store.delete("ns", "a", WritePrecondition::MatchesVersion(9)).unwrap();
        assert_eq!(stale, WriteResult::PreconditionFailed { current_version: Some(1) });

        let ok = store.delete("ns", "a", WritePrecondition::MatchesVersion(1)).unwrap();
        assert_eq!(ok, WriteResult::Success { version: 1 });
        assert!(store.get("ns", "a").unwrap().is_none());
    }

    #[test]
    fn test_recreate_after_delete_keeps_counting() {
        let store = create_test_store();
        store.put("ns", "a", "1", WritePrecondition::DoesNotExist).unwrap();
        store.put("ns", "a", "2", WritePrecondition::MatchesVersion(1)).unwrap();
        store.delete("ns", "a", WritePrecondition::None).unwrap();

        let created = store.put("ns", "a", "3", WritePrecondition::DoesNotExist).unwrap();
        assert_eq!(created, WriteResult::Success { version: 3 });

        let stale = store.put("ns", "a", "x", WritePrecondition::MatchesVersion(1)).unwrap();
        assert_eq!(stale, WriteResult::PreconditionFailed { current_version: Some(3) });

        store.delete("ns", "a", WritePrecondition::MatchesVersion(3)).unwrap();
        let upserted = store.put("ns", "a", "4", WritePrecondition::None).unwrap();
        assert_eq!(upserted, WriteResult::Success { version: 4 });
    }

    #[test]
    fn test_list_is_ordered_and_scoped() {
        let store = create_test_store();
        store.put("ns", "b", "2", WritePrecondition::None).unwrap();
        store.put("ns", "a", "1", WritePrecondition::None).unwrap();
        store.put("other", "c", "3", WritePrecondition::None).unwrap();

        let keys: Vec<_> = store.list("ns").unwrap().into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn test_wal_mode_enabled_at_connection() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("wal.db")).unwrap();

        let journal_mode: String = store
            .connection()
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();

        assert_eq!(journal_mode, "wal");
    }

    #[test]
    fn test_two_connections_share_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shared.db");
        let store_a = SqliteStore::open(&path).unwrap();
        let store_b = SqliteStore::open(&path).unwrap();

        store_a.put("ns", "doc", "1", WritePrecondition::DoesNotExist).unwrap();

        // B observes A's version and wins the swap; A's stale swap loses.
        let seen = store_b.get("ns", "doc").unwrap().unwrap();
        assert!(store_b.put("ns", "doc", "2", WritePrecondition::MatchesVersion(seen.version)).unwrap().is_success());
        assert!(!store_a.put("ns", "doc", "3", WritePrecondition::MatchesVersion(1)).unwrap().is_success());

        assert_eq!(store_a.get("ns", "doc").unwrap().unwrap().value, "2");
    }
}
