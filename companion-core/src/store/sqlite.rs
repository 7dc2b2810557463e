//! SQLite storage backend.
//!
//! Connections come from an r2d2 pool and every call runs on the blocking
//! thread pool, so the async callers only ever see suspension points.

use super::{
    eviction_count, is_bulk_key, KvStore, RecordStore, StorageScope, StoreError, StoredRecord,
    Versioned,
};
use crate::config::StoreConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde_json::Value;
use std::path::Path;
use tracing::warn;

type DbPool = Pool<SqliteConnectionManager>;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS kv (
        scope TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        version INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (scope, key)
    );
    CREATE TABLE IF NOT EXISTS records (
        scope TEXT NOT NULL,
        collection TEXT NOT NULL,
        id TEXT NOT NULL,
        character_id TEXT,
        timestamp INTEGER NOT NULL,
        body TEXT NOT NULL,
        PRIMARY KEY (scope, collection, id)
    );
    CREATE INDEX IF NOT EXISTS idx_records_character
        ON records(scope, collection, character_id);
"#;

/// Storage backed by a SQLite database file.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
    quota_bytes: Option<usize>,
    bulk_prefixes: Vec<String>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("quota_bytes", &self.quota_bytes)
            .field("bulk_prefixes", &self.bulk_prefixes)
            .finish()
    }
}

impl SqliteStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self, StoreError> {
        let manager = SqliteConnectionManager::file(path.as_ref()).with_init(|c| {
            c.execute_batch(
                r#"
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA temp_store=MEMORY;
                    PRAGMA busy_timeout=5000;
                "#,
            )
        });
        let pool = Pool::builder().max_size(config.pool_size).build(manager)?;
        Self::from_pool(pool, config)
    }

    /// Open a private in-memory database.
    ///
    /// The pool holds a single connection since each SQLite memory
    /// connection is its own database.
    pub fn open_in_memory(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .build(SqliteConnectionManager::memory())?;
        Self::from_pool(pool, config)
    }

    fn from_pool(pool: DbPool, config: &StoreConfig) -> Result<Self, StoreError> {
        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("sqlite schema ready");
        Ok(Self {
            pool,
            quota_bytes: config.quota_bytes,
            bulk_prefixes: config.bulk_prefixes.clone(),
        })
    }

    async fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn read_version(tx: &Transaction<'_>, scope: &str, key: &str) -> Result<Option<(u64, usize)>, StoreError> {
    let row = tx
        .query_row(
            "SELECT version, length(CAST(value AS BLOB)) FROM kv WHERE scope = ?1 AND key = ?2",
            params![scope, key],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()?;
    Ok(row.map(|(v, len)| (v as u64, len as usize)))
}

fn write_kv(
    tx: &Transaction<'_>,
    quota: Option<usize>,
    scope: &str,
    key: &str,
    text: &str,
    existing: Option<(u64, usize)>,
) -> Result<u64, StoreError> {
    let bytes = text.len();
    if let Some(quota) = quota {
        let used: i64 = tx.query_row(
            "SELECT COALESCE(SUM(length(CAST(value AS BLOB))), 0) FROM kv",
            [],
            |row| row.get(0),
        )?;
        let others = (used as usize).saturating_sub(existing.map(|(_, len)| len).unwrap_or(0));
        if others + bytes > quota {
            return Err(StoreError::QuotaExceeded {
                needed: bytes,
                available: quota.saturating_sub(others),
            });
        }
    }

    let version = existing.map(|(v, _)| v).unwrap_or(0) + 1;
    tx.execute(
        "INSERT INTO kv (scope, key, value, version, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(scope, key) DO UPDATE SET
            value = excluded.value,
            version = excluded.version,
            updated_at = excluded.updated_at",
        params![scope, key, text, version as i64, Utc::now().timestamp_micros()],
    )?;
    Ok(version)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, Option<String>, i64, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

/// Rows whose body is not valid JSON are skipped.
fn into_record(raw: (String, Option<String>, i64, String)) -> Option<StoredRecord> {
    let (id, character_id, millis, body) = raw;
    match serde_json::from_str(&body) {
        Ok(body) => Some(StoredRecord {
            id,
            character_id,
            timestamp: DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default(),
            body,
        }),
        Err(e) => {
            warn!(id = %id, error = %e, "skipping unreadable record row");
            None
        }
    }
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get_versioned(
        &self,
        scope: &StorageScope,
        key: &str,
    ) -> Result<Option<Versioned>, StoreError> {
        let (scope, key) = (scope.to_string(), key.to_string());
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT value, version FROM kv WHERE scope = ?1 AND key = ?2",
                    params![scope, key],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;
            match row {
                Some((text, version)) => {
                    // Unreadable text reads as null and keeps its version.
                    let value = serde_json::from_str(&text).unwrap_or_else(|e| {
                        warn!(%scope, key = %key, error = %e, "unreadable stored value");
                        Value::Null
                    });
                    Ok(Some(Versioned {
                        value,
                        version: version as u64,
                    }))
                }
                None => Ok(None),
            }
        })
        .await
    }

    async fn set(&self, scope: &StorageScope, key: &str, value: Value) -> Result<u64, StoreError> {
        let (scope, key) = (scope.to_string(), key.to_string());
        let text = serde_json::to_string(&value)?;
        let quota = self.quota_bytes;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let existing = read_version(&tx, &scope, &key)?;
            let version = write_kv(&tx, quota, &scope, &key, &text, existing)?;
            tx.commit()?;
            Ok(version)
        })
        .await
    }

    async fn set_if_version(
        &self,
        scope: &StorageScope,
        key: &str,
        value: Value,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        let (scope, key) = (scope.to_string(), key.to_string());
        let text = serde_json::to_string(&value)?;
        let quota = self.quota_bytes;
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
            let existing = read_version(&tx, &scope, &key)?;
            let found = existing.map(|(v, _)| v);
            if found != expected {
                return Err(StoreError::VersionConflict {
                    key,
                    expected,
                    found,
                });
            }
            let version = write_kv(&tx, quota, &scope, &key, &text, existing)?;
            tx.commit()?;
            Ok(version)
        })
        .await
    }

    async fn remove(&self, scope: &StorageScope, key: &str) -> Result<bool, StoreError> {
        let (scope, key) = (scope.to_string(), key.to_string());
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM kv WHERE scope = ?1 AND key = ?2",
                params![scope, key],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn keys(&self, scope: &StorageScope) -> Result<Vec<String>, StoreError> {
        let scope = scope.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare("SELECT key FROM kv WHERE scope = ?1 ORDER BY key")?;
            let keys = stmt
                .query_map(params![scope], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }

    async fn evict_bulk(&self) -> Result<usize, StoreError> {
        let prefixes = self.bulk_prefixes.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let bulk: Vec<(String, String)> = {
                let mut stmt =
                    tx.prepare("SELECT scope, key FROM kv ORDER BY updated_at ASC, rowid ASC")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter()
                    .filter(|(_, key)| is_bulk_key(key, &prefixes))
                    .collect()
            };

            let count = eviction_count(bulk.len());
            for (scope, key) in bulk.iter().take(count) {
                tx.execute(
                    "DELETE FROM kv WHERE scope = ?1 AND key = ?2",
                    params![scope, key],
                )?;
            }
            tx.commit()?;
            Ok(count)
        })
        .await
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn put_record(
        &self,
        scope: &StorageScope,
        collection: &str,
        record: StoredRecord,
    ) -> Result<(), StoreError> {
        let (scope, collection) = (scope.to_string(), collection.to_string());
        let body = serde_json::to_string(&record.body)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO records (scope, collection, id, character_id, timestamp, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(scope, collection, id) DO UPDATE SET
                    character_id = excluded.character_id,
                    timestamp = excluded.timestamp,
                    body = excluded.body",
                params![
                    scope,
                    collection,
                    record.id,
                    record.character_id,
                    record.timestamp.timestamp_millis(),
                    body
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn insert_record(
        &self,
        scope: &StorageScope,
        collection: &str,
        record: StoredRecord,
    ) -> Result<(), StoreError> {
        let (scope, collection) = (scope.to_string(), collection.to_string());
        let body = serde_json::to_string(&record.body)?;
        self.with_conn(move |conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO records (scope, collection, id, character_id, timestamp, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    scope,
                    collection,
                    record.id,
                    record.character_id,
                    record.timestamp.timestamp_millis(),
                    body
                ],
            )?;
            if n == 0 {
                return Err(StoreError::RecordExists {
                    collection,
                    id: record.id,
                });
            }
            Ok(())
        })
        .await
    }

    async fn get_record(
        &self,
        scope: &StorageScope,
        collection: &str,
        id: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let (scope, collection, id) = (scope.to_string(), collection.to_string(), id.to_string());
        self.with_conn(move |conn| {
            let raw = conn
                .query_row(
                    "SELECT id, character_id, timestamp, body FROM records
                     WHERE scope = ?1 AND collection = ?2 AND id = ?3",
                    params![scope, collection, id],
                    row_to_record,
                )
                .optional()?;
            Ok(raw.and_then(into_record))
        })
        .await
    }

    async fn all_records(
        &self,
        scope: &StorageScope,
        collection: &str,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let (scope, collection) = (scope.to_string(), collection.to_string());
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, character_id, timestamp, body FROM records
                 WHERE scope = ?1 AND collection = ?2 ORDER BY timestamp ASC, id ASC",
            )?;
            let raws = stmt
                .query_map(params![scope, collection], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(raws.into_iter().filter_map(into_record).collect())
        })
        .await
    }

    async fn records_for_character(
        &self,
        scope: &StorageScope,
        collection: &str,
        character_id: &str,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let (scope, collection, character_id) = (
            scope.to_string(),
            collection.to_string(),
            character_id.to_string(),
        );
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, character_id, timestamp, body FROM records
                 WHERE scope = ?1 AND collection = ?2 AND character_id = ?3
                 ORDER BY timestamp ASC, id ASC",
            )?;
            let raws = stmt
                .query_map(params![scope, collection, character_id], row_to_record)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(raws.into_iter().filter_map(into_record).collect())
        })
        .await
    }

    async fn delete_record(
        &self,
        scope: &StorageScope,
        collection: &str,
        id: &str,
    ) -> Result<bool, StoreError> {
        let (scope, collection, id) = (scope.to_string(), collection.to_string(), id.to_string());
        self.with_conn(move |conn| {
            let n = conn.execute(
                "DELETE FROM records WHERE scope = ?1 AND collection = ?2 AND id = ?3",
                params![scope, collection, id],
            )?;
            Ok(n > 0)
        })
        .await
    }

    async fn collections(&self, scope: &StorageScope) -> Result<Vec<String>, StoreError> {
        let scope = scope.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT collection FROM records WHERE scope = ?1 ORDER BY collection",
            )?;
            let names = stmt
                .query_map(params![scope], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn scope() -> StorageScope {
        StorageScope::new("main")
    }

    #[tokio::test]
    async fn test_kv_roundtrip_on_disk() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("companion.db");

        {
            let store = SqliteStore::open(&path, &StoreConfig::default()).unwrap();
            store.set(&scope(), "k", json!({"a": 1})).await.unwrap();
        }

        let store = SqliteStore::open(&path, &StoreConfig::default()).unwrap();
        let read = store.get_versioned(&scope(), "k").await.unwrap().unwrap();
        assert_eq!(read.value, json!({"a": 1}));
        assert_eq!(read.version, 1);
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let store = SqliteStore::open_in_memory(&StoreConfig::default()).unwrap();
        let v1 = store
            .set_if_version(&scope(), "slot", json!(1), None)
            .await
            .unwrap();
        assert_eq!(v1, 1);

        let err = store
            .set_if_version(&scope(), "slot", json!(2), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        assert_eq!(
            store.set_if_version(&scope(), "slot", json!(2), Some(1)).await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_quota_and_eviction() {
        let config = StoreConfig::default().with_quota_bytes(40);
        let store = SqliteStore::open_in_memory(&config).unwrap();

        store.set(&scope(), "transcript:a", json!("0123456789")).await.unwrap();
        store.set(&scope(), "transcript:b", json!("0123456789")).await.unwrap();
        let err = store
            .set(&scope(), "couple-space", json!("01234567890123456789"))
            .await
            .unwrap_err();
        assert!(err.is_quota());

        assert_eq!(store.evict_bulk().await.unwrap(), 1);
        store
            .set(&scope(), "couple-space", json!("01234567890123456789"))
            .await
            .unwrap();
        assert_eq!(
            store.keys(&scope()).await.unwrap(),
            vec!["couple-space", "transcript:b"]
        );
    }

    #[tokio::test]
    async fn test_records_index() {
        let store = SqliteStore::open_in_memory(&StoreConfig::default()).unwrap();
        let now = Utc::now();
        for (id, character) in [("p1", "c1"), ("p2", "c2"), ("p3", "c1")] {
            store
                .put_record(
                    &scope(),
                    "couple-photos",
                    StoredRecord::new(id, now, json!({"id": id})).for_character(character),
                )
                .await
                .unwrap();
        }

        let c1 = store
            .records_for_character(&scope(), "couple-photos", "c1")
            .await
            .unwrap();
        assert_eq!(c1.len(), 2);
        assert!(c1.iter().all(|r| r.character_id.as_deref() == Some("c1")));

        let fetched = store
            .get_record(&scope(), "couple-photos", "p2")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.body, json!({"id": "p2"}));
        assert_eq!(fetched.timestamp.timestamp_millis(), now.timestamp_millis());

        assert!(store.delete_record(&scope(), "couple-photos", "p2").await.unwrap());
        assert_eq!(store.all_records(&scope(), "couple-photos").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_insert_record_never_replaces() {
        let store = SqliteStore::open_in_memory(&StoreConfig::default()).unwrap();
        let now = Utc::now();
        store
            .insert_record(&scope(), "memories", StoredRecord::new("m1", now, json!(1)))
            .await
            .unwrap();

        let err = store
            .insert_record(&scope(), "memories", StoredRecord::new("m1", now, json!(2)))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RecordExists { ref id, .. } if id == "m1"));

        let kept = store.get_record(&scope(), "memories", "m1").await.unwrap().unwrap();
        assert_eq!(kept.body, json!(1));
    }

    #[tokio::test]
    async fn test_corrupt_rows_are_not_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("companion.db");
        let store = SqliteStore::open(&path, &StoreConfig::default()).unwrap();
        store.set(&scope(), "slot", json!({"a": 1})).await.unwrap();
        for id in ["m1", "m2"] {
            store
                .put_record(
                    &scope(),
                    "memories",
                    StoredRecord::new(id, Utc::now(), json!({"id": id})).for_character("c1"),
                )
                .await
                .unwrap();
        }

        let conn = Connection::open(&path).unwrap();
        conn.execute("UPDATE kv SET value = '{not json' WHERE key = 'slot'", [])
            .unwrap();
        conn.execute("UPDATE records SET body = '{not json' WHERE id = 'm1'", [])
            .unwrap();
        drop(conn);

        let read = store.get_versioned(&scope(), "slot").await.unwrap().unwrap();
        assert_eq!(read.value, Value::Null);
        assert_eq!(read.version, 1);
        assert_eq!(
            store.set_if_version(&scope(), "slot", json!({"a": 2}), Some(1)).await.unwrap(),
            2
        );

        let records = store
            .records_for_character(&scope(), "memories", "c1")
            .await
            .unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["m2"]);
        assert_eq!(store.all_records(&scope(), "memories").await.unwrap().len(), 1);
        assert!(store.get_record(&scope(), "memories", "m1").await.unwrap().is_none());
    }
}
