//! Durable storage for companion state.
//!
//! Two layers share one backend:
//! - A key/value layer for small JSON values (identity registry, relationship
//!   slot, trigger markers, transcripts), namespaced by [`StorageScope`] and
//!   versioned per key.
//! - A record layer for larger objects (memories, couple-space content),
//!   grouped into collections and indexed by character id.
//!
//! Backends implement both traits; see [`InMemoryStore`] and [`SqliteStore`].
//! Domain code goes through [`StateStore`], which adds typed access, quota
//! recovery, and malformed-value handling on top of the raw traits.

mod memory;
mod sqlite;
mod state;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use state::{StateStore, WriteOutcome};
pub(crate) use state::decode_records;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Key prefix marking bulk records that may be evicted under quota pressure.
pub const DEFAULT_BULK_PREFIX: &str = "transcript:";

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Storage quota exceeded: {needed} bytes needed, {available} available")]
    QuotaExceeded { needed: usize, available: usize },

    #[error("Version conflict on {key}: expected {expected:?}, found {found:?}")]
    VersionConflict {
        key: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("Record {id} already exists in {collection}")]
    RecordExists { collection: String, id: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Storage task failed: {0}")]
    Task(String),

    #[error("Storage operation timed out after {0:?}")]
    Timeout(Duration),
}

impl StoreError {
    /// Whether this is a capacity failure that eviction might fix.
    pub fn is_quota(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded { .. })
    }
}

/// Storage namespace.
///
/// Every persisted value lives under a scope. Identity-owned data uses the
/// scope of the current account; registry data that must survive account
/// switches uses [`StorageScope::global`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageScope(String);

impl StorageScope {
    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }

    /// The scope shared by all identities.
    pub fn global() -> Self {
        Self("global".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value read together with its write version.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub value: Value,
    pub version: u64,
}

/// A record in the object layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: String,
    pub character_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub body: Value,
}

impl StoredRecord {
    pub fn new(id: impl Into<String>, timestamp: DateTime<Utc>, body: Value) -> Self {
        Self {
            id: id.into(),
            character_id: None,
            timestamp,
            body,
        }
    }

    /// Index this record under a character.
    pub fn for_character(mut self, character_id: impl Into<String>) -> Self {
        self.character_id = Some(character_id.into());
        self
    }
}

/// Small-value key/value layer.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value with its version.
    async fn get_versioned(
        &self,
        scope: &StorageScope,
        key: &str,
    ) -> Result<Option<Versioned>, StoreError>;

    /// Write a value unconditionally. Returns the new version.
    async fn set(&self, scope: &StorageScope, key: &str, value: Value) -> Result<u64, StoreError>;

    /// Write a value only if the stored version matches `expected`
    /// (`None` meaning the key must be absent).
    async fn set_if_version(
        &self,
        scope: &StorageScope,
        key: &str,
        value: Value,
        expected: Option<u64>,
    ) -> Result<u64, StoreError>;

    /// Remove a key. Returns whether it existed.
    async fn remove(&self, scope: &StorageScope, key: &str) -> Result<bool, StoreError>;

    /// All keys in a scope, sorted.
    async fn keys(&self, scope: &StorageScope) -> Result<Vec<String>, StoreError>;

    /// Drop the oldest half of the bulk records across all scopes.
    /// Returns the number of keys removed.
    async fn evict_bulk(&self) -> Result<usize, StoreError>;

    /// Read a value.
    async fn get(&self, scope: &StorageScope, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.get_versioned(scope, key).await?.map(|v| v.value))
    }
}

/// Object layer with a character index.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert or replace a record by id.
    async fn put_record(
        &self,
        scope: &StorageScope,
        collection: &str,
        record: StoredRecord,
    ) -> Result<(), StoreError>;

    /// Insert a record, failing with [`StoreError::RecordExists`] if the id
    /// is already taken.
    async fn insert_record(
        &self,
        scope: &StorageScope,
        collection: &str,
        record: StoredRecord,
    ) -> Result<(), StoreError>;

    async fn get_record(
        &self,
        scope: &StorageScope,
        collection: &str,
        id: &str,
    ) -> Result<Option<StoredRecord>, StoreError>;

    /// All records in a collection, oldest first.
    async fn all_records(
        &self,
        scope: &StorageScope,
        collection: &str,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    /// Records indexed under a character, oldest first.
    async fn records_for_character(
        &self,
        scope: &StorageScope,
        collection: &str,
        character_id: &str,
    ) -> Result<Vec<StoredRecord>, StoreError>;

    async fn delete_record(
        &self,
        scope: &StorageScope,
        collection: &str,
        id: &str,
    ) -> Result<bool, StoreError>;

    /// Collection names that hold at least one record in the scope.
    async fn collections(&self, scope: &StorageScope) -> Result<Vec<String>, StoreError>;
}

/// A complete storage backend.
pub trait Store: KvStore + RecordStore {}

impl<T: KvStore + RecordStore> Store for T {}

/// Whether `key` names an evictable bulk record.
pub(crate) fn is_bulk_key(key: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| key.starts_with(p.as_str()))
}

/// How many of `total` bulk keys one eviction pass removes.
pub(crate) fn eviction_count(total: usize) -> usize {
    if total == 0 {
        0
    } else {
        total.div_ceil(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_key_detection() {
        let prefixes = vec![DEFAULT_BULK_PREFIX.to_string()];
        assert!(is_bulk_key("transcript:alice", &prefixes));
        assert!(!is_bulk_key("couple-space", &prefixes));
        assert!(!is_bulk_key("transcript", &prefixes));
    }

    #[test]
    fn test_eviction_count_rounds_up() {
        assert_eq!(eviction_count(0), 0);
        assert_eq!(eviction_count(1), 1);
        assert_eq!(eviction_count(4), 2);
        assert_eq!(eviction_count(5), 3);
    }

    #[test]
    fn test_scope_display() {
        assert_eq!(StorageScope::global().to_string(), "global");
        assert_eq!(StorageScope::new("sub_1").as_str(), "sub_1");
    }
}
