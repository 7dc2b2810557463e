//! In-process storage backend.

use super::{
    eviction_count, is_bulk_key, KvStore, RecordStore, StorageScope, StoreError, StoredRecord,
    Versioned,
};
use crate::config::StoreConfig;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Debug)]
struct KvEntry {
    value: Value,
    version: u64,
    bytes: usize,
    /// Write sequence number, used to find the oldest bulk records.
    touched: u64,
}

#[derive(Debug, Default)]
struct Inner {
    kv: HashMap<(StorageScope, String), KvEntry>,
    records: HashMap<(StorageScope, String), BTreeMap<String, StoredRecord>>,
    sequence: u64,
}

impl Inner {
    fn used_bytes(&self) -> usize {
        self.kv.values().map(|e| e.bytes).sum()
    }
}

/// Storage held entirely in memory.
///
/// The optional byte quota applies to the key/value layer, so quota recovery
/// can be exercised without a real disk filling up.
#[derive(Debug)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
    quota_bytes: Option<usize>,
    bulk_prefixes: Vec<String>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_config(&StoreConfig::default())
    }

    pub fn with_config(config: &StoreConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            quota_bytes: config.quota_bytes,
            bulk_prefixes: config.bulk_prefixes.clone(),
        }
    }

    /// Bytes currently held by the key/value layer.
    pub async fn used_bytes(&self) -> usize {
        self.inner.read().await.used_bytes()
    }

    fn write_entry(
        &self,
        inner: &mut Inner,
        scope: &StorageScope,
        key: &str,
        value: Value,
    ) -> Result<u64, StoreError> {
        let bytes = serde_json::to_vec(&value)?.len();
        let map_key = (scope.clone(), key.to_string());
        let (old_bytes, old_version) = inner
            .kv
            .get(&map_key)
            .map(|e| (e.bytes, e.version))
            .unwrap_or((0, 0));

        if let Some(quota) = self.quota_bytes {
            let others = inner.used_bytes() - old_bytes;
            if others + bytes > quota {
                return Err(StoreError::QuotaExceeded {
                    needed: bytes,
                    available: quota.saturating_sub(others),
                });
            }
        }

        inner.sequence += 1;
        let version = old_version + 1;
        let touched = inner.sequence;
        inner.kv.insert(
            map_key,
            KvEntry {
                value,
                version,
                bytes,
                touched,
            },
        );
        Ok(version)
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get_versioned(
        &self,
        scope: &StorageScope,
        key: &str,
    ) -> Result<Option<Versioned>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .kv
            .get(&(scope.clone(), key.to_string()))
            .map(|e| Versioned {
                value: e.value.clone(),
                version: e.version,
            }))
    }

    async fn set(&self, scope: &StorageScope, key: &str, value: Value) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        self.write_entry(&mut inner, scope, key, value)
    }

    async fn set_if_version(
        &self,
        scope: &StorageScope,
        key: &str,
        value: Value,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let found = inner
            .kv
            .get(&(scope.clone(), key.to_string()))
            .map(|e| e.version);
        if found != expected {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected,
                found,
            });
        }
        self.write_entry(&mut inner, scope, key, value)
    }

    async fn remove(&self, scope: &StorageScope, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner.kv.remove(&(scope.clone(), key.to_string())).is_some())
    }

    async fn keys(&self, scope: &StorageScope) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let mut keys: Vec<String> = inner
            .kv
            .keys()
            .filter(|(s, _)| s == scope)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn evict_bulk(&self) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        let mut bulk: Vec<((StorageScope, String), u64)> = inner
            .kv
            .iter()
            .filter(|((_, key), _)| is_bulk_key(key, &self.bulk_prefixes))
            .map(|(k, e)| (k.clone(), e.touched))
            .collect();
        bulk.sort_by_key(|(_, touched)| *touched);

        let count = eviction_count(bulk.len());
        for (key, _) in bulk.into_iter().take(count) {
            inner.kv.remove(&key);
        }
        Ok(count)
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn put_record(
        &self,
        scope: &StorageScope,
        collection: &str,
        record: StoredRecord,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .records
            .entry((scope.clone(), collection.to_string()))
            .or_default()
            .insert(record.id.clone(), record);
        Ok(())
    }

    async fn insert_record(
        &self,
        scope: &StorageScope,
        collection: &str,
        record: StoredRecord,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let records = inner
            .records
            .entry((scope.clone(), collection.to_string()))
            .or_default();
        if records.contains_key(&record.id) {
            return Err(StoreError::RecordExists {
                collection: collection.to_string(),
                id: record.id,
            });
        }
        records.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get_record(
        &self,
        scope: &StorageScope,
        collection: &str,
        id: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .get(&(scope.clone(), collection.to_string()))
            .and_then(|c| c.get(id))
            .cloned())
    }

    async fn all_records(
        &self,
        scope: &StorageScope,
        collection: &str,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut records: Vec<StoredRecord> = inner
            .records
            .get(&(scope.clone(), collection.to_string()))
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn records_for_character(
        &self,
        scope: &StorageScope,
        collection: &str,
        character_id: &str,
    ) -> Result<Vec<StoredRecord>, StoreError> {
        let mut records = self.all_records(scope, collection).await?;
        records.retain(|r| r.character_id.as_deref() == Some(character_id));
        Ok(records)
    }

    async fn delete_record(
        &self,
        scope: &StorageScope,
        collection: &str,
        id: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .records
            .get_mut(&(scope.clone(), collection.to_string()))
            .map(|c| c.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn collections(&self, scope: &StorageScope) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let mut names: Vec<String> = inner
            .records
            .iter()
            .filter(|((s, _), records)| s == scope && !records.is_empty())
            .map(|((_, name), _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}
