//! Export and import of stored companion state.
//!
//! A snapshot copies every key/value entry and every record of one or more
//! storage scopes into a single JSON document. Restoring a snapshot replaces
//! the contents of the scopes it names and leaves other scopes alone.

use crate::store::{StateStore, StorageScope, StoreError, StoredRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::{info, warn};

/// Errors from snapshot operations.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("Storage full while restoring {key} in scope {scope}")]
    StorageFull { scope: StorageScope, key: String },
}

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Everything stored under one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSnapshot {
    pub scope: StorageScope,
    #[serde(default)]
    pub kv: BTreeMap<String, Value>,
    #[serde(default)]
    pub records: BTreeMap<String, Vec<StoredRecord>>,
}

impl ScopeSnapshot {
    pub fn is_empty(&self) -> bool {
        self.kv.is_empty() && self.records.values().all(Vec::is_empty)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub scopes: Vec<ScopeSnapshot>,
}

impl Snapshot {
    /// Copy the named scopes out of the store.
    pub async fn capture(state: &StateStore, scopes: &[StorageScope]) -> Result<Self, SnapshotError> {
        let backend = state.backend();
        let mut captured = Vec::with_capacity(scopes.len());

        for scope in scopes {
            let mut snap = ScopeSnapshot {
                scope: scope.clone(),
                kv: BTreeMap::new(),
                records: BTreeMap::new(),
            };
            for key in state.timed(backend.keys(scope)).await? {
                if let Some(value) = state.timed(backend.get(scope, &key)).await? {
                    snap.kv.insert(key, value);
                }
            }
            for collection in state.timed(backend.collections(scope)).await? {
                let records = state.timed(backend.all_records(scope, &collection)).await?;
                snap.records.insert(collection, records);
            }
            captured.push(snap);
        }

        Ok(Self {
            version: SNAPSHOT_VERSION,
            exported_at: Utc::now(),
            scopes: captured,
        })
    }

    /// Replace the contents of every scope in this snapshot.
    ///
    /// Either every scope is replaced or, on failure, every scope touched so
    /// far is put back the way it was before the call.
    pub async fn restore(&self, state: &StateStore) -> Result<(), SnapshotError> {
        self.check_version()?;
        let names: Vec<StorageScope> = self.scopes.iter().map(|s| s.scope.clone()).collect();
        let previous = Snapshot::capture(state, &names).await?;

        for (i, snap) in self.scopes.iter().enumerate() {
            if let Err(e) = replace_scope(state, snap).await {
                warn!(scope = %snap.scope, error = %e, "restore failed, rolling back");
                for prior in previous.scopes[..=i].iter().rev() {
                    if let Err(rollback) = replace_scope(state, prior).await {
                        warn!(scope = %prior.scope, error = %rollback, "rollback failed");
                    }
                }
                return Err(e);
            }
            info!(scope = %snap.scope, keys = snap.kv.len(), collections = snap.records.len(), "scope restored");
        }
        Ok(())
    }

    pub fn scope(&self, scope: &StorageScope) -> Option<&ScopeSnapshot> {
        self.scopes.iter().find(|s| &s.scope == scope)
    }

    /// Save to a JSON file.
    pub async fn save_json(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Load from a JSON file.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let content = fs::read_to_string(path).await?;
        let snapshot: Self = serde_json::from_str(&content)?;
        snapshot.check_version()?;
        Ok(snapshot)
    }

    fn check_version(&self) -> Result<(), SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::VersionMismatch {
                expected: SNAPSHOT_VERSION,
                found: self.version,
            });
        }
        Ok(())
    }
}

/// Make `scope` hold exactly what `snap` holds.
///
/// Stale keys go first so the new values have room; values are written
/// through [`StateStore::save`] so bulk eviction applies.
async fn replace_scope(state: &StateStore, snap: &ScopeSnapshot) -> Result<(), SnapshotError> {
    let backend = state.backend();
    let scope = &snap.scope;

    for key in state.timed(backend.keys(scope)).await? {
        if !snap.kv.contains_key(&key) {
            state.remove(scope, &key).await?;
        }
    }
    for (key, value) in &snap.kv {
        if !state.save(scope, key, value).await?.is_written() {
            return Err(SnapshotError::StorageFull {
                scope: scope.clone(),
                key: key.clone(),
            });
        }
    }

    for collection in state.timed(backend.collections(scope)).await? {
        let keep = snap.records.get(&collection);
        for record in state.timed(backend.all_records(scope, &collection)).await? {
            if !keep.is_some_and(|records| records.iter().any(|r| r.id == record.id)) {
                state
                    .timed(backend.delete_record(scope, &collection, &record.id))
                    .await?;
            }
        }
    }
    for (collection, records) in &snap.records {
        for record in records {
            state
                .timed(backend.put_record(scope, collection, record.clone()))
                .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::events::EventBus;
    use crate::store::{InMemoryStore, KvStore, RecordStore};
    use serde_json::json;
    use std::sync::Arc;

    fn state() -> StateStore {
        StateStore::new(Arc::new(InMemoryStore::new()), EventBus::default())
    }

    #[tokio::test]
    async fn test_capture_and_restore() {
        let source = state();
        let scope = StorageScope::new("main");
        source.save(&scope, "couple-space", &"slot").await.unwrap();
        source
            .backend()
            .put_record(
                &scope,
                "memories",
                StoredRecord::new("m1", Utc::now(), serde_json::json!({"t": 1})).for_character("c1"),
            )
            .await
            .unwrap();

        let snapshot = Snapshot::capture(&source, &[scope.clone()]).await.unwrap();
        let snap = snapshot.scope(&scope).unwrap();
        assert_eq!(snap.kv.len(), 1);
        assert_eq!(snap.records["memories"].len(), 1);

        let target = state();
        target.save(&scope, "stale", &1).await.unwrap();
        snapshot.restore(&target).await.unwrap();

        let keys = target.backend().keys(&scope).await.unwrap();
        assert_eq!(keys, vec!["couple-space".to_string()]);
        let records = target
            .backend()
            .records_for_character(&scope, "memories", "c1")
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_leaves_other_scopes() {
        let store = state();
        let other = StorageScope::new("sub_1");
        store.save(&other, "k", &"keep").await.unwrap();

        let snapshot = Snapshot::capture(&store, &[StorageScope::new("main")])
            .await
            .unwrap();
        assert!(snapshot.scopes[0].is_empty());
        snapshot.restore(&store).await.unwrap();

        let kept: Option<String> = store.load_optional(&other, "k").await.unwrap();
        assert_eq!(kept.as_deref(), Some("keep"));
    }

    #[tokio::test]
    async fn test_version_mismatch() {
        let mut snapshot = Snapshot::capture(&state(), &[]).await.unwrap();
        snapshot.version = 99;
        let result = snapshot.restore(&state()).await;
        assert!(matches!(
            result,
            Err(SnapshotError::VersionMismatch { expected: 1, found: 99 })
        ));
    }

    fn scope_with(scope: &StorageScope, kv: &[(&str, Value)]) -> Snapshot {
        Snapshot {
            version: SNAPSHOT_VERSION,
            exported_at: Utc::now(),
            scopes: vec![ScopeSnapshot {
                scope: scope.clone(),
                kv: kv.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
                records: BTreeMap::new(),
            }],
        }
    }

    fn small_store(quota: usize) -> StateStore {
        StateStore::new(
            Arc::new(InMemoryStore::with_config(
                &StoreConfig::default().with_quota_bytes(quota),
            )),
            EventBus::default(),
        )
    }

    #[tokio::test]
    async fn test_restore_frees_stale_keys_before_writing() {
        let scope = StorageScope::new("main");
        let target = small_store(30);
        target.save(&scope, "keep", &"0123456789").await.unwrap();

        let snapshot = scope_with(
            &scope,
            &[("a", json!("0123456789")), ("b", json!("0123456789"))],
        );
        snapshot.restore(&target).await.unwrap();
        assert_eq!(target.backend().keys(&scope).await.unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failed_restore_rolls_back() {
        let scope = StorageScope::new("main");
        let target = small_store(30);
        target.save(&scope, "keep", &"0123456789").await.unwrap();
        target
            .backend()
            .put_record(
                &scope,
                "memories",
                StoredRecord::new("m1", Utc::now(), json!({"t": 1})),
            )
            .await
            .unwrap();

        let snapshot = scope_with(
            &scope,
            &[("a", json!("0123456789abcd")), ("b", json!("0123456789abcd"))],
        );
        let result = snapshot.restore(&target).await;
        assert!(matches!(
            result,
            Err(SnapshotError::StorageFull { ref key, .. }) if key == "b"
        ));

        assert_eq!(target.backend().keys(&scope).await.unwrap(), vec!["keep"]);
        let kept: Option<String> = target.load_optional(&scope, "keep").await.unwrap();
        assert_eq!(kept.as_deref(), Some("0123456789"));
        assert_eq!(
            target.backend().all_records(&scope, "memories").await.unwrap().len(),
            1
        );
    }
}
