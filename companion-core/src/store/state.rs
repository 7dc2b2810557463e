//! Typed state access over a raw backend.

use super::{Store, StorageScope, StoreError, StoredRecord};
use crate::events::{CompanionEvent, EventBus};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a write that went through quota recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The value is stored at this version.
    Written { version: u64 },
    /// The store stayed full after eviction; the value was not stored.
    Dropped,
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written { .. })
    }
}

/// Typed, schema-checked access to the key/value layer.
///
/// - Reads that fail to decode degrade to `T::default()` with a warning.
/// - Writes that hit the quota evict bulk records and retry once; a second
///   failure drops the write and broadcasts a [`CompanionEvent::StorageWarning`].
#[derive(Clone)]
pub struct StateStore {
    store: Arc<dyn Store>,
    events: EventBus,
    op_timeout: Option<Duration>,
}

impl StateStore {
    pub fn new(store: Arc<dyn Store>, events: EventBus) -> Self {
        Self {
            store,
            events,
            op_timeout: None,
        }
    }

    /// Bound every store call by `timeout`.
    pub fn with_op_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.op_timeout = timeout;
        self
    }

    /// The raw backend.
    pub fn backend(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub(crate) async fn timed<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        match self.op_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| StoreError::Timeout(limit))?,
            None => fut.await,
        }
    }

    /// Read a typed value, falling back to the default when absent or malformed.
    pub async fn load<T>(&self, scope: &StorageScope, key: &str) -> Result<T, StoreError>
    where
        T: DeserializeOwned + Default,
    {
        Ok(self.load_versioned(scope, key).await?.0)
    }

    /// Read a typed value with the version it was stored at.
    ///
    /// A malformed value still reports its version so that a
    /// compare-and-set can overwrite it.
    pub async fn load_versioned<T>(
        &self,
        scope: &StorageScope,
        key: &str,
    ) -> Result<(T, Option<u64>), StoreError>
    where
        T: DeserializeOwned + Default,
    {
        let Some(stored) = self.timed(self.store.get_versioned(scope, key)).await? else {
            return Ok((T::default(), None));
        };
        match serde_json::from_value(stored.value) {
            Ok(value) => Ok((value, Some(stored.version))),
            Err(e) => {
                warn!(%scope, key, error = %e, "malformed stored value, using default");
                Ok((T::default(), Some(stored.version)))
            }
        }
    }

    /// Read a typed value that has no meaningful default.
    pub async fn load_optional<T>(
        &self,
        scope: &StorageScope,
        key: &str,
    ) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned,
    {
        let Some(value) = self.timed(self.store.get(scope, key)).await? else {
            return Ok(None);
        };
        match serde_json::from_value(value) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(%scope, key, error = %e, "malformed stored value, treating as absent");
                Ok(None)
            }
        }
    }

    /// Write a typed value.
    pub async fn save<T>(
        &self,
        scope: &StorageScope,
        key: &str,
        value: &T,
    ) -> Result<WriteOutcome, StoreError>
    where
        T: Serialize + ?Sized,
    {
        self.write(scope, key, serde_json::to_value(value)?, None).await
    }

    /// Write a typed value only if the stored version is still `expected`.
    pub async fn save_if_version<T>(
        &self,
        scope: &StorageScope,
        key: &str,
        value: &T,
        expected: Option<u64>,
    ) -> Result<WriteOutcome, StoreError>
    where
        T: Serialize + ?Sized,
    {
        self.write(scope, key, serde_json::to_value(value)?, Some(expected))
            .await
    }

    pub async fn remove(&self, scope: &StorageScope, key: &str) -> Result<bool, StoreError> {
        self.timed(self.store.remove(scope, key)).await
    }

    async fn write(
        &self,
        scope: &StorageScope,
        key: &str,
        value: serde_json::Value,
        expected: Option<Option<u64>>,
    ) -> Result<WriteOutcome, StoreError> {
        match self.attempt(scope, key, value.clone(), expected).await {
            Ok(version) => return Ok(WriteOutcome::Written { version }),
            Err(e) if e.is_quota() => {}
            Err(e) => return Err(e),
        }

        let evicted = self.timed(self.store.evict_bulk()).await?;
        debug!(%scope, key, evicted, "quota exceeded, evicted bulk records");

        match self.attempt(scope, key, value, expected).await {
            Ok(version) => Ok(WriteOutcome::Written { version }),
            Err(StoreError::QuotaExceeded { needed, available }) => {
                warn!(%scope, key, needed, available, "storage full, write dropped");
                self.events.publish(CompanionEvent::StorageWarning {
                    scope: scope.clone(),
                    key: key.to_string(),
                    message: format!(
                        "Storage is full: {needed} bytes needed, {available} available. \
                         Delete old conversations to free space."
                    ),
                });
                Ok(WriteOutcome::Dropped)
            }
            Err(e) => Err(e),
        }
    }

    async fn attempt(
        &self,
        scope: &StorageScope,
        key: &str,
        value: serde_json::Value,
        expected: Option<Option<u64>>,
    ) -> Result<u64, StoreError> {
        match expected {
            Some(expected) => {
                self.timed(self.store.set_if_version(scope, key, value, expected))
                    .await
            }
            None => self.timed(self.store.set(scope, key, value)).await,
        }
    }
}

/// Decode record bodies, skipping the ones that no longer match the schema.
pub(crate) fn decode_records<T: DeserializeOwned>(
    collection: &str,
    records: Vec<StoredRecord>,
) -> Vec<T> {
    records
        .into_iter()
        .filter_map(|record| match serde_json::from_value(record.body) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(collection, id = %record.id, error = %e, "skipping malformed record");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::{InMemoryStore, KvStore, RecordStore, Versioned};
    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::{json, Value};

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        count: u32,
    }

    fn scope() -> StorageScope {
        StorageScope::new("main")
    }

    #[tokio::test]
    async fn test_malformed_value_reads_as_default() {
        let backend = Arc::new(InMemoryStore::new());
        backend.set(&scope(), "counter", json!("not an object")).await.unwrap();

        let state = StateStore::new(backend, EventBus::default());
        let (counter, version) = state
            .load_versioned::<Counter>(&scope(), "counter")
            .await
            .unwrap();
        assert_eq!(counter, Counter::default());
        assert_eq!(version, Some(1));

        // The stale version still lets a compare-and-set repair the value.
        let outcome = state
            .save_if_version(&scope(), "counter", &Counter { count: 3 }, version)
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written { version: 2 });
    }

    #[tokio::test]
    async fn test_quota_recovers_after_eviction() {
        let backend = Arc::new(InMemoryStore::with_config(
            &StoreConfig::default().with_quota_bytes(40),
        ));
        backend
            .set(&scope(), "transcript:old", json!("0123456789012345678901234567"))
            .await
            .unwrap();

        let state = StateStore::new(backend.clone(), EventBus::default());
        let outcome = state
            .save(&scope(), "counter", &Counter { count: 7 })
            .await
            .unwrap();
        assert!(outcome.is_written());
        assert!(backend.get(&scope(), "transcript:old").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_quota_drops_and_warns() {
        let backend = Arc::new(InMemoryStore::with_config(
            &StoreConfig::default().with_quota_bytes(4),
        ));
        let events = EventBus::default();
        let mut rx = events.subscribe();
        let state = StateStore::new(backend, events);

        let outcome = state
            .save(&scope(), "counter", &Counter { count: 7 })
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Dropped);

        match rx.try_recv().unwrap() {
            CompanionEvent::StorageWarning { key, .. } => assert_eq!(key, "counter"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_version_conflict_propagates() {
        let state = StateStore::new(Arc::new(InMemoryStore::new()), EventBus::default());
        state.save(&scope(), "counter", &Counter { count: 1 }).await.unwrap();

        let err = state
            .save_if_version(&scope(), "counter", &Counter { count: 2 }, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    /// A backend whose calls never complete.
    struct StalledStore;

    async fn stall<T>() -> T {
        std::future::pending().await
    }

    #[async_trait]
    impl KvStore for StalledStore {
        async fn get_versioned(&self, _: &StorageScope, _: &str) -> Result<Option<Versioned>, StoreError> {
            stall().await
        }
        async fn set(&self, _: &StorageScope, _: &str, _: Value) -> Result<u64, StoreError> {
            stall().await
        }
        async fn set_if_version(
            &self,
            _: &StorageScope,
            _: &str,
            _: Value,
            _: Option<u64>,
        ) -> Result<u64, StoreError> {
            stall().await
        }
        async fn remove(&self, _: &StorageScope, _: &str) -> Result<bool, StoreError> {
            stall().await
        }
        async fn keys(&self, _: &StorageScope) -> Result<Vec<String>, StoreError> {
            stall().await
        }
        async fn evict_bulk(&self) -> Result<usize, StoreError> {
            stall().await
        }
    }

    #[async_trait]
    impl RecordStore for StalledStore {
        async fn put_record(&self, _: &StorageScope, _: &str, _: StoredRecord) -> Result<(), StoreError> {
            stall().await
        }
        async fn insert_record(&self, _: &StorageScope, _: &str, _: StoredRecord) -> Result<(), StoreError> {
            stall().await
        }
        async fn get_record(&self, _: &StorageScope, _: &str, _: &str) -> Result<Option<StoredRecord>, StoreError> {
            stall().await
        }
        async fn all_records(&self, _: &StorageScope, _: &str) -> Result<Vec<StoredRecord>, StoreError> {
            stall().await
        }
        async fn records_for_character(
            &self,
            _: &StorageScope,
            _: &str,
            _: &str,
        ) -> Result<Vec<StoredRecord>, StoreError> {
            stall().await
        }
        async fn delete_record(&self, _: &StorageScope, _: &str, _: &str) -> Result<bool, StoreError> {
            stall().await
        }
        async fn collections(&self, _: &StorageScope) -> Result<Vec<String>, StoreError> {
            stall().await
        }
    }

    #[tokio::test]
    async fn test_stalled_backend_times_out() {
        let limit = Duration::from_millis(20);
        let state = StateStore::new(Arc::new(StalledStore), EventBus::default())
            .with_op_timeout(Some(limit));

        let err = state.load::<Counter>(&scope(), "counter").await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(d) if d == limit));

        let err = state
            .save(&scope(), "counter", &Counter { count: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
        assert!(matches!(
            state.remove(&scope(), "counter").await,
            Err(StoreError::Timeout(_))
        ));
    }

    #[test]
    fn test_decode_records_skips_malformed() {
        let now = chrono::Utc::now();
        let decoded: Vec<Counter> = decode_records(
            "counters",
            vec![
                StoredRecord::new("a", now, json!({"count": 1})),
                StoredRecord::new("b", now, json!([1, 2])),
            ],
        );
        assert_eq!(decoded, vec![Counter { count: 1 }]);
    }
}
