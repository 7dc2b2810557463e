//! Long-term memory of interactions with each character.
//!
//! Memories are summaries written by an extraction step elsewhere. This module
//! only stores them and decides which few are worth showing the model on a
//! given turn. Records are never edited in place; a newer record supersedes an
//! older one by ranking above it.

use crate::store::{
    decode_records, StateStore, StorageScope, StoreError, StoredRecord,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const COLLECTION: &str = "memories";

/// Errors from memory operations.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Memory {0} already exists")]
    Duplicate(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Unique identifier for a memory record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryId(Uuid);

impl MemoryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MemoryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryDomain {
    /// A stretch of conversation.
    Chat,
    /// A social-feed post or comment.
    Moments,
    /// Something the character did through a feature (a transfer, an order).
    Action,
}

/// How much a memory matters.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    Low,
    #[default]
    Normal,
    High,
}

/// The span of conversation a memory summarizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A summarized interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: MemoryId,
    pub character_id: String,
    pub domain: MemoryDomain,
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub importance: Importance,
    #[serde(default)]
    pub tags: Vec<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub time_range: Option<TimeRange>,
}

impl MemoryRecord {
    pub fn new(
        character_id: impl Into<String>,
        domain: MemoryDomain,
        title: impl Into<String>,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: MemoryId::new(),
            character_id: character_id.into(),
            domain,
            title: title.into(),
            summary: summary.into(),
            importance: Importance::Normal,
            tags: Vec::new(),
            timestamp: Utc::now(),
            time_range: None,
        }
    }

    pub fn with_importance(mut self, importance: Importance) -> Self {
        self.importance = importance;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_time_range(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.time_range = Some(TimeRange { start, end });
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// When the remembered events happened.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.time_range.map(|r| r.start).unwrap_or(self.timestamp)
    }
}

// ============================================================================
// Ranking
// ============================================================================

/// Chooses and orders the memories shown to the model.
pub trait RankingPolicy: Send + Sync + fmt::Debug {
    /// Return at most `limit` records, best first.
    fn rank(&self, records: Vec<MemoryRecord>, limit: usize) -> Vec<MemoryRecord>;
}

fn newest_first(records: &mut [MemoryRecord]) {
    records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
}

/// Newest first.
#[derive(Debug, Clone, Copy, Default)]
pub struct Recency;

impl RankingPolicy for Recency {
    fn rank(&self, mut records: Vec<MemoryRecord>, limit: usize) -> Vec<MemoryRecord> {
        newest_first(&mut records);
        records.truncate(limit);
        records
    }
}

/// Higher importance first, newest first within a tier.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportanceWeighted;

impl RankingPolicy for ImportanceWeighted {
    fn rank(&self, mut records: Vec<MemoryRecord>, limit: usize) -> Vec<MemoryRecord> {
        records.sort_by(|a, b| {
            b.importance
                .cmp(&a.importance)
                .then_with(|| b.timestamp.cmp(&a.timestamp))
        });
        records.truncate(limit);
        records
    }
}

/// Records sharing a tag with the filter, newest first.
///
/// Falls back to plain recency when no record matches.
#[derive(Debug, Clone, Default)]
pub struct TagFiltered {
    tags: Vec<String>,
}

impl TagFiltered {
    pub fn new(tags: Vec<String>) -> Self {
        Self { tags }
    }
}

impl RankingPolicy for TagFiltered {
    fn rank(&self, records: Vec<MemoryRecord>, limit: usize) -> Vec<MemoryRecord> {
        let (matching, rest): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| r.tags.iter().any(|t| self.tags.contains(t)));
        if matching.is_empty() {
            Recency.rank(rest, limit)
        } else {
            Recency.rank(matching, limit)
        }
    }
}

/// Configurable choice of ranking policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RankingKind {
    #[default]
    Recency,
    ImportanceWeighted,
    TagFiltered(Vec<String>),
}

impl RankingKind {
    /// Parse `recency`, `importance`, or `tags:a,b`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        match raw.to_ascii_lowercase().as_str() {
            "recency" => Some(RankingKind::Recency),
            "importance" | "importance-weighted" => Some(RankingKind::ImportanceWeighted),
            _ => {
                let tags = raw.strip_prefix("tags:")?;
                let tags: Vec<String> = tags
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string)
                    .collect();
                (!tags.is_empty()).then_some(RankingKind::TagFiltered(tags))
            }
        }
    }

    pub fn policy(&self) -> Box<dyn RankingPolicy> {
        match self {
            RankingKind::Recency => Box::new(Recency),
            RankingKind::ImportanceWeighted => Box::new(ImportanceWeighted),
            RankingKind::TagFiltered(tags) => Box::new(TagFiltered::new(tags.clone())),
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// A memory ready for the prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievedMemory {
    pub id: MemoryId,
    /// Month and day, e.g. "Mar 5".
    pub date_label: String,
    /// Summary cut to the configured cap.
    pub summary: String,
    pub importance: Importance,
}

/// Cut `text` to at most `cap` characters, ending in an ellipsis when cut.
pub fn truncate_summary(text: &str, cap: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= cap {
        return text.to_string();
    }
    if cap == 0 {
        return String::new();
    }
    let mut out: String = text.chars().take(cap - 1).collect();
    out.push('…');
    out
}

/// Append-only memory storage with ranked, bounded retrieval.
pub struct MemoryStore {
    state: StateStore,
    policy: Box<dyn RankingPolicy>,
    summary_cap: usize,
}

impl MemoryStore {
    pub fn new(state: StateStore, ranking: &RankingKind, summary_cap: usize) -> Self {
        Self {
            state,
            policy: ranking.policy(),
            summary_cap,
        }
    }

    /// Swap in a custom ranking policy.
    pub fn with_policy(mut self, policy: Box<dyn RankingPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Store a new memory. Ids are never reused; appending a record whose id
    /// is already stored fails with [`MemoryError::Duplicate`].
    pub async fn append(
        &self,
        scope: &StorageScope,
        record: &MemoryRecord,
    ) -> Result<(), MemoryError> {
        let stored = StoredRecord::new(
            record.id.to_string(),
            record.timestamp,
            serde_json::to_value(record).map_err(StoreError::from)?,
        )
        .for_character(&record.character_id);
        match self
            .state
            .timed(self.state.backend().insert_record(scope, COLLECTION, stored))
            .await
        {
            Ok(()) => {}
            Err(StoreError::RecordExists { id, .. }) => return Err(MemoryError::Duplicate(id)),
            Err(e) => return Err(e.into()),
        }
        debug!(%scope, character = %record.character_id, id = %record.id, "memory appended");
        Ok(())
    }

    /// Every stored memory for a character, oldest first.
    pub async fn all(
        &self,
        scope: &StorageScope,
        character_id: &str,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let records = self
            .state
            .timed(
                self.state
                    .backend()
                    .records_for_character(scope, COLLECTION, character_id),
            )
            .await?;
        Ok(decode_records(COLLECTION, records))
    }

    /// The best `limit` memories for a character, ready for the prompt.
    pub async fn retrieve(
        &self,
        scope: &StorageScope,
        character_id: &str,
        limit: usize,
    ) -> Result<Vec<RetrievedMemory>, MemoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let records = self.all(scope, character_id).await?;
        let total = records.len();
        let ranked = self.policy.rank(records, limit);
        debug!(character = character_id, total, surfaced = ranked.len(), "memories ranked");

        Ok(ranked
            .into_iter()
            .take(limit)
            .map(|record| RetrievedMemory {
                id: record.id,
                date_label: record.occurred_at().format("%b %-d").to_string(),
                summary: truncate_summary(&record.summary, self.summary_cap),
                importance: record.importance,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::store::InMemoryStore;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn store(ranking: RankingKind) -> MemoryStore {
        let state = StateStore::new(Arc::new(InMemoryStore::new()), EventBus::default());
        MemoryStore::new(state, &ranking, 60)
    }

    fn scope() -> StorageScope {
        StorageScope::new("main")
    }

    fn record(summary: &str, minutes_ago: i64) -> MemoryRecord {
        MemoryRecord::new("char1", MemoryDomain::Chat, "t", summary)
            .at(Utc::now() - Duration::minutes(minutes_ago))
    }

    #[test]
    fn test_truncate_summary() {
        assert_eq!(truncate_summary("  short  ", 60), "short");
        let long = "a".repeat(100);
        let cut = truncate_summary(&long, 60);
        assert_eq!(cut.chars().count(), 60);
        assert!(cut.ends_with('…'));

        let cjk = "我们一起去看了海边的日落然后吃了很好吃的烧烤";
        let cut = truncate_summary(cjk, 10);
        assert_eq!(cut.chars().count(), 10);
        assert_eq!(truncate_summary("abc", 0), "");
    }

    #[test]
    fn test_ranking_kind_parse() {
        assert_eq!(RankingKind::parse("recency"), Some(RankingKind::Recency));
        assert_eq!(
            RankingKind::parse("Importance"),
            Some(RankingKind::ImportanceWeighted)
        );
        assert_eq!(
            RankingKind::parse("tags:food, travel"),
            Some(RankingKind::TagFiltered(vec!["food".into(), "travel".into()]))
        );
        assert_eq!(RankingKind::parse("tags:"), None);
        assert_eq!(RankingKind::parse("random"), None);
    }

    #[test]
    fn test_importance_weighted() {
        let records = vec![
            record("old high", 30).with_importance(Importance::High),
            record("new normal", 1),
            record("new high", 5).with_importance(Importance::High),
        ];
        let ranked = ImportanceWeighted.rank(records, 2);
        let summaries: Vec<&str> = ranked.iter().map(|r| r.summary.as_str()).collect();
        assert_eq!(summaries, vec!["new high", "old high"]);
    }

    #[test]
    fn test_tag_filter_falls_back() {
        let records = vec![
            record("food", 10).with_tags(["food"]),
            record("latest", 1).with_tags(["work"]),
        ];
        let policy = TagFiltered::new(vec!["food".into()]);
        assert_eq!(policy.rank(records.clone(), 5).len(), 1);

        let policy = TagFiltered::new(vec!["travel".into()]);
        let ranked = policy.rank(records, 5);
        assert_eq!(ranked[0].summary, "latest");
    }

    #[tokio::test]
    async fn test_retrieve_recent_first() {
        let store = store(RankingKind::Recency);
        for i in 0..8 {
            store
                .append(&scope(), &record(&format!("memory {i}"), 100 - i))
                .await
                .unwrap();
        }
        let other = MemoryRecord::new("char2", MemoryDomain::Chat, "t", "elsewhere");
        store.append(&scope(), &other).await.unwrap();

        let got = store.retrieve(&scope(), "char1", 5).await.unwrap();
        assert_eq!(got.len(), 5);
        assert_eq!(got[0].summary, "memory 7");
        assert!(got.iter().all(|m| m.summary != "elsewhere"));
    }

    #[tokio::test]
    async fn test_date_label_prefers_time_range() {
        let store = store(RankingKind::Recency);
        let start = Utc.with_ymd_and_hms(2025, 3, 5, 20, 0, 0).unwrap();
        let record = MemoryRecord::new("char1", MemoryDomain::Chat, "t", "dinner")
            .at(Utc.with_ymd_and_hms(2025, 3, 7, 9, 0, 0).unwrap())
            .with_time_range(start, start + Duration::hours(1));
        store.append(&scope(), &record).await.unwrap();

        let got = store.retrieve(&scope(), "char1", 5).await.unwrap();
        assert_eq!(got[0].date_label, "Mar 5");
    }

    #[tokio::test]
    async fn test_append_rejects_duplicate_id() {
        let store = store(RankingKind::Recency);
        let original = record("first version", 5);
        store.append(&scope(), &original).await.unwrap();

        let mut rewrite = original.clone();
        rewrite.summary = "rewritten".to_string();
        let err = store.append(&scope(), &rewrite).await.unwrap_err();
        assert!(matches!(err, MemoryError::Duplicate(ref id) if *id == original.id.to_string()));

        let all = store.all(&scope(), "char1").await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].summary, "first version");
    }

    #[tokio::test]
    async fn test_retrieve_empty() {
        let store = store(RankingKind::ImportanceWeighted);
        assert!(store.retrieve(&scope(), "nobody", 5).await.unwrap().is_empty());
        assert!(store.retrieve(&scope(), "nobody", 0).await.unwrap().is_empty());
    }
}
