//! Couple-space content: shared photos, message-board notes, anniversaries.
//!
//! Content is indexed by character and survives the end of a relationship,
//! so a couple that gets back together finds their album where they left it.

use super::RelationshipError;
use crate::store::{
    decode_records, StateStore, StorageScope, StoreError, StoredRecord,
};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::Write as _;
use tracing::debug;
use uuid::Uuid;

const PHOTOS: &str = "couple-photos";
const NOTES: &str = "couple-notes";
const ANNIVERSARIES: &str = "couple-anniversaries";

/// A photo shared in the couple album. Only its description is kept here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouplePhoto {
    pub id: String,
    pub character_id: String,
    pub uploader_name: String,
    pub description: String,
    pub taken_at: DateTime<Utc>,
}

/// A message-board entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoupleNote {
    pub id: String,
    pub character_id: String,
    pub author: String,
    pub content: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anniversary {
    pub id: String,
    pub character_id: String,
    pub date: NaiveDate,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Anniversary {
    /// Days from `today` to the anniversary; negative once it has passed.
    pub fn days_until(&self, today: NaiveDate) -> i64 {
        (self.date - today).num_days()
    }
}

/// Everything in the couple space for one character, newest first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentSummary {
    pub photos: Vec<CouplePhoto>,
    pub notes: Vec<CoupleNote>,
    pub anniversaries: Vec<Anniversary>,
}

impl ContentSummary {
    pub fn is_empty(&self) -> bool {
        self.photos.is_empty() && self.notes.is_empty() && self.anniversaries.is_empty()
    }

    /// Render the summary as prompt lines, relative to `today`.
    pub fn render(&self, today: NaiveDate) -> String {
        let mut out = String::new();
        if !self.photos.is_empty() {
            out.push_str("Album:\n");
            for photo in &self.photos {
                let _ = writeln!(
                    out,
                    "  - {} {} shared a photo: {}",
                    photo.taken_at.format("%Y-%m-%d %H:%M"),
                    photo.uploader_name,
                    photo.description
                );
            }
        }
        if !self.notes.is_empty() {
            out.push_str("Message board:\n");
            for note in &self.notes {
                let _ = writeln!(
                    out,
                    "  - {} {} wrote: {}",
                    note.at.format("%Y-%m-%d %H:%M"),
                    note.author,
                    note.content
                );
            }
        }
        if !self.anniversaries.is_empty() {
            out.push_str("Anniversaries:\n");
            for ann in &self.anniversaries {
                let _ = write!(
                    out,
                    "  - {} {} ({})",
                    ann.date.format("%Y-%m-%d"),
                    ann.title,
                    describe_days(ann.days_until(today))
                );
                if let Some(description) = &ann.description {
                    let _ = write!(out, " - {description}");
                }
                out.push('\n');
            }
        }
        out
    }
}

fn describe_days(days: i64) -> String {
    match days {
        0 => "today".to_string(),
        1 => "tomorrow".to_string(),
        d if d > 0 => format!("in {d} days"),
        -1 => "1 day ago".to_string(),
        d => format!("{} days ago", -d),
    }
}

/// Couple-space content for one identity scope.
#[derive(Clone)]
pub struct CoupleContent {
    state: StateStore,
    scope: StorageScope,
}

impl CoupleContent {
    pub fn new(state: StateStore, scope: StorageScope) -> Self {
        Self { state, scope }
    }

    pub async fn add_photo(
        &self,
        character_id: &str,
        uploader_name: &str,
        description: &str,
        taken_at: DateTime<Utc>,
    ) -> Result<CouplePhoto, RelationshipError> {
        let photo = CouplePhoto {
            id: format!("photo_{}", Uuid::new_v4()),
            character_id: character_id.to_string(),
            uploader_name: uploader_name.to_string(),
            description: description.to_string(),
            taken_at,
        };
        self.put(PHOTOS, &photo.id, character_id, taken_at, &photo)
            .await?;
        Ok(photo)
    }

    pub async fn add_note(
        &self,
        character_id: &str,
        author: &str,
        content: &str,
    ) -> Result<CoupleNote, RelationshipError> {
        let note = CoupleNote {
            id: format!("note_{}", Uuid::new_v4()),
            character_id: character_id.to_string(),
            author: author.to_string(),
            content: content.to_string(),
            at: Utc::now(),
        };
        self.put(NOTES, &note.id, character_id, note.at, &note).await?;
        Ok(note)
    }

    pub async fn add_anniversary(
        &self,
        character_id: &str,
        date: NaiveDate,
        title: &str,
        description: Option<&str>,
    ) -> Result<Anniversary, RelationshipError> {
        let anniversary = Anniversary {
            id: format!("anniversary_{}", Uuid::new_v4()),
            character_id: character_id.to_string(),
            date,
            title: title.to_string(),
            description: description.map(str::to_string),
            created_at: Utc::now(),
        };
        self.put(
            ANNIVERSARIES,
            &anniversary.id,
            character_id,
            anniversary.created_at,
            &anniversary,
        )
        .await?;
        Ok(anniversary)
    }

    pub async fn photos(&self, character_id: &str) -> Result<Vec<CouplePhoto>, RelationshipError> {
        self.list(PHOTOS, character_id).await
    }

    pub async fn notes(&self, character_id: &str) -> Result<Vec<CoupleNote>, RelationshipError> {
        self.list(NOTES, character_id).await
    }

    pub async fn anniversaries(
        &self,
        character_id: &str,
    ) -> Result<Vec<Anniversary>, RelationshipError> {
        self.list(ANNIVERSARIES, character_id).await
    }

    pub async fn delete_photo(&self, id: &str) -> Result<bool, RelationshipError> {
        self.delete(PHOTOS, id).await
    }

    pub async fn delete_note(&self, id: &str) -> Result<bool, RelationshipError> {
        self.delete(NOTES, id).await
    }

    pub async fn delete_anniversary(&self, id: &str) -> Result<bool, RelationshipError> {
        self.delete(ANNIVERSARIES, id).await
    }

    /// All content for a character, newest first.
    pub async fn summary(&self, character_id: &str) -> Result<ContentSummary, RelationshipError> {
        let (photos, notes, anniversaries) = futures::try_join!(
            self.photos(character_id),
            self.notes(character_id),
            self.anniversaries(character_id)
        )?;
        Ok(ContentSummary {
            photos,
            notes,
            anniversaries,
        })
    }

    async fn put<T: Serialize>(
        &self,
        collection: &str,
        id: &str,
        character_id: &str,
        timestamp: DateTime<Utc>,
        value: &T,
    ) -> Result<(), RelationshipError> {
        let body = serde_json::to_value(value).map_err(StoreError::from)?;
        let record = StoredRecord::new(id, timestamp, body).for_character(character_id);
        self.state
            .timed(self.state.backend().put_record(&self.scope, collection, record))
            .await?;
        debug!(collection, id, character = character_id, "stored couple content");
        Ok(())
    }

    async fn list<T: DeserializeOwned>(
        &self,
        collection: &str,
        character_id: &str,
    ) -> Result<Vec<T>, RelationshipError> {
        let records = self
            .state
            .timed(
                self.state
                    .backend()
                    .records_for_character(&self.scope, collection, character_id),
            )
            .await?;
        let mut items = decode_records(collection, records);
        items.reverse();
        Ok(items)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, RelationshipError> {
        Ok(self
            .state
            .timed(self.state.backend().delete_record(&self.scope, collection, id))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::store::InMemoryStore;
    use chrono::Duration;
    use std::sync::Arc;

    fn content() -> CoupleContent {
        let state = StateStore::new(Arc::new(InMemoryStore::new()), EventBus::default());
        CoupleContent::new(state, StorageScope::new("main"))
    }

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_days_until() {
        let ann = Anniversary {
            id: "a".into(),
            character_id: "c".into(),
            date: date("2026-02-14"),
            title: "First date".into(),
            description: None,
            created_at: Utc::now(),
        };
        assert_eq!(ann.days_until(date("2026-02-14")), 0);
        assert_eq!(ann.days_until(date("2026-02-10")), 4);
        assert_eq!(ann.days_until(date("2026-02-20")), -6);
    }

    #[test]
    fn test_describe_days() {
        assert_eq!(describe_days(0), "today");
        assert_eq!(describe_days(3), "in 3 days");
        assert_eq!(describe_days(-2), "2 days ago");
    }

    #[tokio::test]
    async fn test_content_is_per_character_newest_first() {
        let content = content();
        let now = Utc::now();
        content
            .add_photo("char1", "Mika", "beach", now - Duration::days(2))
            .await
            .unwrap();
        content.add_photo("char1", "Me", "sunset", now).await.unwrap();
        content.add_photo("char2", "Ren", "cafe", now).await.unwrap();

        let photos = content.photos("char1").await.unwrap();
        assert_eq!(photos.len(), 2);
        assert_eq!(photos[0].description, "sunset");
        assert_eq!(content.photos("char2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_summary_render() {
        let content = content();
        content.add_note("char1", "Mika", "miss you").await.unwrap();
        content
            .add_anniversary("char1", date("2026-03-01"), "Together", Some("day one"))
            .await
            .unwrap();

        let summary = content.summary("char1").await.unwrap();
        assert!(!summary.is_empty());
        let text = summary.render(date("2026-02-27"));
        assert!(text.contains("Mika wrote: miss you"));
        assert!(text.contains("Together (in 2 days) - day one"));
        assert!(!text.contains("Album:"));

        assert!(content.summary("char2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let content = content();
        let note = content.add_note("char1", "Me", "hi").await.unwrap();
        assert!(content.delete_note(&note.id).await.unwrap());
        assert!(!content.delete_note(&note.id).await.unwrap());
        assert!(content.notes("char1").await.unwrap().is_empty());
    }
}
