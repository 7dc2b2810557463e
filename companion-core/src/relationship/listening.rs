//! "Listening together": a shared music session with one character.

use super::{RelationshipError, Sender};
use crate::store::{StateStore, StorageScope, WriteOutcome};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

const SESSION_KEY: &str = "listening-together";

/// The song currently shared with a character.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListeningSession {
    pub character_id: String,
    pub song_title: String,
    pub song_artist: String,
    pub started_at: DateTime<Utc>,
    pub changed_at: DateTime<Utc>,
    pub changed_by: Sender,
}

impl ListeningSession {
    /// How long the session has been running.
    pub fn elapsed(&self, now: DateTime<Utc>) -> Duration {
        (now - self.started_at).max(Duration::zero())
    }

    /// Whether the user switched songs within `window` of `now`.
    pub fn user_just_changed(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.changed_by == Sender::User && now - self.changed_at < window
    }
}

/// Render a duration as "1h 5m", "3m 12s" or "40s".
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Tracks the single listening session of an identity scope.
#[derive(Clone)]
pub struct ListeningTracker {
    state: StateStore,
    scope: StorageScope,
}

impl ListeningTracker {
    pub fn new(state: StateStore, scope: StorageScope) -> Self {
        Self { state, scope }
    }

    pub async fn current(&self) -> Result<Option<ListeningSession>, RelationshipError> {
        Ok(self.state.load_optional(&self.scope, SESSION_KEY).await?)
    }

    /// Start listening with a character, replacing any other session.
    pub async fn start(
        &self,
        character_id: &str,
        song_title: &str,
        song_artist: &str,
        started_by: Sender,
    ) -> Result<ListeningSession, RelationshipError> {
        let now = Utc::now();
        let session = ListeningSession {
            character_id: character_id.to_string(),
            song_title: song_title.to_string(),
            song_artist: song_artist.to_string(),
            started_at: now,
            changed_at: now,
            changed_by: started_by,
        };
        self.store(&session).await?;
        info!(character = character_id, song = song_title, "listening together");
        Ok(session)
    }

    /// Switch songs in the running session.
    pub async fn change_song(
        &self,
        song_title: &str,
        song_artist: &str,
        changed_by: Sender,
    ) -> Result<ListeningSession, RelationshipError> {
        let mut session = self.current().await?.ok_or(RelationshipError::NotActive)?;
        session.song_title = song_title.to_string();
        session.song_artist = song_artist.to_string();
        session.changed_at = Utc::now();
        session.changed_by = changed_by;
        self.store(&session).await?;
        Ok(session)
    }

    /// End the session. Returns whether one was running.
    pub async fn stop(&self) -> Result<bool, RelationshipError> {
        Ok(self.state.remove(&self.scope, SESSION_KEY).await?)
    }

    async fn store(&self, session: &ListeningSession) -> Result<(), RelationshipError> {
        match self.state.save(&self.scope, SESSION_KEY, session).await? {
            WriteOutcome::Written { .. } => Ok(()),
            WriteOutcome::Dropped => Err(RelationshipError::NotSaved),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::store::InMemoryStore;
    use std::sync::Arc;

    fn tracker() -> ListeningTracker {
        let state = StateStore::new(Arc::new(InMemoryStore::new()), EventBus::default());
        ListeningTracker::new(state, StorageScope::new("main"))
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::seconds(40)), "40s");
        assert_eq!(format_elapsed(Duration::seconds(192)), "3m 12s");
        assert_eq!(format_elapsed(Duration::seconds(3900)), "1h 5m");
        assert_eq!(format_elapsed(Duration::seconds(-5)), "0s");
    }

    #[tokio::test]
    async fn test_start_change_stop() {
        let tracker = tracker();
        assert!(tracker.current().await.unwrap().is_none());
        assert!(matches!(
            tracker.change_song("x", "y", Sender::User).await,
            Err(RelationshipError::NotActive)
        ));

        let started = tracker
            .start("char1", "Song A", "Artist", Sender::Character)
            .await
            .unwrap();
        assert!(!started.user_just_changed(Utc::now(), Duration::seconds(30)));

        let changed = tracker.change_song("Song B", "Other", Sender::User).await.unwrap();
        assert_eq!(changed.started_at, started.started_at);
        assert!(changed.user_just_changed(Utc::now(), Duration::seconds(30)));
        assert!(!changed.user_just_changed(
            changed.changed_at + Duration::seconds(31),
            Duration::seconds(30)
        ));

        assert!(tracker.stop().await.unwrap());
        assert!(tracker.current().await.unwrap().is_none());
    }
}
