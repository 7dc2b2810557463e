//! The couple-space relationship.
//!
//! Each identity scope holds a single relationship slot: at most one bonded
//! pair between the user and a character, no matter how many characters the
//! user talks to. Content shared inside the couple space (photos, notes,
//! anniversaries) lives in [`content`] and outlives the relationship.
//!
//! Every mutation is a compare-and-set on the slot's stored version, so two
//! sessions racing on the same slot cannot silently undo each other.

pub mod content;
pub mod listening;

pub use content::{Anniversary, ContentSummary, CoupleContent, CouplePhoto, CoupleNote};
pub use listening::{ListeningSession, ListeningTracker};

use crate::events::CompanionEvent;
use crate::identity::ResolvedIdentity;
use crate::store::{StateStore, StorageScope, StoreError, WriteOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

const SLOT_KEY: &str = "couple-space";

/// Errors from relationship operations.
#[derive(Debug, Error)]
pub enum RelationshipError {
    #[error("A couple space with {character_id} is already active")]
    Conflict { character_id: String },

    #[error("No pending invite for {character_id}")]
    NoPendingInvite { character_id: String },

    #[error("No active couple space")]
    NotActive,

    #[error("Relationship changed concurrently (expected version {expected:?}, found {found:?})")]
    StaleVersion {
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("Relationship change was not saved because storage is full")]
    NotSaved,

    #[error("Storage error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for RelationshipError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionConflict {
                expected, found, ..
            } => RelationshipError::StaleVersion { expected, found },
            other => RelationshipError::Store(other),
        }
    }
}

// ============================================================================
// Types
// ============================================================================

/// Unique identifier for a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationshipId(Uuid);

impl RelationshipId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RelationshipId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RelationshipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipStatus {
    Pending,
    Active,
    Rejected,
    Ended,
}

impl RelationshipStatus {
    pub fn name(&self) -> &'static str {
        match self {
            RelationshipStatus::Pending => "pending",
            RelationshipStatus::Active => "active",
            RelationshipStatus::Rejected => "rejected",
            RelationshipStatus::Ended => "ended",
        }
    }

    /// Terminal states are only left through a fresh invite.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RelationshipStatus::Rejected | RelationshipStatus::Ended)
    }
}

/// Who proposed the relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    User,
    Character,
}

/// A couple-space relationship record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,
    pub user_id: String,
    pub character_id: String,
    pub status: RelationshipStatus,
    pub sender: Sender,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Relationship {
    fn invite(user_id: &str, character_id: &str, sender: Sender, now: DateTime<Utc>) -> Self {
        Self {
            id: RelationshipId::new(),
            user_id: user_id.to_string(),
            character_id: character_id.to_string(),
            status: RelationshipStatus::Pending,
            sender,
            created_at: now,
            accepted_at: None,
            ended_at: None,
        }
    }

    fn is_pending_for(&self, character_id: &str) -> bool {
        self.status == RelationshipStatus::Pending && self.character_id == character_id
    }
}

/// How the last relationship finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Rejected,
    Ended,
}

impl Outcome {
    pub fn name(&self) -> &'static str {
        match self {
            Outcome::Rejected => "rejected",
            Outcome::Ended => "ended",
        }
    }
}

/// The most recent terminal transition, kept after the record is cleared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastOutcome {
    pub relationship_id: RelationshipId,
    pub character_id: String,
    pub outcome: Outcome,
    /// Who had sent the invite that this outcome closed.
    pub sender: Sender,
    pub at: DateTime<Utc>,
}

/// Couple-space visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privacy {
    Public,
    #[default]
    Private,
}

/// Everything stored in the relationship slot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipSlot {
    #[serde(default)]
    pub relationship: Option<Relationship>,
    #[serde(default)]
    pub last_outcome: Option<LastOutcome>,
    #[serde(default)]
    pub privacy: Privacy,
}

impl RelationshipSlot {
    pub fn active(&self) -> Option<&Relationship> {
        self.relationship
            .as_ref()
            .filter(|r| r.status == RelationshipStatus::Active)
    }

    pub fn pending(&self) -> Option<&Relationship> {
        self.relationship
            .as_ref()
            .filter(|r| r.status == RelationshipStatus::Pending)
    }
}

/// A slot read together with the version it was stored at.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotView {
    pub slot: RelationshipSlot,
    pub version: Option<u64>,
}

// ============================================================================
// State machine
// ============================================================================

/// The relationship state machine for one identity scope.
#[derive(Clone)]
pub struct RelationshipBook {
    state: StateStore,
    scope: StorageScope,
    user_id: String,
    pinned: Option<Option<u64>>,
}

impl RelationshipBook {
    pub fn new(state: StateStore, scope: StorageScope, user_id: impl Into<String>) -> Self {
        Self {
            state,
            scope,
            user_id: user_id.into(),
            pinned: None,
        }
    }

    /// The book for whoever is currently resolved.
    pub fn for_identity(state: StateStore, identity: &ResolvedIdentity) -> Self {
        Self::new(state, identity.storage_scope.clone(), identity.account.id())
    }

    /// Only apply changes if the slot is still at `version`.
    ///
    /// Use this when acting on a view the user saw earlier; any write in
    /// between makes the operation fail with `StaleVersion`.
    pub fn at_version(mut self, version: Option<u64>) -> Self {
        self.pinned = Some(version);
        self
    }

    /// The slot and its version.
    pub async fn view(&self) -> Result<SlotView, RelationshipError> {
        let (slot, version) = self.state.load_versioned(&self.scope, SLOT_KEY).await?;
        Ok(SlotView { slot, version })
    }

    /// The current relationship record, if any.
    pub async fn current(&self) -> Result<Option<Relationship>, RelationshipError> {
        Ok(self.view().await?.slot.relationship)
    }

    pub async fn has_active(&self) -> Result<bool, RelationshipError> {
        Ok(self.view().await?.slot.active().is_some())
    }

    pub async fn has_pending(&self) -> Result<bool, RelationshipError> {
        Ok(self.view().await?.slot.pending().is_some())
    }

    /// Whether an invite would be accepted right now.
    pub async fn can_send_invite(&self) -> Result<bool, RelationshipError> {
        Ok(!self.has_active().await?)
    }

    pub async fn privacy(&self) -> Result<Privacy, RelationshipError> {
        Ok(self.view().await?.slot.privacy)
    }

    pub async fn set_privacy(&self, privacy: Privacy) -> Result<(), RelationshipError> {
        self.mutate(|slot| {
            slot.privacy = privacy;
            Ok(())
        })
        .await
    }

    /// Propose a couple space. Replaces any pending or rejected record.
    pub async fn invite(
        &self,
        character_id: &str,
        sender: Sender,
    ) -> Result<Relationship, RelationshipError> {
        let user_id = self.user_id.clone();
        let relationship = self
            .mutate(|slot| {
                if let Some(active) = slot.active() {
                    return Err(RelationshipError::Conflict {
                        character_id: active.character_id.clone(),
                    });
                }
                let fresh = Relationship::invite(&user_id, character_id, sender, Utc::now());
                slot.relationship = Some(fresh.clone());
                Ok(fresh)
            })
            .await?;

        info!(character = character_id, sender = ?sender, "couple space invite");
        self.notify(character_id, Some(RelationshipStatus::Pending));
        Ok(relationship)
    }

    /// Accept the pending invite for `character_id`.
    pub async fn accept(&self, character_id: &str) -> Result<Relationship, RelationshipError> {
        let relationship = self
            .mutate(|slot| {
                let record = slot
                    .relationship
                    .as_mut()
                    .filter(|r| r.is_pending_for(character_id))
                    .ok_or_else(|| RelationshipError::NoPendingInvite {
                        character_id: character_id.to_string(),
                    })?;
                record.status = RelationshipStatus::Active;
                record.accepted_at = Some(Utc::now());
                Ok(record.clone())
            })
            .await?;

        info!(character = character_id, "couple space active");
        self.notify(character_id, Some(RelationshipStatus::Active));
        Ok(relationship)
    }

    /// Reject the pending invite for `character_id`.
    pub async fn reject(&self, character_id: &str) -> Result<Relationship, RelationshipError> {
        let relationship = self
            .mutate(|slot| {
                let record = slot
                    .relationship
                    .as_mut()
                    .filter(|r| r.is_pending_for(character_id))
                    .ok_or_else(|| RelationshipError::NoPendingInvite {
                        character_id: character_id.to_string(),
                    })?;
                record.status = RelationshipStatus::Rejected;
                let rejected = record.clone();
                slot.last_outcome = Some(LastOutcome {
                    relationship_id: rejected.id,
                    character_id: rejected.character_id.clone(),
                    outcome: Outcome::Rejected,
                    sender: rejected.sender,
                    at: Utc::now(),
                });
                Ok(rejected)
            })
            .await?;

        info!(character = character_id, "couple space invite rejected");
        self.notify(character_id, Some(RelationshipStatus::Rejected));
        Ok(relationship)
    }

    /// Withdraw a pending invite. No outcome is recorded.
    pub async fn cancel(&self, character_id: &str) -> Result<Relationship, RelationshipError> {
        let relationship = self
            .mutate(|slot| {
                match slot.relationship.take() {
                    Some(record) if record.is_pending_for(character_id) => Ok(record),
                    other => {
                        slot.relationship = other;
                        Err(RelationshipError::NoPendingInvite {
                            character_id: character_id.to_string(),
                        })
                    }
                }
            })
            .await?;

        info!(character = character_id, "couple space invite cancelled");
        self.notify(character_id, None);
        Ok(relationship)
    }

    /// End the active relationship.
    ///
    /// The record is cleared; photos, notes, and anniversaries stay.
    pub async fn end(&self) -> Result<Relationship, RelationshipError> {
        let relationship = self
            .mutate(|slot| {
                if slot.active().is_none() {
                    return Err(RelationshipError::NotActive);
                }
                let mut ended = slot.relationship.take().ok_or(RelationshipError::NotActive)?;
                let now = Utc::now();
                ended.status = RelationshipStatus::Ended;
                ended.ended_at = Some(now);
                slot.last_outcome = Some(LastOutcome {
                    relationship_id: ended.id,
                    character_id: ended.character_id.clone(),
                    outcome: Outcome::Ended,
                    sender: ended.sender,
                    at: now,
                });
                Ok(ended)
            })
            .await?;

        info!(character = %relationship.character_id, "couple space ended");
        self.notify(&relationship.character_id, None);
        Ok(relationship)
    }

    async fn mutate<T, F>(&self, apply: F) -> Result<T, RelationshipError>
    where
        F: FnOnce(&mut RelationshipSlot) -> Result<T, RelationshipError>,
    {
        let SlotView { mut slot, version } = self.view().await?;
        if let Some(pinned) = self.pinned {
            if pinned != version {
                return Err(RelationshipError::StaleVersion {
                    expected: pinned,
                    found: version,
                });
            }
        }

        let result = apply(&mut slot)?;
        match self
            .state
            .save_if_version(&self.scope, SLOT_KEY, &slot, version)
            .await?
        {
            WriteOutcome::Written { .. } => Ok(result),
            WriteOutcome::Dropped => Err(RelationshipError::NotSaved),
        }
    }

    fn notify(&self, character_id: &str, status: Option<RelationshipStatus>) {
        self.state
            .events()
            .publish(CompanionEvent::RelationshipChanged {
                character_id: character_id.to_string(),
                status,
            });
    }
}
