//! Identity resolution.
//!
//! The user always has a main identity. They may also hold secondary accounts,
//! each with its own storage scope, and cosmetic masks that change how they
//! appear without changing where their data lives.
//!
//! The registry of accounts and masks, plus the "current" pointers, lives in
//! the global scope so it survives account switches. Every change is a
//! compare-and-set on the registry, so a fallback to the main identity and the
//! removal it guards land in the same write.

use crate::events::CompanionEvent;
use crate::store::{StateStore, StorageScope, StoreError, WriteOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Id and storage scope of the main identity.
pub const MAIN_IDENTITY_ID: &str = "main";

const REGISTRY_KEY: &str = "identity-registry";
const HISTORY_KEY_PREFIX: &str = "profile-history:";
const DEFAULT_NICKNAME: &str = "User";

/// Errors from identity operations.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Secondary account not found: {0}")]
    AccountNotFound(String),

    #[error("Mask not found: {0}")]
    MaskNotFound(String),

    #[error("Identity change was not saved because storage is full")]
    NotSaved,

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

// ============================================================================
// Identity types
// ============================================================================

/// What kind of identity is in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityKind {
    Main,
    SecondaryAccount,
    Mask,
}

impl IdentityKind {
    pub fn name(&self) -> &'static str {
        match self {
            IdentityKind::Main => "main",
            IdentityKind::SecondaryAccount => "secondary account",
            IdentityKind::Mask => "mask",
        }
    }
}

/// Profile of the main identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub nickname: String,
    #[serde(default)]
    pub avatar_ref: String,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub real_name: Option<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            nickname: DEFAULT_NICKNAME.to_string(),
            avatar_ref: String::new(),
            signature: None,
            real_name: None,
        }
    }
}

/// A separate account with its own conversations and memories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondaryAccount {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: String,
    #[serde(default)]
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

/// A cosmetic persona worn over an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mask {
    pub id: String,
    pub nickname: String,
    #[serde(default)]
    pub real_name: Option<String>,
    #[serde(default)]
    pub avatar_ref: String,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Free-form persona the model should assume the user is playing.
    #[serde(default)]
    pub persona: Option<String>,
}

impl Mask {
    pub fn new(nickname: impl Into<String>, avatar_ref: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            nickname: nickname.into(),
            real_name: None,
            avatar_ref: avatar_ref.into(),
            signature: None,
            description: None,
            persona: None,
        }
    }

    pub fn with_real_name(mut self, name: impl Into<String>) -> Self {
        self.real_name = Some(name.into());
        self
    }

    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }
}

/// Which account is in use.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum AccountRef {
    #[default]
    Main,
    Secondary(String),
}

impl AccountRef {
    pub fn id(&self) -> &str {
        match self {
            AccountRef::Main => MAIN_IDENTITY_ID,
            AccountRef::Secondary(id) => id,
        }
    }

    /// Storage scope owned by this account.
    pub fn scope(&self) -> StorageScope {
        StorageScope::new(self.id())
    }
}

/// The identity in effect for the current session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedIdentity {
    pub kind: IdentityKind,
    /// Id of the mask when one is worn, otherwise of the account.
    pub id: String,
    pub display_name: String,
    pub avatar_ref: String,
    pub signature: Option<String>,
    /// Namespace for everything this identity owns.
    pub storage_scope: StorageScope,
    /// The account underneath any mask.
    pub account: AccountRef,
    /// The worn mask, if any.
    pub mask: Option<Mask>,
}

impl ResolvedIdentity {
    pub fn is_secondary_account(&self) -> bool {
        matches!(self.account, AccountRef::Secondary(_))
    }
}

/// Profile field that was edited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileField {
    Nickname,
    Signature,
    Avatar,
}

/// One profile edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileChange {
    pub field: ProfileField,
    pub old: String,
    pub new: String,
    pub at: DateTime<Utc>,
}

/// Fields to change on an account profile. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub nickname: Option<String>,
    pub avatar_ref: Option<String>,
    pub signature: Option<String>,
}

impl ProfileUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    pub fn avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }

    pub fn signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Registry {
    #[serde(default)]
    main: Profile,
    #[serde(default)]
    accounts: Vec<SecondaryAccount>,
    #[serde(default)]
    masks: Vec<Mask>,
    #[serde(default)]
    current_account: AccountRef,
    #[serde(default)]
    current_mask: Option<String>,
}

impl Registry {
    fn resolve(&self) -> ResolvedIdentity {
        let secondary = match &self.current_account {
            AccountRef::Main => None,
            AccountRef::Secondary(id) => {
                let found = self.accounts.iter().find(|a| &a.id == id);
                if found.is_none() {
                    warn!(account = %id, "current account is missing, using main identity");
                }
                found
            }
        };

        let (account, kind, id, display_name, avatar_ref, signature) = match secondary {
            Some(acc) => (
                AccountRef::Secondary(acc.id.clone()),
                IdentityKind::SecondaryAccount,
                acc.id.clone(),
                acc.display_name.clone(),
                acc.avatar_ref.clone(),
                Some(acc.signature.clone()).filter(|s| !s.is_empty()),
            ),
            None => (
                AccountRef::Main,
                IdentityKind::Main,
                MAIN_IDENTITY_ID.to_string(),
                self.main.nickname.clone(),
                self.main.avatar_ref.clone(),
                self.main.signature.clone(),
            ),
        };

        let mask = self
            .current_mask
            .as_ref()
            .and_then(|id| self.masks.iter().find(|m| &m.id == id))
            .cloned();

        let storage_scope = account.scope();
        match mask {
            Some(mask) => ResolvedIdentity {
                kind: IdentityKind::Mask,
                id: mask.id.clone(),
                display_name: mask.nickname.clone(),
                avatar_ref: mask.avatar_ref.clone(),
                signature: mask.signature.clone().or(signature),
                storage_scope,
                account,
                mask: Some(mask),
            },
            None => ResolvedIdentity {
                kind,
                id,
                display_name,
                avatar_ref,
                signature,
                storage_scope,
                account,
                mask: None,
            },
        }
    }

    fn fall_back_to_main(&mut self) {
        self.current_account = AccountRef::Main;
        self.current_mask = None;
    }

    fn next_account_id(&self, now: DateTime<Utc>) -> String {
        let mut millis = now.timestamp_millis();
        loop {
            let id = format!("sub_{millis}");
            if !self.accounts.iter().any(|a| a.id == id) {
                return id;
            }
            millis += 1;
        }
    }
}

/// Collect the edits an update would make to a profile.
fn diff_profile(
    nickname: &str,
    avatar_ref: &str,
    signature: &str,
    update: &ProfileUpdate,
    at: DateTime<Utc>,
) -> Vec<ProfileChange> {
    let mut changes = Vec::new();
    let mut push = |field, old: &str, new: &Option<String>| {
        if let Some(new) = new {
            if new != old {
                changes.push(ProfileChange {
                    field,
                    old: old.to_string(),
                    new: new.clone(),
                    at,
                });
            }
        }
    };
    push(ProfileField::Nickname, nickname, &update.nickname);
    push(ProfileField::Avatar, avatar_ref, &update.avatar_ref);
    push(ProfileField::Signature, signature, &update.signature);
    changes
}

// ============================================================================
// Resolver
// ============================================================================

/// Resolves and manages the effective identity.
#[derive(Clone)]
pub struct IdentityResolver {
    state: StateStore,
    history_len: usize,
}

impl IdentityResolver {
    pub fn new(state: StateStore, history_len: usize) -> Self {
        Self { state, history_len }
    }

    /// The identity currently in effect.
    pub async fn resolve_current(&self) -> Result<ResolvedIdentity, IdentityError> {
        let (registry, _) = self.load().await?;
        Ok(registry.resolve())
    }

    pub async fn main_profile(&self) -> Result<Profile, IdentityError> {
        Ok(self.load().await?.0.main)
    }

    pub async fn accounts(&self) -> Result<Vec<SecondaryAccount>, IdentityError> {
        Ok(self.load().await?.0.accounts)
    }

    pub async fn masks(&self) -> Result<Vec<Mask>, IdentityError> {
        Ok(self.load().await?.0.masks)
    }

    /// Create a secondary account. It does not become current.
    pub async fn create_account(
        &self,
        display_name: impl Into<String>,
        avatar_ref: impl Into<String>,
    ) -> Result<SecondaryAccount, IdentityError> {
        let (mut registry, version) = self.load().await?;
        let now = Utc::now();
        let account = SecondaryAccount {
            id: registry.next_account_id(now),
            display_name: display_name.into(),
            avatar_ref: avatar_ref.into(),
            signature: String::new(),
            created_at: now,
        };
        registry.accounts.push(account.clone());
        self.commit(registry, version).await?;
        info!(account = %account.id, "created secondary account");
        Ok(account)
    }

    /// Point the session at another account. Data is never moved.
    pub async fn switch_account(&self, account: AccountRef) -> Result<ResolvedIdentity, IdentityError> {
        let (mut registry, version) = self.load().await?;
        if let AccountRef::Secondary(id) = &account {
            if !registry.accounts.iter().any(|a| &a.id == id) {
                return Err(IdentityError::AccountNotFound(id.clone()));
            }
        }
        registry.current_account = account;
        self.commit(registry, version).await
    }

    /// Delete a secondary account, falling back to the main identity first
    /// if it is in use. Its stored data is left in place.
    pub async fn delete_account(&self, id: &str) -> Result<ResolvedIdentity, IdentityError> {
        let (mut registry, version) = self.load().await?;
        let before = registry.accounts.len();
        registry.accounts.retain(|a| a.id != id);
        if registry.accounts.len() == before {
            return Err(IdentityError::AccountNotFound(id.to_string()));
        }
        if registry.current_account == AccountRef::Secondary(id.to_string()) {
            registry.fall_back_to_main();
        }
        self.commit(registry, version).await
    }

    /// Edit a secondary account's profile.
    pub async fn update_account(
        &self,
        id: &str,
        update: ProfileUpdate,
    ) -> Result<SecondaryAccount, IdentityError> {
        let (mut registry, version) = self.load().await?;
        let account = registry
            .accounts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| IdentityError::AccountNotFound(id.to_string()))?;

        let changes = diff_profile(
            &account.display_name,
            &account.avatar_ref,
            &account.signature,
            &update,
            Utc::now(),
        );
        if let Some(name) = update.nickname {
            account.display_name = name;
        }
        if let Some(avatar) = update.avatar_ref {
            account.avatar_ref = avatar;
        }
        if let Some(signature) = update.signature {
            account.signature = signature;
        }
        let updated = account.clone();

        self.commit(registry, version).await?;
        self.record_changes(id, changes).await?;
        Ok(updated)
    }

    /// Edit the main identity's profile.
    pub async fn update_main_profile(&self, update: ProfileUpdate) -> Result<Profile, IdentityError> {
        let (mut registry, version) = self.load().await?;
        let changes = diff_profile(
            &registry.main.nickname,
            &registry.main.avatar_ref,
            registry.main.signature.as_deref().unwrap_or_default(),
            &update,
            Utc::now(),
        );
        if let Some(nickname) = update.nickname {
            registry.main.nickname = nickname;
        }
        if let Some(avatar) = update.avatar_ref {
            registry.main.avatar_ref = avatar;
        }
        if let Some(signature) = update.signature {
            registry.main.signature = Some(signature);
        }
        let profile = registry.main.clone();

        self.commit(registry, version).await?;
        self.record_changes(MAIN_IDENTITY_ID, changes).await?;
        Ok(profile)
    }

    /// Register a mask. It is not worn until [`wear_mask`](Self::wear_mask).
    pub async fn create_mask(&self, mask: Mask) -> Result<Mask, IdentityError> {
        let (mut registry, version) = self.load().await?;
        registry.masks.retain(|m| m.id != mask.id);
        registry.masks.push(mask.clone());
        self.commit(registry, version).await?;
        Ok(mask)
    }

    /// Wear a mask over the current account.
    pub async fn wear_mask(&self, id: &str) -> Result<ResolvedIdentity, IdentityError> {
        let (mut registry, version) = self.load().await?;
        if !registry.masks.iter().any(|m| m.id == id) {
            return Err(IdentityError::MaskNotFound(id.to_string()));
        }
        registry.current_mask = Some(id.to_string());
        self.commit(registry, version).await
    }

    /// Stop wearing any mask.
    pub async fn remove_mask(&self) -> Result<ResolvedIdentity, IdentityError> {
        let (mut registry, version) = self.load().await?;
        registry.current_mask = None;
        self.commit(registry, version).await
    }

    /// Delete a mask, falling back to the main identity first if it is worn.
    pub async fn delete_mask(&self, id: &str) -> Result<ResolvedIdentity, IdentityError> {
        let (mut registry, version) = self.load().await?;
        let before = registry.masks.len();
        registry.masks.retain(|m| m.id != id);
        if registry.masks.len() == before {
            return Err(IdentityError::MaskNotFound(id.to_string()));
        }
        if registry.current_mask.as_deref() == Some(id) {
            registry.fall_back_to_main();
        }
        self.commit(registry, version).await
    }

    /// Profile edits for an identity, oldest first.
    pub async fn profile_history(&self, identity_id: &str) -> Result<Vec<ProfileChange>, IdentityError> {
        Ok(self
            .state
            .load(&StorageScope::global(), &history_key(identity_id))
            .await?)
    }

    async fn load(&self) -> Result<(Registry, Option<u64>), IdentityError> {
        Ok(self
            .state
            .load_versioned(&StorageScope::global(), REGISTRY_KEY)
            .await?)
    }

    async fn commit(
        &self,
        registry: Registry,
        version: Option<u64>,
    ) -> Result<ResolvedIdentity, IdentityError> {
        let previous = match version {
            Some(_) => self.resolve_current().await?,
            None => Registry::default().resolve(),
        };

        let outcome = self
            .state
            .save_if_version(&StorageScope::global(), REGISTRY_KEY, &registry, version)
            .await?;
        if outcome == WriteOutcome::Dropped {
            return Err(IdentityError::NotSaved);
        }

        let current = registry.resolve();
        if current != previous {
            info!(
                from = %previous.id,
                to = %current.id,
                kind = current.kind.name(),
                "identity changed"
            );
            self.state.events().publish(CompanionEvent::IdentityChanged {
                previous_id: previous.id,
                current: current.clone(),
            });
        }
        Ok(current)
    }

    async fn record_changes(
        &self,
        identity_id: &str,
        changes: Vec<ProfileChange>,
    ) -> Result<(), IdentityError> {
        if changes.is_empty() {
            return Ok(());
        }
        let key = history_key(identity_id);
        let scope = StorageScope::global();
        let mut history: Vec<ProfileChange> = self.state.load(&scope, &key).await?;
        history.extend(changes);
        let excess = history.len().saturating_sub(self.history_len);
        history.drain(..excess);

        if !self.state.save(&scope, &key, &history).await?.is_written() {
            warn!(identity = identity_id, "profile history not saved");
        }
        Ok(())
    }
}

fn history_key(identity_id: &str) -> String {
    format!("{HISTORY_KEY_PREFIX}{identity_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::store::InMemoryStore;
    use std::sync::Arc;

    fn resolver() -> IdentityResolver {
        let state = StateStore::new(Arc::new(InMemoryStore::new()), EventBus::default());
        IdentityResolver::new(state, 3)
    }

    #[tokio::test]
    async fn test_default_is_main() {
        let identity = resolver().resolve_current().await.unwrap();
        assert_eq!(identity.kind, IdentityKind::Main);
        assert_eq!(identity.id, MAIN_IDENTITY_ID);
        assert_eq!(identity.storage_scope, StorageScope::new("main"));
        assert_eq!(identity.display_name, DEFAULT_NICKNAME);
    }

    #[tokio::test]
    async fn test_secondary_account_has_own_scope() {
        let resolver = resolver();
        let account = resolver.create_account("Alt", "alt.png").await.unwrap();
        assert!(account.id.starts_with("sub_"));

        let identity = resolver
            .switch_account(AccountRef::Secondary(account.id.clone()))
            .await
            .unwrap();
        assert_eq!(identity.kind, IdentityKind::SecondaryAccount);
        assert_eq!(identity.storage_scope, StorageScope::new(account.id.as_str()));
        assert_eq!(identity.display_name, "Alt");
    }

    #[tokio::test]
    async fn test_mask_shares_account_scope() {
        let resolver = resolver();
        let mask = resolver
            .create_mask(Mask::new("Moonlight", "moon.png").with_persona("a shy poet"))
            .await
            .unwrap();
        let identity = resolver.wear_mask(&mask.id).await.unwrap();

        assert_eq!(identity.kind, IdentityKind::Mask);
        assert_eq!(identity.display_name, "Moonlight");
        assert_eq!(identity.storage_scope, StorageScope::new("main"));
        assert_eq!(identity.mask.unwrap().persona.as_deref(), Some("a shy poet"));
    }

    #[tokio::test]
    async fn test_deleting_current_account_falls_back() {
        let resolver = resolver();
        let account = resolver.create_account("Alt", "").await.unwrap();
        resolver
            .switch_account(AccountRef::Secondary(account.id.clone()))
            .await
            .unwrap();

        let identity = resolver.delete_account(&account.id).await.unwrap();
        assert_eq!(identity.kind, IdentityKind::Main);
        assert!(resolver.accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_deleting_worn_mask_falls_back() {
        let resolver = resolver();
        let mask = resolver.create_mask(Mask::new("M", "")).await.unwrap();
        resolver.wear_mask(&mask.id).await.unwrap();

        let identity = resolver.delete_mask(&mask.id).await.unwrap();
        assert_eq!(identity.kind, IdentityKind::Main);
        assert!(matches!(
            resolver.wear_mask(&mask.id).await,
            Err(IdentityError::MaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_switch_to_unknown_account_fails() {
        let err = resolver()
            .switch_account(AccountRef::Secondary("sub_0".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::AccountNotFound(_)));
    }

    #[tokio::test]
    async fn test_switch_emits_change() {
        let resolver = resolver();
        let mut rx = resolver.state.events().subscribe();
        let account = resolver.create_account("Alt", "").await.unwrap();
        resolver
            .switch_account(AccountRef::Secondary(account.id.clone()))
            .await
            .unwrap();

        match rx.try_recv().unwrap() {
            CompanionEvent::IdentityChanged { previous_id, current } => {
                assert_eq!(previous_id, MAIN_IDENTITY_ID);
                assert_eq!(current.id, account.id);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_profile_history_is_bounded() {
        let resolver = resolver();
        for name in ["a", "b", "c", "d"] {
            resolver
                .update_main_profile(ProfileUpdate::new().nickname(name))
                .await
                .unwrap();
        }
        let history = resolver.profile_history(MAIN_IDENTITY_ID).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].old, "a");
        assert_eq!(history[2].new, "d");
        assert!(history.iter().all(|c| c.field == ProfileField::Nickname));
    }

    #[tokio::test]
    async fn test_unchanged_fields_not_recorded() {
        let resolver = resolver();
        resolver
            .update_main_profile(ProfileUpdate::new().nickname(DEFAULT_NICKNAME).signature("hi"))
            .await
            .unwrap();
        let history = resolver.profile_history(MAIN_IDENTITY_ID).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].field, ProfileField::Signature);
    }
}
