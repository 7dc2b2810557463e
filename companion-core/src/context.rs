//! Per-turn context assembly.
//!
//! Before every model call the assembler decides what the character should
//! know right now: who the user appears to be, what the two of them have been
//! through, what is going on between them, which feature cards await an
//! answer, and which nudges apply to the latest messages.
//!
//! Sections are built independently from stored state, then emitted in a
//! fixed order. A section with nothing to say is left out.

use crate::config::CompanionConfig;
use crate::identity::{IdentityError, IdentityResolver, ResolvedIdentity};
use crate::memory::{MemoryError, MemoryStore, RetrievedMemory};
use crate::message::Message;
use crate::relationship::listening::format_elapsed;
use crate::relationship::{
    ContentSummary, CoupleContent, ListeningSession, ListeningTracker, RelationshipBook,
    RelationshipError, RelationshipSlot, RelationshipStatus, Sender,
};
use crate::store::{StateStore, StoreError};
use crate::triggers::{Advisory, AdvisoryClass, Observation, TriggerEvaluator};
use chrono::{DateTime, Duration, Utc};
use std::fmt::Write as _;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors from context assembly.
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Relationship error: {0}")]
    Relationship(#[from] RelationshipError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
}

/// Context sections, in the order they are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectionKind {
    Identity,
    Memory,
    WorldState,
    FeatureStatus,
    Nudges,
}

impl SectionKind {
    pub fn heading(&self) -> &'static str {
        match self {
            SectionKind::Identity => "Who you are talking to",
            SectionKind::Memory => "Memories",
            SectionKind::WorldState => "Current situation",
            SectionKind::FeatureStatus => "Waiting on you",
            SectionKind::Nudges => "Reminders",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub kind: SectionKind,
    pub body: String,
}

/// The context for one turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssembledContext {
    sections: Vec<Section>,
}

impl AssembledContext {
    fn push(&mut self, kind: SectionKind, body: String) {
        let body = body.trim().to_string();
        if !body.is_empty() {
            self.sections.push(Section { kind, body });
        }
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn section(&self, kind: SectionKind) -> Option<&str> {
        self.sections
            .iter()
            .find(|s| s.kind == kind)
            .map(|s| s.body.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Render as markdown, one `##` heading per section.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, section) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            let _ = writeln!(out, "## {}\n{}", section.kind.heading(), section.body);
        }
        out
    }
}

/// Builds the context block for a `(character, history)` pair.
#[derive(Clone)]
pub struct ContextAssembler {
    state: StateStore,
    identity: IdentityResolver,
    memory: Arc<MemoryStore>,
    triggers: TriggerEvaluator,
    memory_limit: usize,
    song_change_window: Duration,
}

impl ContextAssembler {
    pub fn new(state: StateStore, config: &CompanionConfig) -> Self {
        let song_change_window =
            Duration::from_std(config.song_change_window).unwrap_or_else(|_| Duration::seconds(30));
        Self {
            identity: IdentityResolver::new(state.clone(), config.profile_history_len),
            memory: Arc::new(MemoryStore::new(
                state.clone(),
                &config.ranking,
                config.summary_cap,
            )),
            triggers: TriggerEvaluator::with_default_rules(state.clone()),
            state,
            memory_limit: config.memory_limit,
            song_change_window,
        }
    }

    /// Replace the trigger table.
    pub fn with_triggers(mut self, triggers: TriggerEvaluator) -> Self {
        self.triggers = triggers;
        self
    }

    /// Replace the memory store, e.g. to use a custom ranking policy.
    pub fn with_memory(mut self, memory: MemoryStore) -> Self {
        self.memory = Arc::new(memory);
        self
    }

    pub fn identity(&self) -> &IdentityResolver {
        &self.identity
    }

    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    pub async fn assemble(
        &self,
        character_id: &str,
        history: &[Message],
    ) -> Result<AssembledContext, ContextError> {
        self.assemble_at(character_id, history, Utc::now()).await
    }

    /// Assemble as of `now`.
    pub async fn assemble_at(
        &self,
        character_id: &str,
        history: &[Message],
        now: DateTime<Utc>,
    ) -> Result<AssembledContext, ContextError> {
        let identity = self.identity.resolve_current().await?;
        self.assemble_for(&identity, character_id, history, now).await
    }

    /// Assemble for an identity the caller already resolved.
    pub async fn assemble_for(
        &self,
        identity: &ResolvedIdentity,
        character_id: &str,
        history: &[Message],
        now: DateTime<Utc>,
    ) -> Result<AssembledContext, ContextError> {
        let scope = identity.storage_scope.clone();

        let book = RelationshipBook::for_identity(self.state.clone(), identity);
        let listening = ListeningTracker::new(self.state.clone(), scope.clone());
        let content = CoupleContent::new(self.state.clone(), scope.clone());

        let (slot, memories, session, summary) = futures::join!(
            book.view(),
            self.memory.retrieve(&scope, character_id, self.memory_limit),
            listening.current(),
            content.summary(character_id)
        );
        let slot = slot?.slot;
        let memories = memories?;
        let session = session?;
        let summary = summary?;

        let observation = Observation {
            character_id: character_id.to_string(),
            nickname: Some(identity.display_name.clone()),
            last_outcome: slot.last_outcome.clone(),
        };
        let advisories = self
            .triggers
            .evaluate(&scope, history, &observation, now)
            .await?;

        let mut context = AssembledContext::default();
        context.push(SectionKind::Identity, identity_section(identity, history, now));
        context.push(SectionKind::Memory, memory_section(identity, &memories));
        context.push(
            SectionKind::WorldState,
            world_section(
                character_id,
                identity,
                &slot,
                &summary,
                session.as_ref(),
                now,
                self.song_change_window,
            ),
        );
        context.push(
            SectionKind::FeatureStatus,
            advisory_section(&advisories, AdvisoryClass::FeatureStatus),
        );
        context.push(
            SectionKind::Nudges,
            advisory_section(&advisories, AdvisoryClass::Nudge),
        );

        debug!(
            character = character_id,
            identity = %identity.id,
            memories = memories.len(),
            advisories = advisories.len(),
            sections = context.sections.len(),
            "context assembled"
        );
        Ok(context)
    }
}

// ============================================================================
// Sections
// ============================================================================

fn identity_section(identity: &ResolvedIdentity, history: &[Message], now: DateTime<Utc>) -> String {
    let mut out = format!("The user appears to you as \"{}\".\n", identity.display_name);

    if let Some(mask) = &identity.mask {
        if let Some(real_name) = &mask.real_name {
            let _ = writeln!(out, "Their name in this persona is {real_name}.");
        }
        if let Some(description) = &mask.description {
            let _ = writeln!(out, "About them: {description}");
        }
        if let Some(persona) = &mask.persona {
            let _ = writeln!(out, "They are playing this persona: {persona}");
        }
    }
    if let Some(signature) = identity.signature.as_deref().filter(|s| !s.is_empty()) {
        let _ = writeln!(out, "Their signature reads: \"{signature}\"");
    }
    if identity.is_secondary_account() {
        out.push_str(
            "This is an account you have never seen before. Treat the user as a stranger you just met; you share no history with them.\n",
        );
    }
    if let Some(elapsed) = time_since_previous(history, now) {
        let _ = writeln!(out, "Time since the user's previous message: {elapsed}.");
    }
    out
}

/// How long ago the user's previous message was sent.
///
/// Measured from the second-to-last sent message so the gap before the
/// message being answered is what shows.
pub fn time_since_previous(history: &[Message], now: DateTime<Utc>) -> Option<String> {
    let stamps: Vec<DateTime<Utc>> = history
        .iter()
        .filter(|m| m.is_sent())
        .filter_map(|m| m.timestamp)
        .collect();
    let target = match stamps.len() {
        0 => return None,
        1 => stamps[0],
        n => stamps[n - 2],
    };

    let diff = now - target;
    let label = if diff < Duration::minutes(1) {
        "just now".to_string()
    } else if diff < Duration::hours(1) {
        plural(diff.num_minutes(), "minute")
    } else if diff < Duration::days(1) {
        plural(diff.num_hours(), "hour")
    } else {
        plural(diff.num_days(), "day")
    };
    Some(label)
}

fn plural(n: i64, unit: &str) -> String {
    if n == 1 {
        format!("1 {unit}")
    } else {
        format!("{n} {unit}s")
    }
}

fn memory_section(identity: &ResolvedIdentity, memories: &[RetrievedMemory]) -> String {
    if memories.is_empty() {
        return String::new();
    }
    let mut out = format!(
        "Recent moments between you and {}, for continuity:\n",
        identity.display_name
    );
    for memory in memories {
        let _ = writeln!(out, "- {}: {}", memory.date_label, memory.summary);
    }
    out
}

fn world_section(
    character_id: &str,
    identity: &ResolvedIdentity,
    slot: &RelationshipSlot,
    summary: &ContentSummary,
    session: Option<&ListeningSession>,
    now: DateTime<Utc>,
    song_change_window: Duration,
) -> String {
    let mut parts = Vec::new();
    if let Some(couple) = couple_block(character_id, slot, summary, now) {
        parts.push(couple);
    }
    if let Some(session) = session.filter(|s| s.character_id == character_id) {
        parts.push(listening_block(identity, session, now, song_change_window));
    }
    parts.join("\n\n")
}

fn couple_block(
    character_id: &str,
    slot: &RelationshipSlot,
    summary: &ContentSummary,
    now: DateTime<Utc>,
) -> Option<String> {
    let invite_hint =
        "Couple space: you don't have one yet. You may invite the user if it fits your relationship.";

    let Some(record) = &slot.relationship else {
        return Some(invite_hint.to_string());
    };
    let this_character = record.character_id == character_id;

    match record.status {
        RelationshipStatus::Active if this_character => {
            let mut out = String::from(
                "You and the user share a couple space. You can post photos, leave notes on the message board, and add anniversaries.",
            );
            if !summary.is_empty() {
                out.push('\n');
                out.push_str(summary.render(now.date_naive()).trim_end());
            }
            Some(out)
        }
        // Bonded with someone else.
        RelationshipStatus::Active => None,
        RelationshipStatus::Pending if this_character => Some(match record.sender {
            Sender::Character => {
                "Couple space: you invited the user and are waiting for their answer.".to_string()
            }
            Sender::User => {
                "Couple space: the user invited you and is waiting for your answer.".to_string()
            }
        }),
        _ => Some(invite_hint.to_string()),
    }
}

fn listening_block(
    identity: &ResolvedIdentity,
    session: &ListeningSession,
    now: DateTime<Utc>,
    window: Duration,
) -> String {
    let mut out = format!(
        "You are listening to music together with {}.\nNow playing: \"{}\" by {}.\nListening together for {}.",
        identity.display_name,
        session.song_title,
        session.song_artist,
        format_elapsed(session.elapsed(now)),
    );
    if session.user_just_changed(now, window) {
        let ago = (now - session.changed_at).num_seconds().max(0);
        let _ = write!(
            out,
            "\n{} switched to this song {ago}s ago; you might react to their choice.",
            identity.display_name
        );
    }
    out
}

fn advisory_section(advisories: &[Advisory], class: AdvisoryClass) -> String {
    advisories
        .iter()
        .filter(|a| a.class == class)
        .map(|a| a.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
