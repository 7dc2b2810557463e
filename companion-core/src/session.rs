//! CompanionSession - the primary public API for a chat turn.
//!
//! A session owns the storage handle, the context assembler, and the model
//! transport. Each call to [`CompanionSession::take_turn`] assembles context
//! for the current identity, sends the conversation to the model, and keeps
//! a bounded transcript of the exchange.

use crate::config::CompanionConfig;
use crate::context::{AssembledContext, ContextAssembler, ContextError};
use crate::events::EventBus;
use crate::identity::{IdentityError, IdentityResolver, ResolvedIdentity};
use crate::message::{Message, MessageKind};
use crate::relationship::{CoupleContent, ListeningTracker, RelationshipBook};
use crate::store::{InMemoryStore, SqliteStore, StateStore, StorageScope, StoreError, WriteOutcome};
use crate::transport::{Transport, TransportError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

const BASE_PROMPT: &str = include_str!("prompts/companion_base.txt");

/// Errors from CompanionSession operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Context error: {0}")]
    Context(#[from] ContextError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Empty message")]
    EmptyMessage,
}

/// The character on the other side of the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Persona {
    /// Stable character id used to index memories and relationship state.
    pub character_id: String,
    /// Display name.
    pub name: String,
    /// Character card: personality, background, speaking style.
    pub prompt: String,
}

impl Persona {
    pub fn new(
        character_id: impl Into<String>,
        name: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            character_id: character_id.into(),
            name: name.into(),
            prompt: prompt.into(),
        }
    }
}

/// Result of one turn.
#[derive(Debug, Clone)]
pub struct TurnResponse {
    /// The character's reply.
    pub reply: String,
    /// The context the reply was generated with.
    pub context: AssembledContext,
}

/// One stored exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptTurn {
    pub user: String,
    pub reply: String,
    pub at: DateTime<Utc>,
}

/// A chat session with persona characters.
///
/// Cheap to clone; clones share storage and transport.
#[derive(Clone)]
pub struct CompanionSession {
    state: StateStore,
    assembler: ContextAssembler,
    transport: Arc<dyn Transport>,
    transcript_limit: usize,
}

impl CompanionSession {
    /// Create a session over an existing state store.
    pub fn new(state: StateStore, transport: Arc<dyn Transport>, config: &CompanionConfig) -> Self {
        Self {
            assembler: ContextAssembler::new(state.clone(), config),
            state,
            transport,
            transcript_limit: config.transcript_limit,
        }
    }

    /// Open the backend named by `config` and create a session on it.
    ///
    /// Uses SQLite when `sqlite_path` is set, memory otherwise.
    pub fn open(config: &CompanionConfig, transport: Arc<dyn Transport>) -> Result<Self, SessionError> {
        let state = open_state(config)?;
        Ok(Self::new(state, transport, config))
    }

    /// Replace the context assembler, e.g. to install custom trigger rules.
    pub fn with_assembler(mut self, assembler: ContextAssembler) -> Self {
        self.assembler = assembler;
        self
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn events(&self) -> &EventBus {
        self.state.events()
    }

    pub fn assembler(&self) -> &ContextAssembler {
        &self.assembler
    }

    pub fn identity(&self) -> &IdentityResolver {
        self.assembler.identity()
    }

    pub async fn current_identity(&self) -> Result<ResolvedIdentity, SessionError> {
        Ok(self.identity().resolve_current().await?)
    }

    /// The relationship book of the current identity.
    pub async fn relationships(&self) -> Result<RelationshipBook, SessionError> {
        let identity = self.current_identity().await?;
        Ok(RelationshipBook::for_identity(self.state.clone(), &identity))
    }

    /// Couple-space content of the current identity.
    pub async fn couple_content(&self) -> Result<CoupleContent, SessionError> {
        let identity = self.current_identity().await?;
        Ok(CoupleContent::new(self.state.clone(), identity.storage_scope))
    }

    pub async fn listening(&self) -> Result<ListeningTracker, SessionError> {
        let identity = self.current_identity().await?;
        Ok(ListeningTracker::new(self.state.clone(), identity.storage_scope))
    }

    /// Send a user message and get the character's reply.
    ///
    /// `history` is the conversation so far, oldest first, not including
    /// `user_text`.
    pub async fn take_turn(
        &self,
        persona: &Persona,
        history: &[Message],
        user_text: &str,
    ) -> Result<TurnResponse, SessionError> {
        self.take_turn_at(persona, history, user_text, Utc::now())
            .await
    }

    /// Take a turn as of `now`.
    pub async fn take_turn_at(
        &self,
        persona: &Persona,
        history: &[Message],
        user_text: &str,
        now: DateTime<Utc>,
    ) -> Result<TurnResponse, SessionError> {
        let user_text = user_text.trim();
        if user_text.is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let mut turn = history.to_vec();
        turn.push(Message::sent(user_text).at(now));

        // The transcript goes to the scope the context was built from, even
        // if the account changes while the reply is in flight.
        let identity = self.current_identity().await?;
        let context = self
            .assembler
            .assemble_for(&identity, &persona.character_id, &turn, now)
            .await?;
        let system_prompt = build_system_prompt(persona, &context);
        let messages = to_chat_messages(&turn);

        let reply = self.transport.send(&system_prompt, &messages).await?;
        info!(
            character = %persona.character_id,
            sections = context.sections().len(),
            "turn complete"
        );

        self.record_turn(
            &identity.storage_scope,
            &persona.character_id,
            TranscriptTurn {
                user: user_text.to_string(),
                reply: reply.clone(),
                at: now,
            },
        )
        .await?;

        Ok(TurnResponse { reply, context })
    }

    /// Stored exchanges with a character, oldest first.
    pub async fn transcript(&self, character_id: &str) -> Result<Vec<TranscriptTurn>, SessionError> {
        let identity = self.current_identity().await?;
        Ok(self
            .state
            .load(&identity.storage_scope, &transcript_key(character_id))
            .await?)
    }

    async fn record_turn(
        &self,
        scope: &StorageScope,
        character_id: &str,
        turn: TranscriptTurn,
    ) -> Result<(), SessionError> {
        if self.transcript_limit == 0 {
            return Ok(());
        }
        let key = transcript_key(character_id);

        let mut turns: Vec<TranscriptTurn> = self.state.load(scope, &key).await?;
        turns.push(turn);
        if turns.len() > self.transcript_limit {
            let excess = turns.len() - self.transcript_limit;
            turns.drain(..excess);
        }

        if let WriteOutcome::Dropped = self.state.save(scope, &key, &turns).await? {
            warn!(character = character_id, "transcript not saved, storage full");
        }
        Ok(())
    }
}

fn open_state(config: &CompanionConfig) -> Result<StateStore, StoreError> {
    let backend: Arc<dyn crate::store::Store> = match &config.sqlite_path {
        Some(path) => Arc::new(SqliteStore::open(path, &config.store)?),
        None => Arc::new(InMemoryStore::with_config(&config.store)),
    };
    Ok(StateStore::new(backend, EventBus::default()).with_op_timeout(config.store.op_timeout))
}

fn transcript_key(character_id: &str) -> String {
    format!("transcript:{character_id}")
}

/// Base instructions, then the character card, then the turn context.
pub fn build_system_prompt(persona: &Persona, context: &AssembledContext) -> String {
    let mut prompt = String::from(BASE_PROMPT.trim_end());
    prompt.push_str("\n\n## You Are ");
    prompt.push_str(&persona.name);
    prompt.push('\n');
    prompt.push_str(persona.prompt.trim());
    if !context.is_empty() {
        prompt.push_str("\n\n");
        prompt.push_str(context.render().trim_end());
    }
    prompt.push('\n');
    prompt
}

/// Convert chat history into model messages.
///
/// Sent messages become user turns, received ones assistant turns. System
/// messages and messages with no text are skipped; feature cards speak
/// through their model-readable text when they have one.
pub fn to_chat_messages(history: &[Message]) -> Vec<chat_client::Message> {
    history
        .iter()
        .filter_map(|m| {
            let text = m
                .ai_readable
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| m.text());
            if text.is_empty() {
                return None;
            }
            match m.kind {
                MessageKind::Sent => Some(chat_client::Message::user(text)),
                MessageKind::Received => Some(chat_client::Message::assistant(text)),
                MessageKind::System => None,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::AccountRef;
    use async_trait::async_trait;
    use chat_client::Role;

    #[test]
    fn test_chat_messages_roles() {
        let history = vec![
            Message::sent("hi"),
            Message::received("hey you"),
            Message::system("call ended"),
            Message::sent("   "),
        ];
        let messages = to_chat_messages(&history);
        let roles: Vec<_> = messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
        assert_eq!(messages[1].content, "hey you");
    }

    #[test]
    fn test_ai_readable_preferred() {
        let history = vec![Message::sent("[card]").with_ai_readable("The user sent you 20.00")];
        let messages = to_chat_messages(&history);
        assert_eq!(messages[0].content, "The user sent you 20.00");
    }

    #[test]
    fn test_system_prompt_layout() {
        let persona = Persona::new("c1", "Lin", "A quiet barista.");
        let prompt = build_system_prompt(&persona, &AssembledContext::default());
        assert!(prompt.starts_with("You are a character"));
        assert!(prompt.contains("## You Are Lin\nA quiet barista."));
        assert!(prompt.ends_with("barista.\n"));
    }

    #[test]
    fn test_transcript_key() {
        assert_eq!(transcript_key("c1"), "transcript:c1");
    }

    /// Switches the active account while the reply is being produced.
    struct SwitchingTransport {
        identity: IdentityResolver,
        account: AccountRef,
    }

    #[async_trait]
    impl Transport for SwitchingTransport {
        async fn send(
            &self,
            _system_prompt: &str,
            _messages: &[chat_client::Message],
        ) -> Result<String, TransportError> {
            self.identity
                .switch_account(self.account.clone())
                .await
                .unwrap();
            Ok("one sec".to_string())
        }
    }

    #[tokio::test]
    async fn test_transcript_stays_with_turn_identity() {
        let state = StateStore::new(Arc::new(InMemoryStore::new()), EventBus::default());
        let identity = IdentityResolver::new(state.clone(), 10);
        let main_scope = identity.resolve_current().await.unwrap().storage_scope;
        let account = identity.create_account("Night Owl", "owl.png").await.unwrap();

        let transport = SwitchingTransport {
            identity: identity.clone(),
            account: AccountRef::Secondary(account.id.clone()),
        };
        let session = CompanionSession::new(state.clone(), Arc::new(transport), &CompanionConfig::default());
        let persona = Persona::new("c1", "Lin", "A quiet barista.");
        session.take_turn(&persona, &[], "hi").await.unwrap();

        assert!(session.current_identity().await.unwrap().is_secondary_account());
        assert!(session.transcript("c1").await.unwrap().is_empty());

        let main: Vec<TranscriptTurn> = state.load(&main_scope, &transcript_key("c1")).await.unwrap();
        assert_eq!(main.len(), 1);
        assert_eq!(main[0].reply, "one sec");
    }
}
