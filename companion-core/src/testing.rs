//! Testing utilities for companion sessions.
//!
//! This module provides tools for integration testing:
//! - `MockTransport` for deterministic testing without API calls
//! - `TestHarness` for scripted conversations against in-memory storage
//! - Assertion helpers for verifying assembled context

use crate::config::CompanionConfig;
use crate::context::{AssembledContext, SectionKind};
use crate::memory::MemoryRecord;
use crate::message::Message;
use crate::session::{CompanionSession, Persona, SessionError, TurnResponse};
use crate::store::StateStore;
use crate::transport::{Transport, TransportError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Reply used once the script runs out.
pub const UNSCRIPTED_REPLY: &str = "(no scripted reply)";

/// A model call captured by [`MockTransport`].
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system_prompt: String,
    pub messages: Vec<chat_client::Message>,
}

#[derive(Debug, Default)]
struct MockState {
    replies: VecDeque<String>,
    calls: Vec<RecordedCall>,
    fail_next: Option<String>,
}

/// A transport that returns scripted replies and records every call.
///
/// Clones share the same script and call log.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new(replies: Vec<String>) -> Self {
        let transport = Self::default();
        for reply in replies {
            transport.queue_reply(reply);
        }
        transport
    }

    /// Add a reply to the end of the script.
    pub fn queue_reply(&self, reply: impl Into<String>) {
        self.lock().replies.push_back(reply.into());
    }

    /// Make the next call fail with `message`.
    pub fn fail_next(&self, message: impl Into<String>) {
        self.lock().fail_next = Some(message.into());
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.lock().calls.clone()
    }

    pub fn last_call(&self) -> Option<RecordedCall> {
        self.lock().calls.last().cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        // A poisoned lock only means another test thread panicked.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(
        &self,
        system_prompt: &str,
        messages: &[chat_client::Message],
    ) -> Result<String, TransportError> {
        let mut state = self.lock();
        state.calls.push(RecordedCall {
            system_prompt: system_prompt.to_string(),
            messages: messages.to_vec(),
        });
        if let Some(message) = state.fail_next.take() {
            return Err(TransportError::Other(message));
        }
        Ok(state
            .replies
            .pop_front()
            .unwrap_or_else(|| UNSCRIPTED_REPLY.to_string()))
    }
}

/// Test harness for running conversation scenarios.
///
/// Keeps its own clock, starting at a fixed instant and advancing one
/// minute per turn, so time-dependent context is reproducible.
pub struct TestHarness {
    /// The session under test, on in-memory storage.
    pub session: CompanionSession,
    /// The transport behind the session.
    pub transport: MockTransport,
    /// The character being talked to.
    pub persona: Persona,
    /// Conversation so far, oldest first.
    pub history: Vec<Message>,
    /// The harness clock.
    pub now: DateTime<Utc>,
}

impl TestHarness {
    /// Create a harness with default configuration.
    pub fn new() -> Self {
        Self::with_config(CompanionConfig::default())
    }

    /// Create a harness with custom configuration. Any `sqlite_path` is
    /// honored, so a harness can run over a temporary database.
    pub fn with_config(config: CompanionConfig) -> Self {
        let transport = MockTransport::default();
        let session = match CompanionSession::open(&config, Arc::new(transport.clone())) {
            Ok(session) => session,
            Err(e) => panic!("failed to open test session: {e}"),
        };
        Self {
            session,
            transport,
            persona: Persona::new("char-1", "Lin", "A warm, teasing barista who remembers everything."),
            history: Vec::new(),
            now: Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 0).single().unwrap_or_default(),
        }
    }

    pub fn with_persona(mut self, persona: Persona) -> Self {
        self.persona = persona;
        self
    }

    pub fn state(&self) -> &StateStore {
        self.session.state()
    }

    pub fn character_id(&self) -> &str {
        &self.persona.character_id
    }

    /// Queue the next reply.
    pub fn expect_reply(&mut self, text: impl Into<String>) -> &mut Self {
        self.transport.queue_reply(text);
        self
    }

    pub fn advance(&mut self, by: Duration) -> &mut Self {
        self.now += by;
        self
    }

    /// Append a message to the history without taking a turn.
    pub fn push(&mut self, message: Message) -> &mut Self {
        let message = match message.timestamp {
            Some(_) => message,
            None => message.at(self.now),
        };
        self.history.push(message);
        self
    }

    /// Take a turn, then record both sides in the history.
    pub async fn say(&mut self, text: &str) -> Result<TurnResponse, SessionError> {
        let response = self
            .session
            .take_turn_at(&self.persona, &self.history, text, self.now)
            .await?;
        self.history.push(Message::sent(text).at(self.now));
        self.history
            .push(Message::received(response.reply.clone()).at(self.now));
        self.now += Duration::minutes(1);
        Ok(response)
    }

    /// Assemble context for the current history without calling the model.
    pub async fn peek(&self) -> Result<AssembledContext, SessionError> {
        Ok(self
            .session
            .assembler()
            .assemble_at(&self.persona.character_id, &self.history, self.now)
            .await?)
    }

    /// Store a memory about the current character for the current identity.
    pub async fn remember(&self, record: MemoryRecord) -> Result<(), SessionError> {
        let identity = self.session.current_identity().await?;
        self.session
            .assembler()
            .memory()
            .append(&identity.storage_scope, &record)
            .await
            .map_err(crate::context::ContextError::from)?;
        Ok(())
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.transport.last_call().map(|c| c.system_prompt)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert that a section exists and contains `needle`.
#[track_caller]
pub fn assert_section_contains(context: &AssembledContext, kind: SectionKind, needle: &str) {
    match context.section(kind) {
        Some(body) => assert!(
            body.contains(needle),
            "Expected {kind:?} section to contain {needle:?}, got:\n{body}"
        ),
        None => panic!(
            "Expected a {kind:?} section containing {needle:?}, got:\n{}",
            context.render()
        ),
    }
}

/// Assert that a section is absent.
#[track_caller]
pub fn assert_no_section(context: &AssembledContext, kind: SectionKind) {
    if let Some(body) = context.section(kind) {
        panic!("Expected no {kind:?} section, got:\n{body}");
    }
}

/// Assert that the rendered context does not mention `needle`.
#[track_caller]
pub fn assert_not_mentioned(context: &AssembledContext, needle: &str) {
    let rendered = context.render();
    assert!(
        !rendered.contains(needle),
        "Expected context not to mention {needle:?}, got:\n{rendered}"
    );
}

/// Assert that the last system prompt sent contains `needle`.
#[track_caller]
pub fn assert_prompt_contains(harness: &TestHarness, needle: &str) {
    let prompt = harness.last_prompt().unwrap_or_default();
    assert!(
        prompt.contains(needle),
        "Expected system prompt to contain {needle:?}, got:\n{prompt}"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDomain;

    #[tokio::test]
    async fn test_mock_transport_script() {
        let transport = MockTransport::new(vec!["one".into(), "two".into()]);
        let a = transport.send("sys", &[]).await.unwrap();
        let b = transport.send("sys", &[]).await.unwrap();
        let c = transport.send("sys", &[]).await.unwrap();
        assert_eq!((a.as_str(), b.as_str(), c.as_str()), ("one", "two", UNSCRIPTED_REPLY));
        assert_eq!(transport.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_mock_transport_failure() {
        let transport = MockTransport::default();
        transport.fail_next("boom");
        assert!(transport.send("sys", &[]).await.is_err());
        assert!(transport.send("sys", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_harness_turn() {
        let mut harness = TestHarness::new();
        harness.expect_reply("hey, you're up late");

        let response = harness.say("hi").await.unwrap();
        assert_eq!(response.reply, "hey, you're up late");
        assert_eq!(harness.history.len(), 2);
        assert_section_contains(&response.context, SectionKind::Identity, "User");
        assert_prompt_contains(&harness, "## You Are Lin");

        let call = harness.transport.last_call().unwrap();
        assert_eq!(call.messages.len(), 1);
        assert_eq!(call.messages[0].content, "hi");
    }

    #[tokio::test]
    async fn test_harness_memory() {
        let harness = TestHarness::new();
        harness
            .remember(MemoryRecord::new(
                harness.character_id(),
                MemoryDomain::Chat,
                "Exam",
                "User has a physics exam on Friday",
            ))
            .await
            .unwrap();

        let context = harness.peek().await.unwrap();
        assert_section_contains(&context, SectionKind::Memory, "physics exam");
    }
}
