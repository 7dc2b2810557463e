//! The language-model call, behind a trait.

use async_trait::async_trait;
use chat_client::{ChatClient, Message, Request};
use thiserror::Error;

/// Errors from a transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Chat API error: {0}")]
    Client(#[from] chat_client::Error),

    #[error("Transport error: {0}")]
    Other(String),
}

/// Sends a prompt and conversation to a language model.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, system_prompt: &str, messages: &[Message])
        -> Result<String, TransportError>;
}

/// Settings applied to every request a [`ChatTransport`] makes.
#[derive(Clone)]
pub struct ChatTransport {
    client: ChatClient,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
}

impl ChatTransport {
    pub fn new(client: ChatClient) -> Self {
        Self {
            client,
            max_tokens: None,
            temperature: Some(0.8),
        }
    }

    /// Create from `COMPANION_API_KEY` and friends.
    pub fn from_env() -> Result<Self, TransportError> {
        Ok(Self::new(ChatClient::from_env()?))
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn client(&self) -> &ChatClient {
        &self.client
    }
}

#[async_trait]
impl Transport for ChatTransport {
    async fn send(
        &self,
        system_prompt: &str,
        messages: &[Message],
    ) -> Result<String, TransportError> {
        let mut request = Request::new(messages.to_vec()).with_system(system_prompt);
        if let Some(max_tokens) = self.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        Ok(self.client.complete(request).await?.text)
    }
}
