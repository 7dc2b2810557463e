//! Chat messages as seen by the engine.
//!
//! The engine only reads message history; it never edits or reorders it.
//! Feature cards (transfers, invites, payment requests) arrive as a typed
//! payload next to the text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side of the conversation produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Written by the user.
    Sent,
    /// Written by the character.
    Received,
    /// Generated by the application (call logs, notices).
    System,
}

/// Response state of an interactive feature card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub name: String,
    pub quantity: u32,
}

/// A feature card attached to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeaturePayload {
    Transfer {
        amount: f64,
        #[serde(default)]
        note: String,
        #[serde(default)]
        status: FeatureStatus,
    },
    PaymentRequest {
        item_name: String,
        amount: f64,
        #[serde(default)]
        status: FeatureStatus,
    },
    CartPaymentRequest {
        items: Vec<CartItem>,
        total_amount: f64,
        #[serde(default)]
        status: FeatureStatus,
    },
    IntimatePay {
        monthly_limit: f64,
        #[serde(default)]
        status: FeatureStatus,
    },
    CoupleSpaceInvite {
        #[serde(default)]
        status: FeatureStatus,
    },
    MusicInvite {
        song_title: String,
        song_artist: String,
        #[serde(default)]
        status: FeatureStatus,
    },
    /// The user asks the character to argue their side of a dispute.
    JudgmentRequest { user_reason: String },
    JudgmentResponse { content: String },
}

impl FeaturePayload {
    /// Response state, for cards that have one.
    pub fn status(&self) -> Option<FeatureStatus> {
        match self {
            FeaturePayload::Transfer { status, .. }
            | FeaturePayload::PaymentRequest { status, .. }
            | FeaturePayload::CartPaymentRequest { status, .. }
            | FeaturePayload::IntimatePay { status, .. }
            | FeaturePayload::CoupleSpaceInvite { status }
            | FeaturePayload::MusicInvite { status, .. } => Some(*status),
            FeaturePayload::JudgmentRequest { .. } | FeaturePayload::JudgmentResponse { .. } => {
                None
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status() == Some(FeatureStatus::Pending)
    }
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub payload: Option<FeaturePayload>,
    /// Text describing the message for the model when `content` is not enough.
    #[serde(default)]
    pub ai_readable: Option<String>,
}

impl Message {
    pub fn new(kind: MessageKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            timestamp: None,
            payload: None,
            ai_readable: None,
        }
    }

    pub fn sent(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Sent, content)
    }

    pub fn received(content: impl Into<String>) -> Self {
        Self::new(MessageKind::Received, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageKind::System, content)
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_payload(mut self, payload: FeaturePayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_ai_readable(mut self, text: impl Into<String>) -> Self {
        self.ai_readable = Some(text.into());
        self
    }

    pub fn is_sent(&self) -> bool {
        self.kind == MessageKind::Sent
    }

    pub fn is_received(&self) -> bool {
        self.kind == MessageKind::Received
    }

    /// Trimmed text content.
    pub fn text(&self) -> &str {
        self.content.trim()
    }
}

/// The last `n` messages of `history`.
pub fn last_n(history: &[Message], n: usize) -> &[Message] {
    &history[history.len().saturating_sub(n)..]
}

/// The last `n` messages the user sent, oldest first.
pub fn last_sent(history: &[Message], n: usize) -> Vec<&Message> {
    let mut sent: Vec<&Message> = history.iter().rev().filter(|m| m.is_sent()).take(n).collect();
    sent.reverse();
    sent
}
