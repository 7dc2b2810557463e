//! Context assembly and relationship state for persona chat companions.
//!
//! This crate provides:
//! - Identity resolution across a main profile, secondary accounts, and masks
//! - Scoped, versioned storage over memory or SQLite
//! - Per-character long-term memory with pluggable ranking
//! - A couple-space relationship state machine with shared content
//! - A table-driven trigger engine for feature status and nudges
//! - Per-turn context assembly and an OpenAI-compatible chat session
//!
//! # Quick Start
//!
//! ```ignore
//! use companion_core::{ChatTransport, CompanionConfig, CompanionSession, Persona};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = CompanionConfig::from_env();
//!     let transport = Arc::new(ChatTransport::from_env()?);
//!     let session = CompanionSession::open(&config, transport)?;
//!
//!     let persona = Persona::new("lin", "Lin", "A warm, teasing barista.");
//!     let response = session.take_turn(&persona, &[], "I'm so hungry").await?;
//!     println!("{}", response.reply);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod events;
pub mod identity;
pub mod memory;
pub mod message;
pub mod relationship;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod testing;
pub mod transport;
pub mod triggers;

// Primary public API
pub use config::{CompanionConfig, StoreConfig};
pub use context::{AssembledContext, ContextAssembler, ContextError, SectionKind};
pub use events::{CompanionEvent, EventBus};
pub use identity::{IdentityError, IdentityResolver, Mask, ProfileUpdate, ResolvedIdentity};
pub use memory::{Importance, MemoryDomain, MemoryRecord, MemoryStore, RankingKind};
pub use message::{FeaturePayload, FeatureStatus, Message, MessageKind};
pub use relationship::{
    RelationshipBook, RelationshipError, RelationshipSlot, RelationshipStatus, Sender,
};
pub use session::{CompanionSession, Persona, SessionError, TranscriptTurn, TurnResponse};
pub use snapshot::{Snapshot, SnapshotError};
pub use store::{InMemoryStore, SqliteStore, StateStore, StorageScope, StoreError};
pub use testing::{MockTransport, TestHarness};
pub use transport::{ChatTransport, Transport, TransportError};
pub use triggers::{Advisory, TriggerEvaluator, TriggerRule};
