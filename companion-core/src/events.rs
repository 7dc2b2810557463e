//! Change notifications.
//!
//! Components publish to a shared broadcast channel; UIs subscribe to learn
//! about identity switches, relationship transitions, and dropped writes.
//! Publishing never blocks and never fails when nobody is listening.

use crate::identity::ResolvedIdentity;
use crate::relationship::RelationshipStatus;
use crate::store::StorageScope;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

/// Something other parts of the application may want to react to.
#[derive(Debug, Clone, PartialEq)]
pub enum CompanionEvent {
    /// The effective identity changed.
    IdentityChanged {
        previous_id: String,
        current: ResolvedIdentity,
    },
    /// The couple-space record changed. `status` is `None` once cleared.
    RelationshipChanged {
        character_id: String,
        status: Option<RelationshipStatus>,
    },
    /// A write was dropped because storage stayed full.
    StorageWarning {
        scope: StorageScope,
        key: String,
        message: String,
    },
}

/// Broadcast hub for [`CompanionEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CompanionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CompanionEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: CompanionEvent) {
        // No receivers is not an error.
        let _ = self.tx.send(event);
    }
}
