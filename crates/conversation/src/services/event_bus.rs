use crate::models::{ChatMessage, ConversationState};
use crate::services::token_budget::TokenBudget;
use tokio::sync::broadcast;
use tracing::trace;

/// Changes to observable conversation state, in the order they happened.
#[derive(Debug, Clone)]
pub enum ConversationEvent {
    StateChanged(ConversationState),
    MessageAppended(ChatMessage),
    MessageUpdated(ChatMessage),
    MessagesCleared,
    TokensChanged(TokenBudget),
    DownloadRequiredChanged(bool),
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ConversationEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: ConversationEvent) {
        // Nobody listening is normal for headless use.
        if let Err(e) = self.tx.send(event) {
            trace!("event dropped, no subscribers: {:?}", e.0);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.tx.subscribe()
    }
}
