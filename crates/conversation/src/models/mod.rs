pub mod message;
pub mod state;

pub use message::{ChatMessage, Participant, SystemKind};
pub use state::{ConversationSnapshot, ConversationState};
