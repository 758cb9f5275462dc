//! Crabble Conversation - session orchestration for the on-device companion
//!
//! Loads the model, runs one chat session at a time, streams responses into
//! the message log and tracks how much of the context window is left.

pub mod config;
pub mod controller;
pub mod models;
pub mod services;
pub mod utils;

#[cfg(test)]
mod testing;

pub use crate::config::Settings;
pub use controller::{ConversationController, ConversationHandle};
pub use models::{ChatMessage, ConversationSnapshot, ConversationState, Participant, SystemKind};
pub use services::{
    render_prompt, ConversationEvent, EventBus, LifecycleOptions, PromptType, SessionId,
    SessionLifecycleManager, StreamingSession, TokenBudget, TokenBudgetEstimator,
};
pub use utils::error::{ConversationError, ErrorKind, InferenceError};
pub use utils::logger::{init_logger, LoggerConfig};
