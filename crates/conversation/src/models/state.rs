use crate::models::message::ChatMessage;
use crate::services::token_budget::TokenBudget;
use crate::utils::error::InferenceError;
use serde::Serialize;
use std::fmt;

/// Where the conversation stands. Drives which UI actions are available.
#[derive(Debug, Clone, Default)]
pub enum ConversationState {
    #[default]
    Idle,
    LoadingModel,
    PromptSubmitted,
    StreamingResponse,
    CriticalError(InferenceError),
    NonCriticalError(InferenceError),
    Done,
}

// Error states compare by error kind only, so two failures of the same
// category are the same state regardless of their message.
impl PartialEq for ConversationState {
    fn eq(&self, other: &Self) -> bool {
        use ConversationState::*;
        match (self, other) {
            (Idle, Idle)
            | (LoadingModel, LoadingModel)
            | (PromptSubmitted, PromptSubmitted)
            | (StreamingResponse, StreamingResponse)
            | (Done, Done) => true,
            (CriticalError(a), CriticalError(b)) => a.kind() == b.kind(),
            (NonCriticalError(a), NonCriticalError(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

impl ConversationState {
    pub fn inference_error(&self) -> Option<&InferenceError> {
        match self {
            ConversationState::CriticalError(e) | ConversationState::NonCriticalError(e) => Some(e),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        self.inference_error().is_some()
    }

    /// A turn is between submission and completion.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            ConversationState::LoadingModel
                | ConversationState::PromptSubmitted
                | ConversationState::StreamingResponse
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ConversationState::Idle => "idle",
            ConversationState::LoadingModel => "loading_model",
            ConversationState::PromptSubmitted => "prompt_submitted",
            ConversationState::StreamingResponse => "streaming_response",
            ConversationState::CriticalError(_) => "critical_error",
            ConversationState::NonCriticalError(_) => "non_critical_error",
            ConversationState::Done => "done",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.inference_error() {
            Some(e) => write!(f, "{} ({})", self.name(), e),
            None => f.write_str(self.name()),
        }
    }
}

/// Read-only copy of everything the UI renders.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationSnapshot {
    #[serde(serialize_with = "serialize_state")]
    pub state: ConversationState,
    pub messages: Vec<ChatMessage>,
    pub remaining_tokens: TokenBudget,
    pub download_required: bool,
    /// Prompt input and send button disabled.
    pub interactions_disabled: bool,
    /// New chat button disabled.
    pub new_chat_disabled: bool,
}

fn serialize_state<S: serde::Serializer>(state: &ConversationState, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(state)
}
