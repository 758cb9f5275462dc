use crabble_engine::EngineError;
use thiserror::Error;

/// Failures the conversation surfaces to its UI, either as an error state
/// or as an error message in the transcript.
#[derive(Error, Debug, Clone)]
pub enum InferenceError {
    #[error("Model not found: {model_name}")]
    ModelFileNotFound { model_name: String },

    #[error("Internal error: {0}")]
    Engine(String),

    #[error("Model uninitialized")]
    SessionNotInitialized,

    #[error("Token limit exceeded")]
    TokensExceeded,

    #[error("Query rejected: {0}")]
    QueryRejected(String),

    #[error("Generation failed: {reason}")]
    GenerationFailed { partial: String, reason: String },
}

/// Payload-free discriminant of [`InferenceError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ModelFileNotFound,
    Engine,
    SessionNotInitialized,
    TokensExceeded,
    QueryRejected,
    GenerationFailed,
}

impl InferenceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            InferenceError::ModelFileNotFound { .. } => ErrorKind::ModelFileNotFound,
            InferenceError::Engine(_) => ErrorKind::Engine,
            InferenceError::SessionNotInitialized => ErrorKind::SessionNotInitialized,
            InferenceError::TokensExceeded => ErrorKind::TokensExceeded,
            InferenceError::QueryRejected(_) => ErrorKind::QueryRejected,
            InferenceError::GenerationFailed { .. } => ErrorKind::GenerationFailed,
        }
    }

    /// User-facing hint shown next to the error alert.
    pub fn failure_reason(&self) -> String {
        match self {
            InferenceError::ModelFileNotFound { model_name } => {
                format!("{} could not be found on this device. Download it and try again.", model_name)
            }
            InferenceError::Engine(message) => message.clone(),
            InferenceError::SessionNotInitialized => {
                "Please load the model before starting a chat.".to_string()
            }
            InferenceError::TokensExceeded => {
                "This chat has reached its limit. Start a new chat to keep talking.".to_string()
            }
            InferenceError::QueryRejected(reason) => reason.clone(),
            InferenceError::GenerationFailed { reason, .. } => reason.clone(),
        }
    }

    /// Text generated before a mid-stream failure, if any.
    pub fn partial_response(&self) -> Option<&str> {
        match self {
            InferenceError::GenerationFailed { partial, .. } if !partial.is_empty() => Some(partial),
            _ => None,
        }
    }
}

impl From<EngineError> for InferenceError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ModelFileNotFound(model_name) => {
                InferenceError::ModelFileNotFound { model_name }
            }
            EngineError::QueryRejected(reason) => InferenceError::QueryRejected(reason),
            other => InferenceError::Engine(other.to_string()),
        }
    }
}

/// Errors returned by [`crate::ConversationHandle`].
#[derive(Error, Debug)]
pub enum ConversationError {
    #[error("Conversation controller has stopped")]
    ControllerStopped,
}
