//! Contracts between the conversation core and an inference backend.

use crate::error::Result;
use crate::model::GenerationConfig;
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

/// Ordered partial responses for one query. Finite and not restartable.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Simple role/content pair used when rendering chat templates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// Loads model weights into something sessions can be created from.
#[async_trait::async_trait]
pub trait InferenceBackend: Send + Sync {
    /// `max_tokens` is the full context window (prompt + output).
    async fn load_model(&self, path: &Path, max_tokens: u32) -> Result<Arc<dyn LoadedModel>>;
}

/// A loaded, immutable model. Shared read-only with the session built on it.
pub trait LoadedModel: Send + Sync {
    fn max_tokens(&self) -> u32;

    fn create_session(self: Arc<Self>, config: GenerationConfig) -> Result<Box<dyn EngineSession>>;
}

/// One live inference context holding the running conversation.
pub trait EngineSession: Send {
    /// Appends user text to the running context. Empty text is accepted.
    fn append_prompt(&mut self, text: &str) -> Result<()>;

    /// Starts generating a response to everything appended so far.
    fn stream_response(&mut self) -> Result<ResponseStream>;

    fn size_in_tokens(&self, text: &str) -> Result<usize>;
}
