//! Scripted inference backend for unit tests.

use crate::controller::ConversationController;
use crate::services::event_bus::EventBus;
use crate::services::lifecycle::{LifecycleOptions, SessionLifecycleManager};
use async_trait::async_trait;
use crabble_engine::{
    EngineError, EngineSession, GenerationConfig, InferenceBackend, LoadedModel, ModelCategory,
    ModelProvider, ResponseStream, Result,
};
use futures::stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

mockall::mock! {
    pub Provider {}

    impl ModelProvider for Provider {
        fn resolve_local_path(&self, category: ModelCategory) -> Result<PathBuf>;
    }
}

pub(crate) fn found_provider() -> MockProvider {
    let mut provider = MockProvider::new();
    provider
        .expect_resolve_local_path()
        .returning(|category| Ok(PathBuf::from("/models").join(category.file_name())));
    provider
}

pub(crate) fn missing_provider() -> MockProvider {
    let mut provider = MockProvider::new();
    provider
        .expect_resolve_local_path()
        .returning(|category| Err(EngineError::ModelFileNotFound(category.file_name())));
    provider
}

pub(crate) type ChunkSender = mpsc::UnboundedSender<Result<String>>;

enum Reply {
    Chunks(Vec<String>),
    FailAfter(Vec<String>, String),
    /// The test drives the stream through a [`ChunkSender`].
    Manual,
}

#[derive(Default)]
struct Shared {
    replies: Mutex<VecDeque<Reply>>,
    manual: Mutex<VecDeque<ChunkSender>>,
    load_error: Mutex<Option<String>>,
    session_error: Mutex<Option<String>>,
    reject_prompts: AtomicBool,
    fail_token_count: AtomicBool,
    loads: AtomicUsize,
    sessions: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    last_config: Mutex<Option<GenerationConfig>>,
}

/// Backend whose responses are queued up front. Streams with no queued reply
/// are manual. Token counts are whitespace-separated words.
#[derive(Clone, Default)]
pub(crate) struct ScriptedBackend {
    shared: Arc<Shared>,
}

impl ScriptedBackend {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn reply_with(&self, chunks: &[&str]) {
        let chunks = chunks.iter().map(|c| c.to_string()).collect();
        self.shared.replies.lock().push_back(Reply::Chunks(chunks));
    }

    pub(crate) fn fail_with(&self, chunks: &[&str], reason: &str) {
        let chunks = chunks.iter().map(|c| c.to_string()).collect();
        self.shared
            .replies
            .lock()
            .push_back(Reply::FailAfter(chunks, reason.to_string()));
    }

    pub(crate) fn reply_manually(&self) {
        self.shared.replies.lock().push_back(Reply::Manual);
    }

    /// Sender for the oldest manual stream not yet taken.
    pub(crate) fn take_sender(&self) -> Option<ChunkSender> {
        self.shared.manual.lock().pop_front()
    }

    pub(crate) fn fail_next_load(&self, reason: &str) {
        *self.shared.load_error.lock() = Some(reason.to_string());
    }

    pub(crate) fn fail_sessions(&self, reason: Option<&str>) {
        *self.shared.session_error.lock() = reason.map(str::to_string);
    }

    pub(crate) fn reject_prompts(&self, reject: bool) {
        self.shared.reject_prompts.store(reject, Ordering::SeqCst);
    }

    pub(crate) fn fail_token_count(&self, fail: bool) {
        self.shared.fail_token_count.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn loads(&self) -> usize {
        self.shared.loads.load(Ordering::SeqCst)
    }

    pub(crate) fn sessions(&self) -> usize {
        self.shared.sessions.load(Ordering::SeqCst)
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.shared.prompts.lock().clone()
    }

    pub(crate) fn last_config(&self) -> Option<GenerationConfig> {
        *self.shared.last_config.lock()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn load_model(&self, _path: &Path, max_tokens: u32) -> Result<Arc<dyn LoadedModel>> {
        self.shared.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self.shared.load_error.lock().take() {
            return Err(EngineError::ModelLoad(reason));
        }
        Ok(Arc::new(ScriptedModel {
            shared: self.shared.clone(),
            max_tokens,
        }))
    }
}

struct ScriptedModel {
    shared: Arc<Shared>,
    max_tokens: u32,
}

impl LoadedModel for ScriptedModel {
    fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    fn create_session(self: Arc<Self>, config: GenerationConfig) -> Result<Box<dyn EngineSession>> {
        if let Some(reason) = self.shared.session_error.lock().clone() {
            return Err(EngineError::SessionCreation(reason));
        }
        self.shared.sessions.fetch_add(1, Ordering::SeqCst);
        *self.shared.last_config.lock() = Some(config);
        Ok(Box::new(ScriptedSession {
            shared: self.shared.clone(),
        }))
    }
}

struct ScriptedSession {
    shared: Arc<Shared>,
}

impl EngineSession for ScriptedSession {
    fn append_prompt(&mut self, text: &str) -> Result<()> {
        if self.shared.reject_prompts.load(Ordering::SeqCst) {
            return Err(EngineError::QueryRejected("context is full".to_string()));
        }
        self.shared.prompts.lock().push(text.to_string());
        Ok(())
    }

    fn stream_response(&mut self) -> Result<ResponseStream> {
        let reply = self.shared.replies.lock().pop_front().unwrap_or(Reply::Manual);
        match reply {
            Reply::Chunks(chunks) => Ok(Box::pin(stream::iter(
                chunks.into_iter().map(Ok::<String, EngineError>),
            ))),
            Reply::FailAfter(chunks, reason) => Ok(Box::pin(stream::iter(
                chunks
                    .into_iter()
                    .map(Ok::<String, EngineError>)
                    .chain(std::iter::once(Err(EngineError::Generation(reason)))),
            ))),
            Reply::Manual => {
                let (tx, rx) = mpsc::unbounded_channel();
                self.shared.manual.lock().push_back(tx);
                Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|item| (item, rx))
                })))
            }
        }
    }

    fn size_in_tokens(&self, text: &str) -> Result<usize> {
        if self.shared.fail_token_count.load(Ordering::SeqCst) {
            return Err(EngineError::Tokenization("session torn down".to_string()));
        }
        Ok(text.split_whitespace().count())
    }
}

pub(crate) fn controller(backend: &ScriptedBackend, provider: MockProvider) -> ConversationController {
    controller_with(backend, provider, LifecycleOptions::default())
}

pub(crate) fn controller_with(
    backend: &ScriptedBackend,
    provider: MockProvider,
    options: LifecycleOptions,
) -> ConversationController {
    let lifecycle = SessionLifecycleManager::new(Arc::new(backend.clone()), Arc::new(provider), options);
    ConversationController::new(ModelCategory::Gemma3n, lifecycle, EventBus::new(1024))
}
