//! One chat session on top of an engine session: at most one response in
//! flight, and remaining-token estimates for the running transcript.

use crate::services::token_budget::{TokenBudget, TokenBudgetEstimator};
use crate::utils::error::InferenceError;
use crabble_engine::{EngineError, EngineSession, GenerationConfig, LoadedModel, SamplingRanges};
use futures::{Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Chunks of one response. A failure is always the last item.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, InferenceError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Clears the in-flight flag when the response stream is dropped.
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct StreamingSession {
    id: SessionId,
    inner: Box<dyn EngineSession>,
    estimator: TokenBudgetEstimator,
    in_flight: Arc<AtomicBool>,
}

impl StreamingSession {
    /// Validates `config` against `ranges` before asking the model for a session.
    pub fn create(
        model: Arc<dyn LoadedModel>,
        config: GenerationConfig,
        ranges: &SamplingRanges,
        estimator: TokenBudgetEstimator,
    ) -> Result<Self, InferenceError> {
        config.validate(ranges)?;
        let inner = model.create_session(config)?;

        let id = SessionId::new();
        debug!(session_id = %id, ?config, "engine session created");

        Ok(Self {
            id,
            inner,
            estimator,
            in_flight: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Appends `prompt` and starts streaming the response.
    ///
    /// Fails with `QueryRejected` if a previous response is still being
    /// consumed or the engine refuses the prompt. A failure after the
    /// stream started arrives as a final `GenerationFailed` item carrying
    /// the text produced so far.
    pub fn send(&mut self, prompt: &str) -> Result<ChunkStream, InferenceError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            return Err(InferenceError::QueryRejected(
                "a response is still streaming for this session".to_string(),
            ));
        }
        let guard = InFlightGuard(self.in_flight.clone());

        self.inner.append_prompt(prompt).map_err(rejected)?;
        let mut upstream = self.inner.stream_response().map_err(rejected)?;

        let session_id = self.id;
        let stream = async_stream::stream! {
            let _guard = guard;
            let mut partial = String::new();
            while let Some(item) = upstream.next().await {
                match item {
                    Ok(chunk) => {
                        partial.push_str(&chunk);
                        yield Ok(chunk);
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, chars = partial.len(), "generation failed mid-stream");
                        yield Err(InferenceError::GenerationFailed {
                            partial,
                            reason: e.to_string(),
                        });
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    /// Remaining tokens after `history` and `prompt`, charging template
    /// overhead for `message_count` messages.
    ///
    /// `None` when the engine could not count tokens; callers keep their
    /// previous estimate. An empty context yields `Unknown`.
    pub fn estimate_remaining_tokens(
        &self,
        prompt: &str,
        history: &str,
        message_count: usize,
    ) -> Option<TokenBudget> {
        let context = format!("{}{}", history, prompt);
        if context.is_empty() {
            return Some(TokenBudget::Unknown);
        }

        match self.inner.size_in_tokens(&context) {
            Ok(tokens) => Some(self.estimator.estimate(tokens, message_count)),
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "token count unavailable");
                None
            }
        }
    }
}

fn rejected(err: EngineError) -> InferenceError {
    match err {
        EngineError::QueryRejected(reason) => InferenceError::QueryRejected(reason),
        other => InferenceError::QueryRejected(other.to_string()),
    }
}
