//! Conversation state machine.
//!
//! Owns the message log, the active session and the token budget. Responses
//! stream on a spawned task that forwards chunks back through an internal
//! channel; [`ConversationController::apply_stream_event`] applies them in
//! order on whichever task owns the controller.

use crate::config::Settings;
use crate::models::{ChatMessage, ConversationSnapshot, ConversationState, Participant, SystemKind};
use crate::services::event_bus::{ConversationEvent, EventBus};
use crate::services::lifecycle::{LifecycleOptions, SessionLifecycleManager};
use crate::services::prompts::{render_prompt, PromptType};
use crate::services::streaming_session::{ChunkStream, SessionId, StreamingSession};
use crate::services::token_budget::TokenBudget;
use crate::utils::error::InferenceError;
use crabble_engine::{InferenceBackend, ModelCategory, ModelProvider};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug)]
pub(crate) enum StreamEventKind {
    Chunk(String),
    Completed,
    Failed(InferenceError),
}

/// One item forwarded from a response stream, tagged with the turn it belongs to.
#[derive(Debug)]
pub(crate) struct StreamEvent {
    session_id: SessionId,
    message_id: Uuid,
    kind: StreamEventKind,
}

struct PendingTurn {
    session_id: SessionId,
    message_id: Uuid,
    forwarder: JoinHandle<()>,
}

pub struct ConversationController {
    category: ModelCategory,
    lifecycle: SessionLifecycleManager,
    session: Option<StreamingSession>,
    messages: Vec<ChatMessage>,
    state: ConversationState,
    remaining_tokens: TokenBudget,
    download_required: bool,
    pending: Option<PendingTurn>,
    events: EventBus,
    stream_tx: mpsc::UnboundedSender<StreamEvent>,
    stream_rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl ConversationController {
    pub fn new(category: ModelCategory, lifecycle: SessionLifecycleManager, events: EventBus) -> Self {
        let download_required = lifecycle.is_download_required(category);
        let (stream_tx, stream_rx) = mpsc::unbounded_channel();

        Self {
            category,
            lifecycle,
            session: None,
            messages: Vec::with_capacity(32),
            state: ConversationState::Idle,
            remaining_tokens: TokenBudget::Unknown,
            download_required,
            pending: None,
            events,
            stream_tx,
            stream_rx,
        }
    }

    pub fn from_settings(
        backend: Arc<dyn InferenceBackend>,
        provider: Arc<dyn ModelProvider>,
        settings: &Settings,
    ) -> Self {
        let lifecycle = SessionLifecycleManager::new(backend, provider, LifecycleOptions::from(settings));
        Self::new(
            settings.model.category,
            lifecycle,
            EventBus::new(settings.events.capacity),
        )
    }

    pub fn category(&self) -> ModelCategory {
        self.category
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn remaining_tokens(&self) -> TokenBudget {
        self.remaining_tokens
    }

    pub fn download_required(&self) -> bool {
        self.download_required
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_turn_in_flight(&self) -> bool {
        self.pending.is_some()
    }

    /// Prompt input and send disabled.
    pub fn interactions_disabled(&self) -> bool {
        self.state != ConversationState::Done || self.remaining_tokens.is_exhausted()
    }

    pub fn new_chat_disabled(&self) -> bool {
        self.state != ConversationState::Done
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            state: self.state.clone(),
            messages: self.messages.clone(),
            remaining_tokens: self.remaining_tokens,
            download_required: self.download_required,
            interactions_disabled: self.interactions_disabled(),
            new_chat_disabled: self.new_chat_disabled(),
        }
    }

    pub fn event_bus(&self) -> EventBus {
        self.events.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.events.subscribe()
    }

    /// Loads the model and opens the first chat. Only acts from `Idle` with
    /// the model asset present.
    pub async fn load_model(&mut self) {
        if self.state != ConversationState::Idle {
            debug!(state = %self.state, "load_model ignored outside idle");
            return;
        }
        if self.download_required {
            info!(model = %self.category, "model not on device, download required");
            return;
        }

        // a reload invalidates any session built on the previous model
        self.cancel_pending_turn();
        if let Some(session) = self.session.take() {
            debug!(session_id = %session.id(), "session discarded before reload");
        }

        self.set_state(ConversationState::LoadingModel);
        match self.lifecycle.load_model(self.category).await {
            Ok(_) => self.start_new_chat(),
            Err(e) => {
                error!(model = %self.category, error = %e, "model load failed");
                self.set_state(ConversationState::CriticalError(e));
            }
        }
    }

    /// Replaces the session with a fresh one and clears the log.
    pub fn start_new_chat(&mut self) {
        if !self.lifecycle.is_loaded() {
            warn!("new chat requested without a loaded model");
            self.set_state(ConversationState::CriticalError(InferenceError::SessionNotInitialized));
            return;
        }

        self.set_state(ConversationState::LoadingModel);
        match self.lifecycle.start_session(self.category) {
            Ok(session) => {
                self.cancel_pending_turn();
                info!(session_id = %session.id(), "new chat started");
                self.session = Some(session);

                self.messages.clear();
                self.events.publish(ConversationEvent::MessagesCleared);
                self.set_remaining_tokens(TokenBudget::Unknown);
                self.set_state(ConversationState::Done);
            }
            Err(e) => {
                error!(error = %e, "session creation failed");
                if self.session.is_some() {
                    self.set_state(ConversationState::NonCriticalError(e));
                } else {
                    self.set_state(ConversationState::CriticalError(e));
                }
            }
        }
    }

    /// Drops model and session. The conversation stays in `LoadingModel`
    /// until a reload is requested.
    pub fn clear_model(&mut self) {
        self.cancel_pending_turn();
        if let Some(session) = self.session.take() {
            debug!(session_id = %session.id(), "session discarded");
        }
        self.lifecycle.unload();
        self.set_state(ConversationState::LoadingModel);
    }

    /// Called by the downloader once the model asset is in place.
    pub async fn handle_model_download_completed(&mut self) {
        self.set_download_required(false);
        self.set_state(ConversationState::Idle);
        self.load_model().await;
    }

    pub fn reset_state_after_error_intimation(&mut self) {
        if matches!(self.state, ConversationState::NonCriticalError(_)) && self.session.is_some() {
            self.set_state(ConversationState::Done);
        }
    }

    pub fn send_prompt(&mut self, context: &str, prompt_type: PromptType) {
        self.send_message(&render_prompt(context, prompt_type));
    }

    /// Submits one user turn. The response streams in through
    /// [`Self::apply_stream_event`].
    pub fn send_message(&mut self, text: &str) {
        let Some(session_id) = self.session.as_ref().map(StreamingSession::id) else {
            warn!("prompt submitted without a session");
            self.set_state(ConversationState::CriticalError(InferenceError::SessionNotInitialized));
            return;
        };
        if self.state != ConversationState::Done {
            warn!(state = %self.state, "prompt rejected, conversation busy");
            return;
        }
        if self.remaining_tokens.is_exhausted() {
            warn!(session_id = %session_id, "prompt rejected, token budget exhausted");
            return;
        }

        self.set_state(ConversationState::PromptSubmitted);
        self.push_message(ChatMessage::user(text));
        let placeholder = ChatMessage::response_placeholder();
        let message_id = placeholder.id();
        self.push_message(placeholder);

        let sent = match self.session.as_mut() {
            Some(session) => session.send(text),
            None => Err(InferenceError::SessionNotInitialized),
        };

        match sent {
            Ok(stream) => {
                debug!(session_id = %session_id, message_id = %message_id, "response streaming");
                let forwarder = tokio::spawn(forward_stream(
                    stream,
                    session_id,
                    message_id,
                    self.stream_tx.clone(),
                ));
                self.pending = Some(PendingTurn {
                    session_id,
                    message_id,
                    forwarder,
                });
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "query rejected");
                self.handle_stream_error(&e, message_id);
                self.finish_turn();
            }
        }
    }

    /// Next forwarded stream event, stale or not.
    pub(crate) async fn next_stream_event(&mut self) -> Option<StreamEvent> {
        self.stream_rx.recv().await
    }

    pub(crate) fn apply_stream_event(&mut self, event: StreamEvent) {
        let current = self
            .pending
            .as_ref()
            .is_some_and(|p| p.session_id == event.session_id && p.message_id == event.message_id)
            && self
                .session
                .as_ref()
                .is_some_and(|s| s.id() == event.session_id);
        if !current {
            debug!(session_id = %event.session_id, message_id = %event.message_id, "stale stream event dropped");
            return;
        }

        if self.state == ConversationState::PromptSubmitted {
            self.set_state(ConversationState::StreamingResponse);
        }

        match event.kind {
            StreamEventKind::Chunk(chunk) => {
                self.append_to_message(event.message_id, &chunk);
                self.set_remaining_tokens(self.remaining_tokens.decrement());
            }
            StreamEventKind::Completed => {
                debug!(session_id = %event.session_id, "response complete");
                self.recompute_remaining_tokens("");
                self.finish_turn();
            }
            StreamEventKind::Failed(e) => {
                self.handle_stream_error(&e, event.message_id);
                self.recompute_remaining_tokens("");
                self.finish_turn();
            }
        }
    }

    /// Applies stream events until the in-flight turn ends.
    /// Returns false if there was no turn to wait for.
    pub async fn run_until_idle(&mut self) -> bool {
        if self.pending.is_none() {
            return false;
        }
        while self.pending.is_some() {
            match self.stream_rx.recv().await {
                Some(event) => self.apply_stream_event(event),
                None => break,
            }
        }
        true
    }

    /// Cancels any in-flight response before the controller goes away.
    pub fn shutdown(&mut self) {
        self.cancel_pending_turn();
    }

    fn finish_turn(&mut self) {
        self.pending = None;
        if self.remaining_tokens.is_exhausted() {
            self.set_state(ConversationState::NonCriticalError(InferenceError::TokensExceeded));
        } else {
            self.set_state(ConversationState::Done);
        }
    }

    fn cancel_pending_turn(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.forwarder.abort();
            debug!(session_id = %pending.session_id, message_id = %pending.message_id, "in-flight response cancelled");
        }
    }

    fn handle_stream_error(&mut self, err: &InferenceError, message_id: Uuid) {
        let description = err.to_string();
        let Some(message) = self.messages.iter_mut().find(|m| m.id() == message_id) else {
            return;
        };

        match message.participant() {
            Participant::User => {}
            Participant::System(SystemKind::Response) if message.text().is_empty() => {
                message.mark_failed(&description);
                let updated = message.clone();
                self.events.publish(ConversationEvent::MessageUpdated(updated));
            }
            Participant::System(_) => {
                self.push_message(ChatMessage::error(description));
            }
        }
    }

    fn recompute_remaining_tokens(&mut self, prompt: &str) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let history: String = self.messages.iter().map(ChatMessage::text).collect();

        match session.estimate_remaining_tokens(prompt, &history, self.messages.len()) {
            Some(budget) => self.set_remaining_tokens(budget),
            None => debug!(remaining = %self.remaining_tokens, "keeping previous token estimate"),
        }
    }

    fn append_to_message(&mut self, message_id: Uuid, chunk: &str) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id() == message_id) {
            if message.append_text(chunk) {
                let updated = message.clone();
                self.events.publish(ConversationEvent::MessageUpdated(updated));
            }
        }
    }

    fn push_message(&mut self, message: ChatMessage) {
        self.events.publish(ConversationEvent::MessageAppended(message.clone()));
        self.messages.push(message);
    }

    fn set_state(&mut self, next: ConversationState) {
        // Repeated errors are re-published so the UI can alert again.
        if self.state == next && !next.is_error() {
            return;
        }
        debug!(from = %self.state, to = %next, "state transition");
        self.state = next.clone();
        self.events.publish(ConversationEvent::StateChanged(next));
    }

    fn set_remaining_tokens(&mut self, budget: TokenBudget) {
        if self.remaining_tokens != budget {
            self.remaining_tokens = budget;
            self.events.publish(ConversationEvent::TokensChanged(budget));
        }
    }

    fn set_download_required(&mut self, required: bool) {
        if self.download_required != required {
            self.download_required = required;
            self.events.publish(ConversationEvent::DownloadRequiredChanged(required));
        }
    }
}

async fn forward_stream(
    mut stream: ChunkStream,
    session_id: SessionId,
    message_id: Uuid,
    tx: mpsc::UnboundedSender<StreamEvent>,
) {
    while let Some(item) = stream.next().await {
        let (kind, last) = match item {
            Ok(chunk) => (StreamEventKind::Chunk(chunk), false),
            Err(e) => (StreamEventKind::Failed(e), true),
        };
        let event = StreamEvent {
            session_id,
            message_id,
            kind,
        };
        if tx.send(event).is_err() || last {
            return;
        }
    }

    let _ = tx.send(StreamEvent {
        session_id,
        message_id,
        kind: StreamEventKind::Completed,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{controller, controller_with, found_provider, missing_provider, MockProvider, ScriptedBackend};
    use crate::utils::error::ErrorKind;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn ready(backend: &ScriptedBackend) -> ConversationController {
        let mut c = controller(backend, found_provider());
        c.load_model().await;
        assert_eq!(c.state(), &ConversationState::Done);
        c
    }

    async fn step(c: &mut ConversationController) {
        let event = c.next_stream_event().await.unwrap();
        c.apply_stream_event(event);
    }

    fn error_kind(state: &ConversationState) -> Option<ErrorKind> {
        state.inference_error().map(InferenceError::kind)
    }

    #[tokio::test]
    async fn test_load_model_opens_chat() {
        let backend = ScriptedBackend::new();
        let c = ready(&backend).await;

        assert!(c.has_session());
        assert!(c.messages().is_empty());
        assert_eq!(c.remaining_tokens(), TokenBudget::Unknown);
        assert!(!c.download_required());
        assert!(!c.interactions_disabled());
        assert_eq!(backend.loads(), 1);
        assert_eq!(backend.sessions(), 1);
    }

    #[tokio::test]
    async fn test_load_model_waits_for_download() {
        let backend = ScriptedBackend::new();
        let mut c = controller(&backend, missing_provider());
        assert!(c.download_required());

        c.load_model().await;
        assert_eq!(c.state(), &ConversationState::Idle);
        assert_eq!(backend.loads(), 0);
    }

    #[tokio::test]
    async fn test_load_failure_is_critical() {
        let backend = ScriptedBackend::new();
        backend.fail_next_load("bad magic");
        let mut c = controller(&backend, found_provider());

        c.load_model().await;
        assert_eq!(error_kind(c.state()), Some(ErrorKind::Engine));
        assert!(matches!(c.state(), ConversationState::CriticalError(_)));
        assert!(!c.has_session());
        assert!(c.interactions_disabled());
    }

    #[tokio::test]
    async fn test_session_failure_after_load_is_critical() {
        let backend = ScriptedBackend::new();
        backend.fail_sessions(Some("out of memory"));
        let mut c = controller(&backend, found_provider());

        c.load_model().await;
        assert!(matches!(c.state(), ConversationState::CriticalError(InferenceError::Engine(_))));
    }

    #[tokio::test]
    async fn test_missing_model_file_at_load_is_critical() {
        let backend = ScriptedBackend::new();
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut provider = MockProvider::new();
        let seen = calls.clone();
        provider.expect_resolve_local_path().returning(move |category| {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(std::path::PathBuf::from(category.file_name()))
            } else {
                Err(crabble_engine::EngineError::ModelFileNotFound(category.file_name()))
            }
        });
        let mut c = controller(&backend, provider);
        assert!(!c.download_required());

        c.load_model().await;
        assert!(matches!(c.state(), ConversationState::CriticalError(_)));
        assert_eq!(error_kind(c.state()), Some(ErrorKind::ModelFileNotFound));
        assert_eq!(backend.loads(), 0);

        c.send_message("hello");
        assert!(c.messages().is_empty());
        assert!(matches!(c.state(), ConversationState::CriticalError(_)));
        assert!(backend.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_reload_discards_old_session() {
        let backend = ScriptedBackend::new();
        let mut c = ready(&backend).await;
        let old = c.session.as_ref().map(StreamingSession::id);
        assert!(old.is_some());

        backend.fail_sessions(Some("oom"));
        c.handle_model_download_completed().await;
        assert!(matches!(c.state(), ConversationState::CriticalError(InferenceError::Engine(_))));
        assert!(!c.has_session());
        assert_eq!(backend.loads(), 2);

        c.reset_state_after_error_intimation();
        assert!(matches!(c.state(), ConversationState::CriticalError(_)));

        backend.fail_sessions(None);
        backend.reply_with(&["fresh"]);
        c.handle_model_download_completed().await;
        assert_eq!(c.state(), &ConversationState::Done);
        assert_ne!(c.session.as_ref().map(StreamingSession::id), old);

        c.send_message("hi");
        c.run_until_idle().await;
        assert_eq!(c.messages()[1].text(), "fresh");
    }

    #[tokio::test]
    async fn test_reload_mid_stream_cancels_turn() {
        let backend = ScriptedBackend::new();
        backend.reply_manually();
        let mut c = ready(&backend).await;

        c.send_message("hi");
        let tx = backend.take_sender().unwrap();
        tx.send(Ok("late".to_string())).unwrap();
        let stale = c.next_stream_event().await.unwrap();

        c.handle_model_download_completed().await;
        assert!(!c.is_turn_in_flight());
        c.apply_stream_event(stale);
        assert!(c.messages().is_empty());
        assert_eq!(c.state(), &ConversationState::Done);
    }

    #[tokio::test]
    async fn test_turn_streams_into_placeholder() {
        let backend = ScriptedBackend::new();
        backend.reply_with(&["\n Hi", " there"]);
        let mut c = ready(&backend).await;
        let mut events = c.subscribe();

        c.send_message("hello");
        assert_eq!(c.state(), &ConversationState::PromptSubmitted);
        assert_eq!(c.messages().len(), 2);
        assert_eq!(c.messages()[0].participant(), Participant::User);
        assert_eq!(c.messages()[0].text(), "hello");
        assert!(c.messages()[1].is_loading());
        assert!(c.interactions_disabled());

        assert!(c.run_until_idle().await);
        assert_eq!(c.state(), &ConversationState::Done);
        assert_eq!(c.messages().len(), 2);
        assert_eq!(c.messages()[1].text(), "Hi there");
        assert!(!c.messages()[1].is_loading());
        // "helloHi there" is two words: 1024 - 256 - 2 - 3 * 2
        assert_eq!(c.remaining_tokens(), TokenBudget::Remaining(760));
        assert_eq!(backend.prompts(), vec!["hello"]);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(matches!(
            seen.first(),
            Some(ConversationEvent::StateChanged(ConversationState::PromptSubmitted))
        ));
        assert!(seen.iter().any(|e| matches!(
            e,
            ConversationEvent::StateChanged(ConversationState::StreamingResponse)
        )));
        assert!(matches!(
            seen.last(),
            Some(ConversationEvent::StateChanged(ConversationState::Done))
        ));
    }

    #[tokio::test]
    async fn test_log_grows_by_two_per_turn() {
        let backend = ScriptedBackend::new();
        backend.reply_with(&["one"]);
        backend.fail_with(&[], "boom");
        backend.reply_with(&["three"]);
        let mut c = ready(&backend).await;

        for (turn, prompt) in ["a", "b", "c"].into_iter().enumerate() {
            c.send_message(prompt);
            c.run_until_idle().await;
            assert_eq!(c.messages().len(), 2 * (turn + 1));
            assert_eq!(c.state(), &ConversationState::Done);
        }
    }

    #[tokio::test]
    async fn test_partial_output_kept_on_failure() {
        let backend = ScriptedBackend::new();
        backend.fail_with(&["Hel", "lo"], "decode");
        let mut c = ready(&backend).await;

        c.send_message("hi");
        c.run_until_idle().await;

        let messages = c.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].text(), "Hello");
        assert_eq!(messages[1].participant(), Participant::System(SystemKind::Response));
        assert_eq!(messages[2].participant(), Participant::System(SystemKind::Error));
        assert_eq!(messages[2].text(), "Generation failed: Generation error: decode");
        assert_eq!(c.state(), &ConversationState::Done);
        assert!(matches!(c.remaining_tokens(), TokenBudget::Remaining(_)));
    }

    #[tokio::test]
    async fn test_empty_response_converted_in_place() {
        let backend = ScriptedBackend::new();
        backend.fail_with(&[], "boom");
        let mut c = ready(&backend).await;

        c.send_message("hi");
        c.run_until_idle().await;

        let messages = c.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].participant(), Participant::System(SystemKind::Error));
        assert!(messages[1].text().contains("boom"));
        assert!(!messages[1].is_loading());
        assert_eq!(c.state(), &ConversationState::Done);
    }

    #[tokio::test]
    async fn test_rejected_query_converted_in_place() {
        let backend = ScriptedBackend::new();
        let mut c = ready(&backend).await;
        backend.reject_prompts(true);

        c.send_message("hi");
        assert!(!c.is_turn_in_flight());
        assert_eq!(c.state(), &ConversationState::Done);
        assert_eq!(c.messages().len(), 2);
        assert_eq!(c.messages()[1].text(), "Query rejected: context is full");
        assert_eq!(c.messages()[1].participant(), Participant::System(SystemKind::Error));
        assert_eq!(c.remaining_tokens(), TokenBudget::Unknown);
    }

    #[tokio::test]
    async fn test_send_without_session_is_critical() {
        let backend = ScriptedBackend::new();
        let mut c = controller(&backend, missing_provider());

        c.send_message("hello");
        assert_eq!(
            c.state(),
            &ConversationState::CriticalError(InferenceError::SessionNotInitialized)
        );
        assert!(c.messages().is_empty());
    }

    #[tokio::test]
    async fn test_send_rejected_while_turn_in_flight() {
        let backend = ScriptedBackend::new();
        let mut c = ready(&backend).await;

        c.send_message("first");
        c.send_message("second");
        assert_eq!(c.messages().len(), 2);
        assert_eq!(backend.prompts(), vec!["first"]);
        assert_eq!(c.state(), &ConversationState::PromptSubmitted);
    }

    #[tokio::test]
    async fn test_budget_only_decreases_during_turn() {
        let backend = ScriptedBackend::new();
        backend.reply_with(&["ok"]);
        let mut c = ready(&backend).await;
        c.send_message("hi");
        c.run_until_idle().await;
        let start = c.remaining_tokens().remaining().unwrap();

        c.send_message("again");
        let tx = backend.take_sender().unwrap();
        let mut last = start;
        for chunk in ["a", "b", "c"] {
            tx.send(Ok(chunk.to_string())).unwrap();
            step(&mut c).await;
            assert_eq!(c.state(), &ConversationState::StreamingResponse);
            let now = c.remaining_tokens().remaining().unwrap();
            assert_eq!(now, last - 1);
            last = now;
        }

        drop(tx);
        step(&mut c).await;
        assert_eq!(c.state(), &ConversationState::Done);
        assert_eq!(c.messages()[3].text(), "abc");
    }

    #[tokio::test]
    async fn test_failed_token_count_keeps_estimate() {
        let backend = ScriptedBackend::new();
        backend.reply_with(&["ok"]);
        backend.reply_with(&["x", "y"]);
        let mut c = ready(&backend).await;
        c.send_message("hi");
        c.run_until_idle().await;
        let before = c.remaining_tokens().remaining().unwrap();

        backend.fail_token_count(true);
        c.send_message("more");
        c.run_until_idle().await;
        assert_eq!(c.remaining_tokens(), TokenBudget::Remaining(before - 2));
        assert_eq!(c.state(), &ConversationState::Done);
    }

    #[tokio::test]
    async fn test_token_exhaustion() {
        let backend = ScriptedBackend::new();
        let long: Vec<String> = (0..40).map(|_| "w ".to_string()).collect();
        let long: Vec<&str> = long.iter().map(String::as_str).collect();
        backend.reply_with(&long);
        let options = LifecycleOptions {
            max_tokens: 300,
            ..Default::default()
        };
        let mut c = controller_with(&backend, found_provider(), options);
        c.load_model().await;

        c.send_message("one two three");
        c.run_until_idle().await;
        assert_eq!(c.remaining_tokens(), TokenBudget::Remaining(0));
        assert_eq!(
            c.state(),
            &ConversationState::NonCriticalError(InferenceError::TokensExceeded)
        );
        assert!(c.interactions_disabled());
        assert!(c.new_chat_disabled());

        c.send_message("ignored");
        assert_eq!(c.messages().len(), 2);

        c.reset_state_after_error_intimation();
        assert_eq!(c.state(), &ConversationState::Done);
        assert!(c.interactions_disabled());
        assert!(!c.new_chat_disabled());
        c.send_message("still ignored");
        assert_eq!(c.messages().len(), 2);
        assert_eq!(c.state(), &ConversationState::Done);

        c.start_new_chat();
        assert_eq!(c.state(), &ConversationState::Done);
        assert!(c.messages().is_empty());
        assert_eq!(c.remaining_tokens(), TokenBudget::Unknown);
        assert!(!c.interactions_disabled());
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let backend = ScriptedBackend::new();
        let mut c = ready(&backend).await;

        c.reset_state_after_error_intimation();
        assert_eq!(c.state(), &ConversationState::Done);

        backend.fail_sessions(Some("busy"));
        c.start_new_chat();
        assert_eq!(error_kind(c.state()), Some(ErrorKind::Engine));
        assert!(matches!(c.state(), ConversationState::NonCriticalError(_)));
        assert!(c.has_session());

        c.reset_state_after_error_intimation();
        c.reset_state_after_error_intimation();
        assert_eq!(c.state(), &ConversationState::Done);
    }

    #[tokio::test]
    async fn test_stale_chunks_dropped_after_new_chat() {
        let backend = ScriptedBackend::new();
        let mut c = ready(&backend).await;

        c.send_message("hi");
        let tx = backend.take_sender().unwrap();
        tx.send(Ok("late".to_string())).unwrap();
        let stale = c.next_stream_event().await.unwrap();

        c.start_new_chat();
        assert!(!c.is_turn_in_flight());
        c.apply_stream_event(stale);

        assert!(c.messages().is_empty());
        assert_eq!(c.state(), &ConversationState::Done);
        assert_eq!(c.remaining_tokens(), TokenBudget::Unknown);
    }

    #[tokio::test]
    async fn test_clear_model_mid_stream() {
        let backend = ScriptedBackend::new();
        let mut c = ready(&backend).await;

        c.send_message("hi");
        let tx = backend.take_sender().unwrap();
        tx.send(Ok("partial".to_string())).unwrap();
        let stale = c.next_stream_event().await.unwrap();

        c.clear_model();
        c.apply_stream_event(stale);
        assert_eq!(c.state(), &ConversationState::LoadingModel);
        assert!(!c.has_session());
        assert_eq!(c.messages().len(), 2);
        assert_eq!(c.messages()[1].text(), "");

        c.start_new_chat();
        assert_eq!(
            c.state(),
            &ConversationState::CriticalError(InferenceError::SessionNotInitialized)
        );

        c.handle_model_download_completed().await;
        assert_eq!(c.state(), &ConversationState::Done);
        assert!(c.messages().is_empty());
        assert_eq!(backend.loads(), 2);
    }

    #[tokio::test]
    async fn test_download_completed_loads_model() {
        let backend = ScriptedBackend::new();
        let present = Arc::new(AtomicBool::new(false));
        let mut provider = MockProvider::new();
        let flag = present.clone();
        provider.expect_resolve_local_path().returning(move |category| {
            if flag.load(Ordering::SeqCst) {
                Ok(std::path::PathBuf::from(category.file_name()))
            } else {
                Err(crabble_engine::EngineError::ModelFileNotFound(category.file_name()))
            }
        });
        let mut c = controller(&backend, provider);
        let mut events = c.subscribe();

        c.load_model().await;
        assert_eq!(c.state(), &ConversationState::Idle);

        present.store(true, Ordering::SeqCst);
        c.handle_model_download_completed().await;
        assert!(!c.download_required());
        assert_eq!(c.state(), &ConversationState::Done);
        assert!(matches!(
            events.try_recv().unwrap(),
            ConversationEvent::DownloadRequiredChanged(false)
        ));
    }

    #[tokio::test]
    async fn test_send_prompt_renders_template() {
        let backend = ScriptedBackend::new();
        backend.reply_with(&["You can do it."]);
        let mut c = ready(&backend).await;

        c.send_prompt("I keep procrastinating", PromptType::Motivation);
        c.run_until_idle().await;

        let prompt = &backend.prompts()[0];
        assert!(prompt.contains("Context: I keep procrastinating"));
        assert_eq!(c.messages()[0].text(), prompt.as_str());
    }

    #[tokio::test]
    async fn test_snapshot_reflects_flags() {
        let backend = ScriptedBackend::new();
        let c = ready(&backend).await;
        let snapshot = c.snapshot();
        assert_eq!(snapshot.state, ConversationState::Done);
        assert!(!snapshot.interactions_disabled);
        assert!(!snapshot.new_chat_disabled);
        assert!(!snapshot.download_required);
        assert_eq!(snapshot.remaining_tokens.as_sentinel(), -1);
    }
}
