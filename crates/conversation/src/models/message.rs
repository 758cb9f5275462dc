//! Transcript entries shown in the chat list.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemKind {
    Response,
    Error,
}

/// Who a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Participant {
    User,
    System(SystemKind),
}

impl Participant {
    pub fn title(&self) -> &'static str {
        match self {
            Participant::User => "User",
            Participant::System(_) => "Model",
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, Participant::System(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    id: Uuid,
    text: String,
    participant: Participant,
    is_loading: bool,
    created_at: DateTime<Utc>,
}

impl ChatMessage {
    fn new(text: String, participant: Participant, is_loading: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            text,
            participant,
            is_loading,
            created_at: Utc::now(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(text.into(), Participant::User, false)
    }

    /// Empty system response waiting for its first token.
    pub fn response_placeholder() -> Self {
        Self::new(String::new(), Participant::System(SystemKind::Response), true)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(text.into(), Participant::System(SystemKind::Error), false)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn participant(&self) -> Participant {
        self.participant
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn title(&self) -> &'static str {
        if self.is_loading && self.participant == Participant::System(SystemKind::Response) {
            return "Generating....";
        }
        self.participant.title()
    }

    /// Appends a streamed chunk. Whitespace is trimmed only while the text
    /// is still empty. User messages are never streamed and are left as is.
    pub fn append_text(&mut self, chunk: &str) -> bool {
        if self.participant == Participant::User {
            return false;
        }

        if self.text.is_empty() {
            self.text.push_str(chunk.trim_start());
        } else {
            self.text.push_str(chunk);
        }
        self.is_loading = false;
        true
    }

    /// Moves a system message to another system variant.
    pub fn set_participant(&mut self, participant: Participant) -> bool {
        if !self.participant.is_system() || !participant.is_system() {
            return false;
        }
        self.participant = participant;
        true
    }

    /// Turns a still-empty response into an error bubble in place.
    pub fn mark_failed(&mut self, description: &str) -> bool {
        if !self.append_text(description) {
            return false;
        }
        self.set_participant(Participant::System(SystemKind::Error))
    }
}
