//! Remaining-context bookkeeping for a chat session.

use serde::Serialize;
use std::fmt;

pub const DEFAULT_CONTROL_TOKENS_PER_MESSAGE: usize = 3;

/// Tokens still available to the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenBudget {
    /// No estimate yet, e.g. right after a new chat starts.
    #[default]
    Unknown,
    Remaining(usize),
}

impl TokenBudget {
    pub fn remaining(&self) -> Option<usize> {
        match self {
            TokenBudget::Unknown => None,
            TokenBudget::Remaining(n) => Some(*n),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, TokenBudget::Remaining(0))
    }

    /// One streamed chunk is counted as one token. Never goes below zero and
    /// leaves an unknown budget unknown.
    pub fn decrement(self) -> Self {
        match self {
            TokenBudget::Unknown => TokenBudget::Unknown,
            TokenBudget::Remaining(n) => TokenBudget::Remaining(n.saturating_sub(1)),
        }
    }

    /// `-1` for unknown, for consumers that expect a plain integer.
    pub fn as_sentinel(&self) -> i64 {
        match self {
            TokenBudget::Unknown => -1,
            TokenBudget::Remaining(n) => *n as i64,
        }
    }
}

impl fmt::Display for TokenBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenBudget::Unknown => f.write_str("unknown"),
            TokenBudget::Remaining(n) => write!(f, "{}", n),
        }
    }
}

/// Computes how much of the context window is left for further turns.
///
/// `remaining = max_tokens - decode_reserve - context_tokens - C * message_count`
/// floored at zero, where `C` is the chat-template overhead per message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenBudgetEstimator {
    max_tokens: usize,
    decode_reserve: usize,
    control_tokens_per_message: usize,
}

impl TokenBudgetEstimator {
    pub fn new(max_tokens: usize, decode_reserve: usize) -> Self {
        Self {
            max_tokens,
            decode_reserve,
            control_tokens_per_message: DEFAULT_CONTROL_TOKENS_PER_MESSAGE,
        }
    }

    pub fn with_control_tokens_per_message(mut self, tokens: usize) -> Self {
        self.control_tokens_per_message = tokens;
        self
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn remaining(&self, context_tokens: usize, message_count: usize) -> usize {
        self.max_tokens
            .saturating_sub(self.decode_reserve)
            .saturating_sub(context_tokens)
            .saturating_sub(self.control_tokens_per_message.saturating_mul(message_count))
    }

    pub fn estimate(&self, context_tokens: usize, message_count: usize) -> TokenBudget {
        TokenBudget::Remaining(self.remaining(context_tokens, message_count))
    }
}
