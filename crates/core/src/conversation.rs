//! Conversation turns and the per-session conversation context

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Role in a conversation turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    /// User/caller message
    User,
    /// Assistant/agent message
    Assistant,
    /// System message (instructions)
    System,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::System => "system",
        }
    }
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single turn in the conversation
///
/// Turns are only created by [`ConversationContext::append`], which assigns the
/// sequence number, so a `Turn` value is always one that made it into a log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    /// Role of the speaker
    pub role: TurnRole,
    /// Content of the turn
    pub content: String,
    /// Position in the conversation, strictly increasing
    pub sequence: u64,
    /// When the turn was recorded
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn is_user(&self) -> bool {
        self.role == TurnRole::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == TurnRole::Assistant
    }

    pub fn is_system(&self) -> bool {
        self.role == TurnRole::System
    }
}

#[derive(Debug, Default)]
struct ContextLog {
    turns: Vec<Turn>,
    next_sequence: u64,
    sealed: bool,
}

/// Ordered, append-only log of turns for one session
///
/// Cloning yields another handle to the same log. Appends are serialized by
/// a single lock. Once [`seal`](Self::seal) has returned, every later append
/// is rejected and no sequence number is consumed.
#[derive(Debug, Clone, Default)]
pub struct ConversationContext {
    inner: Arc<Mutex<ContextLog>>,
}

impl ConversationContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context seeded with a system instruction
    pub fn with_system_prompt(prompt: impl Into<String>) -> Self {
        let context = Self::new();
        context.append(TurnRole::System, prompt);
        context
    }

    /// Append a turn, returning it with its assigned sequence number
    ///
    /// Returns `None` when the context is sealed.
    pub fn append(&self, role: TurnRole, content: impl Into<String>) -> Option<Turn> {
        let mut log = self.inner.lock();
        if log.sealed {
            tracing::debug!(role = %role, "Dropping append to sealed conversation context");
            return None;
        }

        let turn = Turn {
            role,
            content: content.into(),
            sequence: log.next_sequence,
            timestamp: Utc::now(),
        };
        log.next_sequence += 1;
        log.turns.push(turn.clone());
        Some(turn)
    }

    /// Copy of all turns in insertion order
    pub fn snapshot(&self) -> Vec<Turn> {
        self.inner.lock().turns.clone()
    }

    /// Number of turns
    pub fn len(&self) -> usize {
        self.inner.lock().turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most recent turn
    pub fn last(&self) -> Option<Turn> {
        self.inner.lock().turns.last().cloned()
    }

    /// Reject all further appends
    pub fn seal(&self) {
        self.inner.lock().sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.inner.lock().sealed
    }

    /// Whether two handles point at the same log
    pub fn same_log(&self, other: &ConversationContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
