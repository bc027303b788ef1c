//! ConversationStore: in-memory conversation history.
//!
//! Responsibilities:
//! - Keep ordered messages per conversation, each with a stable id
//! - Let stream sessions rewrite the content of their target message
//! - Seal messages that the orchestrator has rewritten into annotations,
//!   so late stream flushes cannot overwrite them
//! - Build `Vec<ChatMessage>` for the next provider request
//!
//! Nothing here is persisted; state lives for the process lifetime.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::inference::types::{ChatMessage, Role};

use super::errors::AgentError;

// ─── Types ───────────────────────────────────────────────────────────────────

/// What a stored message represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Ordinary user or model text.
    Text,
    /// Human-readable annotation that replaced a tool-call envelope.
    ToolCall,
    /// Rendered tool output fed back to the model.
    ToolResult,
    /// A visible failure notice. Not sent to the model.
    Error,
    /// "No output" marker left by the watchdog. Not sent to the model.
    Placeholder,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub kind: MessageKind,
    /// Sealed messages ignore further content writes.
    pub sealed: bool,
    pub created_at: String,
}

/// Provider and sampling settings reused for follow-up turns.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnSettings {
    pub provider: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
struct Conversation {
    messages: Vec<ConversationMessage>,
    settings: TurnSettings,
}

// ─── ConversationStore ───────────────────────────────────────────────────────

#[derive(Default)]
pub struct ConversationStore {
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Conversation>> {
        self.conversations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a conversation if absent and set its turn settings.
    pub fn ensure(&self, conversation_id: &str, settings: TurnSettings) {
        let mut map = self.lock();
        map.entry(conversation_id.to_string())
            .and_modify(|c| c.settings = settings.clone())
            .or_insert_with(|| Conversation {
                messages: Vec::new(),
                settings,
            });
    }

    /// Create a new conversation with a generated id.
    pub fn create(&self, settings: TurnSettings) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.ensure(&id, settings);
        id
    }

    pub fn settings(&self, conversation_id: &str) -> Result<TurnSettings, AgentError> {
        self.lock()
            .get(conversation_id)
            .map(|c| c.settings.clone())
            .ok_or_else(|| not_found(conversation_id))
    }

    /// Append a message and return its id.
    pub fn append(
        &self,
        conversation_id: &str,
        role: Role,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Result<String, AgentError> {
        let mut map = self.lock();
        let conv = map
            .get_mut(conversation_id)
            .ok_or_else(|| not_found(conversation_id))?;
        let id = uuid::Uuid::new_v4().to_string();
        conv.messages.push(ConversationMessage {
            id: id.clone(),
            role,
            content: content.into(),
            kind,
            sealed: false,
            created_at: chrono::Utc::now().to_rfc3339(),
        });
        Ok(id)
    }

    /// Overwrite a message's content. Returns `false` when the message is
    /// sealed or missing.
    pub fn replace_content(&self, conversation_id: &str, message_id: &str, content: &str) -> bool {
        self.with_open_message(conversation_id, message_id, |msg| {
            msg.content = content.to_string();
            if msg.kind == MessageKind::Placeholder {
                msg.kind = MessageKind::Text;
            }
        })
    }

    /// Show `text` as a placeholder while the message has no content yet.
    pub fn set_placeholder(&self, conversation_id: &str, message_id: &str, text: &str) -> bool {
        self.with_open_message(conversation_id, message_id, |msg| {
            if msg.content.is_empty() {
                msg.kind = MessageKind::Placeholder;
                msg.content = text.to_string();
            }
        })
    }

    /// Append to a message's content. Returns `false` when the message is
    /// sealed or missing.
    pub fn append_content(&self, conversation_id: &str, message_id: &str, delta: &str) -> bool {
        self.with_open_message(conversation_id, message_id, |msg| {
            msg.content.push_str(delta);
        })
    }

    /// Rewrite a message as `kind` with `content` and seal it.
    pub fn seal(
        &self,
        conversation_id: &str,
        message_id: &str,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> bool {
        let content = content.into();
        self.with_open_message(conversation_id, message_id, move |msg| {
            msg.kind = kind;
            msg.content = content;
            msg.sealed = true;
        })
    }

    fn with_open_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        f: impl FnOnce(&mut ConversationMessage),
    ) -> bool {
        let mut map = self.lock();
        let Some(msg) = map
            .get_mut(conversation_id)
            .and_then(|c| c.messages.iter_mut().find(|m| m.id == message_id))
        else {
            return false;
        };
        if msg.sealed {
            return false;
        }
        f(msg);
        true
    }

    pub fn message(&self, conversation_id: &str, message_id: &str) -> Option<ConversationMessage> {
        self.lock()
            .get(conversation_id)?
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .cloned()
    }

    /// All messages of a conversation, in order.
    pub fn get(&self, conversation_id: &str) -> Result<Vec<ConversationMessage>, AgentError> {
        self.lock()
            .get(conversation_id)
            .map(|c| c.messages.clone())
            .ok_or_else(|| not_found(conversation_id))
    }

    /// Messages to send to the model: errors, placeholders and empty
    /// messages are left out.
    pub fn snapshot(&self, conversation_id: &str) -> Result<Vec<ChatMessage>, AgentError> {
        let map = self.lock();
        let conv = map
            .get(conversation_id)
            .ok_or_else(|| not_found(conversation_id))?;
        Ok(conv
            .messages
            .iter()
            .filter(|m| !matches!(m.kind, MessageKind::Error | MessageKind::Placeholder))
            .filter(|m| !m.content.trim().is_empty())
            .map(|m| ChatMessage {
                role: m.role,
                content: m.content.clone(),
            })
            .collect())
    }

    pub fn remove(&self, conversation_id: &str) -> bool {
        self.lock().remove(conversation_id).is_some()
    }
}

fn not_found(conversation_id: &str) -> AgentError {
    AgentError::ConversationNotFound {
        conversation_id: conversation_id.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
