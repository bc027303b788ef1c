//! Chat commands: raw streams, one-shot chat, and orchestrated turns.
//!
//! `start_stream` / `chat` are thin wrappers over a provider. `send_message`
//! drives a conversation: the reply streams into a stored assistant message
//! and any tool-call envelope in it is executed by the orchestrator.

use serde::{Deserialize, Serialize};

use crate::agent_core::{ConversationMessage, MessageKind, SessionTarget, TurnSettings};
use crate::inference::types::{ChatRequest, ChatResponse, Role};
use crate::AppState;

/// Payload of `send_message`. Unset fields fall back to settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageResponse {
    pub conversation_id: String,
    pub user_message_id: String,
    pub stream_id: String,
    pub message_id: String,
}

/// Fill unset sampling parameters from settings.
fn with_defaults(state: &AppState, mut request: ChatRequest) -> ChatRequest {
    request.temperature = request.temperature.or(Some(state.settings.llm.temperature));
    request.max_tokens = request.max_tokens.or(Some(state.settings.llm.max_tokens));
    request
}

/// Start a token stream and return its id. Fragments arrive as push events.
///
/// The same messages double as the one-shot fallback if the stream stays
/// silent past the watchdog window.
pub async fn start_stream(state: &AppState, request: ChatRequest) -> Result<String, String> {
    let request = with_defaults(state, request);
    let fallback = request.messages.clone();
    state
        .streams
        .start(request, SessionTarget::Detached, Some(fallback))
        .map_err(|e| format!("{e}"))
}

/// Cancel a stream. Its final push event is `done`, not `error`.
///
/// Always acknowledged: a stop that races the stream's own end is not a
/// failure.
pub async fn stop_stream(state: &AppState, stream_id: String) -> Result<(), String> {
    if !state.streams.stop(&stream_id) {
        tracing::debug!(stream_id = %stream_id, "stop requested for inactive stream");
    }
    Ok(())
}

/// Non-streaming completion.
pub async fn chat(state: &AppState, request: ChatRequest) -> Result<ChatResponse, String> {
    let request = with_defaults(state, request);
    let provider = state
        .providers
        .get(&request.provider)
        .map_err(|e| format!("{e}"))?;
    provider.chat(&request).await.map_err(|e| format!("{e}"))
}

/// Append a user message and open an orchestrated assistant turn.
///
/// A new conversation is created when `conversation_id` is absent. The
/// provider and sampling settings of each message replace the stored ones,
/// so they apply to this turn and to the tool follow-ups it triggers.
pub async fn send_message(
    state: &AppState,
    request: SendMessageRequest,
) -> Result<SendMessageResponse, String> {
    let llm = &state.settings.llm;
    let settings = TurnSettings {
        provider: request.provider.unwrap_or_else(|| llm.provider.clone()),
        model: request.model.unwrap_or_else(|| llm.model.clone()),
        temperature: request.temperature.or(Some(llm.temperature)),
        max_tokens: request.max_tokens.or(Some(llm.max_tokens)),
    };

    let conversation_id = match request.conversation_id {
        Some(id) => {
            state.conversations.ensure(&id, settings);
            id
        }
        None => state.conversations.create(settings),
    };

    let user_message_id = state
        .conversations
        .append(&conversation_id, Role::User, MessageKind::Text, request.content)
        .map_err(|e| format!("Failed to save user message: {e}"))?;

    let turn = state
        .orchestrator
        .start_turn(&conversation_id)
        .await
        .map_err(|e| format!("{e}"))?;

    tracing::info!(
        conversation_id = %conversation_id,
        stream_id = %turn.stream_id,
        "user message sent"
    );

    Ok(SendMessageResponse {
        conversation_id,
        user_message_id,
        stream_id: turn.stream_id,
        message_id: turn.message_id,
    })
}

pub async fn get_conversation(
    state: &AppState,
    conversation_id: String,
) -> Result<Vec<ConversationMessage>, String> {
    state
        .conversations
        .get(&conversation_id)
        .map_err(|e| format!("{e}"))
}

/// Drop a conversation and its tool-call bookkeeping.
pub async fn delete_conversation(
    state: &AppState,
    conversation_id: String,
) -> Result<bool, String> {
    Ok(state.orchestrator.forget_conversation(&conversation_id))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
