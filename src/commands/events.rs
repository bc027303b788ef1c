//! Push events delivered to the UI, and the pump that produces them.
//!
//! Every session event first goes through the orchestrator (which updates
//! the conversation and may trigger a tool call), then is translated into
//! a `StreamPushEvent` for the frontend.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::agent_core::{SessionEvent, SessionEventKind, ToolCallOrchestrator};

/// One fragment or terminus of a stream: `{streamId, content?, done?, error?}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamPushEvent {
    pub stream_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StreamPushEvent {
    pub fn content(stream_id: &str, content: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            content: Some(content.into()),
            done: None,
            error: None,
        }
    }

    pub fn done(stream_id: &str) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            content: None,
            done: Some(true),
            error: None,
        }
    }

    pub fn error(stream_id: &str, error: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            content: None,
            done: None,
            error: Some(error.into()),
        }
    }
}

/// Translate a session event. Placeholders stay inside the conversation.
///
/// A user stop ends with `done`, never `error`.
pub fn to_push_event(event: &SessionEvent) -> Option<StreamPushEvent> {
    let id = event.stream_id.as_str();
    match &event.kind {
        SessionEventKind::Content { delta, .. } => Some(StreamPushEvent::content(id, delta.clone())),
        SessionEventKind::Placeholder { .. } => None,
        SessionEventKind::Done { .. } | SessionEventKind::Aborted => Some(StreamPushEvent::done(id)),
        SessionEventKind::Error { message } => Some(StreamPushEvent::error(id, message.clone())),
    }
}

/// Drain session events until every sender is gone.
pub fn spawn_event_pump(
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
    orchestrator: Arc<ToolCallOrchestrator>,
    push: mpsc::UnboundedSender<StreamPushEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            // Detached: the tool task reports back through the conversation.
            if let Some(_task) = orchestrator.observe(&event) {
                tracing::debug!(stream_id = %event.stream_id, "tool call task spawned");
            }

            if let Some(push_event) = to_push_event(&event) {
                if push.send(push_event).is_err() {
                    tracing::debug!(stream_id = %event.stream_id, "push receiver dropped");
                }
            }
        }
        tracing::debug!("session event pump stopped");
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
