//! Tool-call orchestrator: turns model-emitted envelopes into MCP calls.
//!
//! Flow for one conversation turn:
//! 1. **Open**: build the system prompt from the live tool catalog, append
//!    an empty assistant message, start a stream session targeting it
//! 2. **Observe**: every session event updates the target message; content
//!    and done events are scanned for a tool-call envelope
//! 3. **Execute**: on the first envelope in a message, the message becomes
//!    a tool-call annotation, the tool runs through the registry, the
//!    rendered result is appended, and a follow-up turn is opened
//!
//! An envelope is acted on at most once per message id, and a single
//! process-wide in-flight flag keeps two tool calls from being triggered at
//! the same time. Failed calls leave an error annotation and are never
//! retried automatically.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::task::JoinHandle;

use crate::inference::config::expand_tilde;
use crate::inference::types::{ChatMessage, ChatRequest, Role};
use crate::mcp_client::McpRegistry;

use super::conversation::{ConversationStore, MessageKind};
use super::envelope::{parse_envelope, EnvelopeParse, ToolCallIntent};
use super::errors::AgentError;
use super::prompt::{build_system_prompt, render_tool_result, FOLLOW_UP_INSTRUCTION};
use super::session::{SessionEvent, SessionEventKind, SessionTarget, StreamController};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Maximum tool calls triggered from one user message.
///
/// A model that keeps emitting envelopes in its follow-ups would otherwise
/// loop forever; the counter resets on every user turn.
pub const MAX_TOOL_ROUNDS: usize = 10;

/// Tools that list a directory and default to the workspace root.
const DIRECTORY_TOOLS: &[&str] = &[
    "list_directory",
    "list_directory_with_sizes",
    "directory_tree",
    "list_dir",
];

/// Argument keys that hold filesystem paths.
const PATH_KEYS: &[&str] = &["path", "source", "destination"];

// ─── Types ───────────────────────────────────────────────────────────────────

/// The stream and message of an opened turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnHandle {
    pub stream_id: String,
    pub message_id: String,
}

/// How a triggered tool call ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolTurn {
    /// The tool succeeded and a follow-up turn is streaming.
    FollowUp(TurnHandle),
    /// The call (or opening the follow-up) failed; the turn stops here.
    Failed { reason: String },
}

/// Clears the in-flight flag when the execution task ends.
struct InFlightGuard(Arc<AtomicBool>);

impl InFlightGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(Arc::clone(flag)))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// ─── ToolCallOrchestrator ────────────────────────────────────────────────────

pub struct ToolCallOrchestrator {
    registry: Arc<McpRegistry>,
    streams: Arc<StreamController>,
    conversations: Arc<ConversationStore>,
    /// Message ids whose envelope has already been acted on, per conversation.
    handled: Mutex<HashMap<String, HashSet<String>>>,
    /// Envelopes seen while another call was in flight: message id to
    /// conversation id. Re-scanned when the in-flight call finishes.
    deferred: Mutex<HashMap<String, String>>,
    /// Tool calls triggered per conversation since the last user turn.
    rounds: Mutex<HashMap<String, usize>>,
    in_flight: Arc<AtomicBool>,
}

impl ToolCallOrchestrator {
    pub fn new(
        registry: Arc<McpRegistry>,
        streams: Arc<StreamController>,
        conversations: Arc<ConversationStore>,
    ) -> Self {
        Self {
            registry,
            streams,
            conversations,
            handled: Mutex::new(HashMap::new()),
            deferred: Mutex::new(HashMap::new()),
            rounds: Mutex::new(HashMap::new()),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn tool_call_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    // ─── Turns ───────────────────────────────────────────────────────────

    /// Open the assistant turn that answers the latest user message.
    pub async fn start_turn(&self, conversation_id: &str) -> Result<TurnHandle, AgentError> {
        lock(&self.rounds).remove(conversation_id);
        self.open_turn(conversation_id, None).await
    }

    /// Build the prompt, append an empty assistant message, and stream into it.
    ///
    /// The same messages are registered as the non-streaming fallback.
    async fn open_turn(
        &self,
        conversation_id: &str,
        instruction: Option<&str>,
    ) -> Result<TurnHandle, AgentError> {
        let settings = self.conversations.settings(conversation_id)?;
        let tools = self.registry.list_tools().await;

        let mut messages = vec![ChatMessage::system(build_system_prompt(&tools))];
        messages.extend(self.conversations.snapshot(conversation_id)?);
        if let Some(instruction) = instruction {
            messages.push(ChatMessage::user(instruction));
        }

        let message_id =
            self.conversations
                .append(conversation_id, Role::Assistant, MessageKind::Text, "")?;

        let request = ChatRequest {
            provider: settings.provider,
            model: settings.model,
            messages: messages.clone(),
            temperature: settings.temperature,
            max_tokens: settings.max_tokens,
        };
        let stream_id = self.streams.start(
            request,
            SessionTarget::message(conversation_id, &message_id),
            Some(messages),
        )?;

        tracing::debug!(
            conversation_id = %conversation_id,
            stream_id = %stream_id,
            tool_count = tools.len(),
            follow_up = instruction.is_some(),
            "turn opened"
        );
        Ok(TurnHandle {
            stream_id,
            message_id,
        })
    }

    // ─── Observation ─────────────────────────────────────────────────────

    /// Apply a session event to its target message and look for a tool call.
    ///
    /// Returns the execution task when this event triggered one.
    pub fn observe(self: &Arc<Self>, event: &SessionEvent) -> Option<JoinHandle<ToolTurn>> {
        let SessionTarget::Message {
            conversation_id,
            message_id,
        } = &event.target
        else {
            return None;
        };

        match &event.kind {
            SessionEventKind::Content { buffer, .. } => {
                self.conversations
                    .replace_content(conversation_id, message_id, buffer);
                self.inspect(conversation_id, message_id, buffer)
            }
            SessionEventKind::Done { content } => {
                self.conversations
                    .replace_content(conversation_id, message_id, content);
                self.inspect(conversation_id, message_id, content)
            }
            SessionEventKind::Placeholder { text } => {
                self.conversations
                    .set_placeholder(conversation_id, message_id, text);
                None
            }
            SessionEventKind::Error { message } => {
                let _ = self.conversations.append(
                    conversation_id,
                    Role::Assistant,
                    MessageKind::Error,
                    format!("Request failed: {message}"),
                );
                None
            }
            SessionEventKind::Aborted => None,
        }
    }

    /// Scan `text` for an envelope and trigger it if this message has not
    /// been handled and no other tool call is in flight.
    pub fn inspect(
        self: &Arc<Self>,
        conversation_id: &str,
        message_id: &str,
        text: &str,
    ) -> Option<JoinHandle<ToolTurn>> {
        let EnvelopeParse::Parsed(intent) = parse_envelope(text) else {
            return None;
        };

        if self.is_handled(conversation_id, message_id) {
            return None;
        }

        let Some(guard) = InFlightGuard::acquire(&self.in_flight) else {
            tracing::debug!(
                message_id = %message_id,
                tool = %intent.qualified_name(),
                "tool call already in flight, deferring"
            );
            lock(&self.deferred).insert(message_id.to_string(), conversation_id.to_string());
            return None;
        };
        lock(&self.deferred).remove(message_id);

        if !self.mark_handled(conversation_id, message_id) {
            return None;
        }

        if !self.take_round(conversation_id) {
            tracing::warn!(
                conversation_id = %conversation_id,
                max_rounds = MAX_TOOL_ROUNDS,
                "tool round limit reached, leaving envelope as text"
            );
            return None;
        }

        self.conversations.seal(
            conversation_id,
            message_id,
            MessageKind::ToolCall,
            describe_call(&intent),
        );
        tracing::info!(
            conversation_id = %conversation_id,
            message_id = %message_id,
            server = %intent.server_id,
            tool = %intent.name,
            "tool call detected"
        );

        let this = Arc::clone(self);
        let conversation_id = conversation_id.to_string();
        Some(tokio::spawn(async move {
            let turn = this.execute(&conversation_id, intent).await;
            drop(guard);
            this.resume_deferred();
            turn
        }))
    }

    /// Re-scan messages whose envelope arrived while the flag was held.
    ///
    /// Their streams may already be done, so no later event would pick
    /// them up. The first one that triggers takes the flag again; the rest
    /// stay deferred until it finishes.
    fn resume_deferred(self: &Arc<Self>) {
        let pending = std::mem::take(&mut *lock(&self.deferred));
        for (message_id, conversation_id) in pending {
            let Some(message) = self.conversations.message(&conversation_id, &message_id) else {
                continue;
            };
            if self
                .inspect(&conversation_id, &message_id, &message.content)
                .is_some()
            {
                tracing::info!(
                    conversation_id = %conversation_id,
                    message_id = %message_id,
                    "deferred tool call resumed"
                );
            }
        }
    }

    fn is_handled(&self, conversation_id: &str, message_id: &str) -> bool {
        lock(&self.handled)
            .get(conversation_id)
            .is_some_and(|ids| ids.contains(message_id))
    }

    /// Returns `false` if the message was already marked.
    fn mark_handled(&self, conversation_id: &str, message_id: &str) -> bool {
        lock(&self.handled)
            .entry(conversation_id.to_string())
            .or_default()
            .insert(message_id.to_string())
    }

    /// Delete a conversation along with its tool-call bookkeeping.
    pub fn forget_conversation(&self, conversation_id: &str) -> bool {
        lock(&self.handled).remove(conversation_id);
        lock(&self.rounds).remove(conversation_id);
        lock(&self.deferred).retain(|_, conv| conv != conversation_id);
        self.conversations.remove(conversation_id)
    }

    fn take_round(&self, conversation_id: &str) -> bool {
        let mut rounds = lock(&self.rounds);
        let used = rounds.entry(conversation_id.to_string()).or_default();
        if *used >= MAX_TOOL_ROUNDS {
            return false;
        }
        *used += 1;
        true
    }

    // ─── Execution ───────────────────────────────────────────────────────

    async fn execute(&self, conversation_id: &str, intent: ToolCallIntent) -> ToolTurn {
        let arguments = normalize_arguments(&intent.name, intent.arguments.clone());

        let result = self
            .registry
            .call_tool(&intent.server_id, &intent.name, arguments)
            .await;

        match result {
            Ok(value) => {
                let text = render_tool_result(&intent.name, &value);
                match self.follow_up(conversation_id, text).await {
                    Ok(handle) => ToolTurn::FollowUp(handle),
                    Err(e) => {
                        tracing::warn!(
                            conversation_id = %conversation_id,
                            error = %e,
                            "failed to open follow-up turn"
                        );
                        self.annotate_failure(conversation_id, &format!("Follow-up failed: {e}"));
                        ToolTurn::Failed {
                            reason: e.to_string(),
                        }
                    }
                }
            }
            Err(e) => {
                let reason = e.detail();
                self.annotate_failure(
                    conversation_id,
                    &format!("Tool `{}` failed: {reason}", intent.qualified_name()),
                );
                ToolTurn::Failed { reason }
            }
        }
    }

    /// Append the rendered result and open the turn that answers with it.
    async fn follow_up(
        &self,
        conversation_id: &str,
        result_text: String,
    ) -> Result<TurnHandle, AgentError> {
        self.conversations.append(
            conversation_id,
            Role::Assistant,
            MessageKind::ToolResult,
            result_text,
        )?;
        self.open_turn(conversation_id, Some(FOLLOW_UP_INSTRUCTION))
            .await
    }

    fn annotate_failure(&self, conversation_id: &str, text: &str) {
        let _ = self
            .conversations
            .append(conversation_id, Role::Assistant, MessageKind::Error, text);
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fill in arguments the model commonly omits.
///
/// - directory listings get `path: "."` when no path is given
/// - `~` in path-like arguments is expanded to the home directory
pub fn normalize_arguments(tool: &str, arguments: serde_json::Value) -> serde_json::Value {
    let mut map = match arguments {
        serde_json::Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };

    if DIRECTORY_TOOLS.contains(&tool) {
        let missing = map
            .get("path")
            .and_then(|v| v.as_str())
            .map_or(true, |p| p.trim().is_empty());
        if missing {
            map.insert("path".into(), serde_json::Value::String(".".into()));
        }
    }

    for key in PATH_KEYS {
        if let Some(serde_json::Value::String(path)) = map.get_mut(*key) {
            *path = expand_tilde(path);
        }
    }

    serde_json::Value::Object(map)
}

/// Human-readable annotation that replaces the envelope in the message.
fn describe_call(intent: &ToolCallIntent) -> String {
    let path = |key: &str| {
        intent
            .arguments
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("<unknown>")
            .to_string()
    };

    let detail = match intent.name.as_str() {
        "list_directory" | "list_directory_with_sizes" | "directory_tree" | "list_dir" => {
            let target = intent
                .arguments
                .get("path")
                .and_then(|v| v.as_str())
                .unwrap_or(".");
            format!("List directory: {target}")
        }
        "read_file" | "read_text_file" => format!("Read file: {}", path("path")),
        "write_file" => format!("Write to file: {}", path("path")),
        "move_file" => format!("Move: {} → {}", path("source"), path("destination")),
        _ => format!("Arguments: {}", intent.arguments),
    };
    format!("Calling tool `{}`\n{detail}", intent.qualified_name())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
