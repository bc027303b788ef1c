//! Agent Core: streaming chat orchestration.
//!
//! Submodules:
//! - `session`: Stream sessions (cancel tokens, watchdog, one-shot fallback)
//! - `orchestrator`: Detects tool-call envelopes and runs them exactly once
//! - `envelope`: Tolerant parser for the `{"mcp_tool": ...}` envelope
//! - `conversation`: In-memory conversation history
//! - `prompt`: System prompt and tool-result rendering
//! - `errors`: Agent-level error types

pub mod conversation;
pub mod envelope;
pub mod errors;
pub mod orchestrator;
pub mod prompt;
pub mod session;

// Re-exports for convenience
pub use conversation::{ConversationMessage, ConversationStore, MessageKind, TurnSettings};
pub use envelope::{parse_envelope, EnvelopeParse, ToolCallIntent};
pub use errors::AgentError;
pub use orchestrator::{ToolCallOrchestrator, ToolTurn, TurnHandle};
pub use session::{
    SessionEvent, SessionEventKind, SessionState, SessionTarget, StreamController,
};
