//! Agent Core error types.

use thiserror::Error;

use crate::inference::InferenceError;
use crate::mcp_client::McpError;

/// Errors that can occur during agent core operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// No live stream session with this id.
    #[error("stream not found: '{stream_id}'")]
    StreamNotFound { stream_id: String },

    /// Conversation id unknown to the store.
    #[error("conversation not found: '{conversation_id}'")]
    ConversationNotFound { conversation_id: String },

    /// The session was cancelled by its caller. Never shown as a failure.
    #[error("stream aborted")]
    Aborted,

    /// Provider or stream transport failure.
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// MCP registry or tool failure.
    #[error(transparent)]
    Mcp(#[from] McpError),
}

impl AgentError {
    /// True for user-initiated cancellation.
    pub fn is_aborted(&self) -> bool {
        matches!(self, AgentError::Aborted)
    }
}
