//! MCP client error types.

use thiserror::Error;

/// Errors that can occur while talking to MCP servers.
#[derive(Debug, Error)]
pub enum McpError {
    /// Opening or using the channel to a server failed (I/O, HTTP, framing).
    #[error("transport error for server '{server}': {reason}")]
    Transport {
        server: String,
        reason: String,
    },

    /// A stdio server process failed to start.
    #[error("failed to spawn server '{server}': {reason}")]
    SpawnFailed {
        server: String,
        reason: String,
    },

    /// The initialization handshake failed.
    #[error("server '{server}' initialization failed: {reason}")]
    InitFailed {
        server: String,
        reason: String,
    },

    /// Operation against a server that is absent or not connected.
    #[error("MCP server not connected: {server}")]
    NotConnected {
        server: String,
    },

    /// The tool ran but reported a failure, or the call was rejected.
    #[error("tool '{tool}' on server '{server}' failed: {reason}")]
    ToolInvocation {
        server: String,
        tool: String,
        reason: String,
    },

    /// An operation exceeded its time budget.
    #[error("{operation} on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Invalid server configuration (missing command, bad header, unreadable file).
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl McpError {
    /// The human-readable message carried by a server-side failure, without
    /// the wrapping context. Used when folding tool failures into a conversation.
    pub fn detail(&self) -> String {
        match self {
            McpError::ToolInvocation { reason, .. } => reason.clone(),
            McpError::ServerError { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
