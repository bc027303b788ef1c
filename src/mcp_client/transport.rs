//! Transport abstraction shared by the stdio and streamable-HTTP channels.
//!
//! A transport only moves JSON-RPC messages. It keeps no protocol state
//! beyond the open channel and never retries on its own.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use super::errors::McpError;
use super::http::StreamableHttpTransport;
use super::stdio::StdioTransport;
use super::types::{JsonRpcResponse, ServerConfig, TransportKind};

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Duplex JSON-RPC channel to a single MCP server.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a request and wait for the response carrying the same id.
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError>;

    /// Send a notification (no response expected).
    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError>;

    /// Close the channel. Best-effort; never fails.
    async fn close(&self);
}

/// Open the channel described by `config`.
///
/// Failures come back as values so the caller can record them per server.
pub async fn open_transport(
    server_id: &str,
    config: &ServerConfig,
) -> Result<Box<dyn McpTransport>, McpError> {
    match config.transport_kind() {
        TransportKind::Stdio => {
            let transport = StdioTransport::spawn(server_id, config).await?;
            Ok(Box::new(transport))
        }
        TransportKind::StreamableHttp => {
            let transport = StreamableHttpTransport::new(server_id, config)?;
            Ok(Box::new(transport))
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
