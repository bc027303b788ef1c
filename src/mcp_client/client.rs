//! MCP protocol client for a single server.
//!
//! Wraps an open transport with the `initialize` handshake and the typed
//! list/call/read/get operations. Holds no state beyond the handshake result.

use std::time::Duration;

use super::errors::McpError;
use super::transport::{extract_result, McpTransport};
use super::types::{
    InitializeResult, McpPromptDefinition, McpResourceDefinition, McpToolDefinition, ServerInfo,
    PROTOCOL_VERSION,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Timeout for the initialize handshake.
///
/// `npx`-launched servers may download their package on first start.
const INIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on pages followed for paginated list calls.
const MAX_LIST_PAGES: usize = 20;

// ─── McpClient ───────────────────────────────────────────────────────────────

pub struct McpClient {
    server_id: String,
    transport: Box<dyn McpTransport>,
    server_info: Option<ServerInfo>,
}

impl McpClient {
    /// Run the initialize handshake over `transport`.
    ///
    /// On failure the transport is closed before the error is returned.
    pub async fn connect(
        server_id: &str,
        transport: Box<dyn McpTransport>,
    ) -> Result<Self, McpError> {
        let handshake = async {
            let params = serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                },
            });
            let response = transport.request("initialize", Some(params)).await?;
            let result = extract_result(response)?;
            let init: InitializeResult =
                serde_json::from_value(result).map_err(|e| McpError::InitFailed {
                    server: server_id.to_string(),
                    reason: format!("failed to parse initialize response: {e}"),
                })?;
            transport.notify("notifications/initialized", None).await?;
            Ok::<_, McpError>(init)
        };

        let init = match tokio::time::timeout(INIT_TIMEOUT, handshake).await {
            Ok(Ok(init)) => init,
            Ok(Err(e)) => {
                transport.close().await;
                return Err(match e {
                    McpError::InitFailed { .. } => e,
                    other => McpError::InitFailed {
                        server: server_id.to_string(),
                        reason: other.to_string(),
                    },
                });
            }
            Err(_) => {
                transport.close().await;
                return Err(McpError::InitFailed {
                    server: server_id.to_string(),
                    reason: format!(
                        "initialization timed out after {}s",
                        INIT_TIMEOUT.as_secs()
                    ),
                });
            }
        };

        tracing::info!(
            server = server_id,
            protocol = init.protocol_version.as_deref().unwrap_or("unknown"),
            server_name = init
                .server_info
                .as_ref()
                .and_then(|i| i.name.as_deref())
                .unwrap_or("unknown"),
            "MCP server initialized"
        );

        Ok(Self {
            server_id: server_id.to_string(),
            transport,
            server_info: init.server_info,
        })
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.server_info.as_ref()
    }

    // ─── Catalogs ────────────────────────────────────────────────────────

    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>, McpError> {
        self.list_paginated("tools/list", "tools").await
    }

    pub async fn list_resources(&self) -> Result<Vec<McpResourceDefinition>, McpError> {
        self.list_paginated("resources/list", "resources").await
    }

    pub async fn list_prompts(&self) -> Result<Vec<McpPromptDefinition>, McpError> {
        self.list_paginated("prompts/list", "prompts").await
    }

    /// Follow `nextCursor` until exhausted, collecting `result[key]` items.
    async fn list_paginated<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        key: &str,
    ) -> Result<Vec<T>, McpError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_LIST_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let result = extract_result(self.transport.request(method, params).await?)?;

            let page = result
                .get(key)
                .cloned()
                .unwrap_or_else(|| serde_json::Value::Array(Vec::new()));
            let mut parsed: Vec<T> =
                serde_json::from_value(page).map_err(|e| McpError::Transport {
                    server: self.server_id.clone(),
                    reason: format!("malformed {method} response: {e}"),
                })?;
            items.append(&mut parsed);

            cursor = result
                .get("nextCursor")
                .and_then(|c| c.as_str())
                .map(String::from);
            if cursor.is_none() {
                break;
            }
        }

        Ok(items)
    }

    // ─── Operations ──────────────────────────────────────────────────────

    /// Invoke a tool and return the raw `tools/call` result.
    ///
    /// A JSON-RPC error or a result flagged `isError` becomes
    /// `ToolInvocation` carrying the server's message.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let response = self.transport.request("tools/call", Some(params)).await?;

        let result = extract_result(response).map_err(|e| McpError::ToolInvocation {
            server: self.server_id.clone(),
            tool: name.to_string(),
            reason: e.detail(),
        })?;

        if result.get("isError").and_then(|v| v.as_bool()) == Some(true) {
            return Err(McpError::ToolInvocation {
                server: self.server_id.clone(),
                tool: name.to_string(),
                reason: content_text(&result)
                    .unwrap_or_else(|| "tool reported an error".to_string()),
            });
        }

        Ok(result)
    }

    pub async fn read_resource(&self, uri: &str) -> Result<serde_json::Value, McpError> {
        let params = serde_json::json!({ "uri": uri });
        extract_result(self.transport.request("resources/read", Some(params)).await?)
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let mut params = serde_json::json!({ "name": name });
        if let Some(args) = arguments {
            params["arguments"] = args;
        }
        extract_result(self.transport.request("prompts/get", Some(params)).await?)
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

/// Join the `text` items of an MCP `content` array.
pub fn content_text(result: &serde_json::Value) -> Option<String> {
    let texts: Vec<&str> = result
        .get("content")?
        .as_array()?
        .iter()
        .filter_map(|item| item.get("text").and_then(|t| t.as_str()))
        .collect();
    if texts.is_empty() {
        None
    } else {
        Some(texts.join("\n"))
    }
}

// ─── Test Support ────────────────────────────────────────────────────────────


// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::fake::FakeTransport;
    use super::*;
    use crate::mcp_client::types::JsonRpcError;

    #[tokio::test]
    async fn test_connect_performs_handshake() {
        let fake = FakeTransport::filesystem();
        let client = McpClient::connect("fs", Box::new(fake.clone())).await.unwrap();
        assert_eq!(client.server_id(), "fs");
        assert_eq!(
            client.server_info().and_then(|i| i.name.as_deref()),
            Some("fake-fs")
        );

        let init = fake.calls_to("initialize");
        assert_eq!(init[0]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(fake.calls_to("notifications/initialized").len(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_closes_transport() {
        let fake = FakeTransport::new(|_, _| {
            Err(JsonRpcError {
                code: -32603,
                message: "boom".into(),
                data: None,
            })
        });
        let err = McpClient::connect("bad", Box::new(fake.clone()))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, McpError::InitFailed { .. }));
        assert!(err.to_string().contains("boom"));
        assert!(*fake.closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_list_tools_follows_cursor() {
        let fake = FakeTransport::new(|method, params| match method {
            "initialize" => Ok(serde_json::json!({})),
            "tools/list" if params.get("cursor").is_none() => Ok(serde_json::json!({
                "tools": [{"name": "a"}],
                "nextCursor": "page2"
            })),
            "tools/list" => Ok(serde_json::json!({ "tools": [{"name": "b"}] })),
            _ => Ok(serde_json::json!({})),
        });
        let client = McpClient::connect("p", Box::new(fake)).await.unwrap();
        let tools = client.list_tools().await.unwrap();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_call_tool_is_error_becomes_tool_invocation() {
        let client = McpClient::connect("fs", Box::new(FakeTransport::filesystem()))
            .await
            .unwrap();
        let err = client
            .call_tool("list_directory", serde_json::json!({}))
            .await
            .unwrap_err();
        match err {
            McpError::ToolInvocation { tool, reason, .. } => {
                assert_eq!(tool, "list_directory");
                assert_eq!(reason, "path: Required");
            }
            other => panic!("expected ToolInvocation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_call_tool_json_rpc_error_becomes_tool_invocation() {
        let client = McpClient::connect("fs", Box::new(FakeTransport::filesystem()))
            .await
            .unwrap();
        let fake = FakeTransport::new(|method, _| match method {
            "tools/call" => Err(JsonRpcError {
                code: -32602,
                message: "Unknown tool: nope".into(),
                data: None,
            }),
            _ => Ok(serde_json::json!({})),
        });
        let strict = McpClient::connect("strict", Box::new(fake)).await.unwrap();
        let err = strict
            .call_tool("nope", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.detail(), "Unknown tool: nope");

        let ok = client
            .call_tool("list_directory", serde_json::json!({"path": "."}))
            .await
            .unwrap();
        assert_eq!(content_text(&ok).as_deref(), Some("[FILE] a.txt in ."));
    }

    #[tokio::test]
    async fn test_get_prompt_passes_arguments() {
        let fake = FakeTransport::filesystem();
        let client = McpClient::connect("fs", Box::new(fake.clone())).await.unwrap();
        client
            .get_prompt("summarize", Some(serde_json::json!({"topic": "rust"})))
            .await
            .unwrap();
        let calls = fake.calls_to("prompts/get");
        assert_eq!(calls[0]["arguments"]["topic"], "rust");

        let read = client.read_resource("file:///tmp/ws/a.txt").await.unwrap();
        assert_eq!(read["contents"][0]["text"], "hello");
    }

    #[test]
    fn test_content_text_joins_text_items() {
        let result = serde_json::json!({
            "content": [
                {"type": "text", "text": "one"},
                {"type": "image", "data": "..."},
                {"type": "text", "text": "two"}
            ]
        });
        assert_eq!(content_text(&result).as_deref(), Some("one\ntwo"));
        assert!(content_text(&serde_json::json!({"content": []})).is_none());
    }
}
