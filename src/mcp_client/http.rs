//! Streamable-HTTP transport.
//!
//! Every JSON-RPC message is POSTed to the server URL. The server answers
//! either with a plain JSON body or with a `text/event-stream` whose `data:`
//! payloads carry JSON-RPC messages. The `mcp-session-id` header handed out
//! by the server is echoed on every later request.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::Client as HttpClient;

use super::errors::McpError;
use super::transport::{next_request_id, McpTransport};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerConfig};

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const SESSION_HEADER: &str = "mcp-session-id";

pub struct StreamableHttpTransport {
    server_name: String,
    url: String,
    headers: HeaderMap,
    http: HttpClient,
    session_id: std::sync::Mutex<Option<String>>,
}

impl StreamableHttpTransport {
    /// Build the transport. No network I/O happens until the first request.
    pub fn new(server_name: &str, config: &ServerConfig) -> Result<Self, McpError> {
        let url = config
            .url
            .clone()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| McpError::ConfigError {
                reason: format!("missing url for HTTP MCP server '{server_name}'"),
            })?;

        let headers = build_header_map(&config.headers)?;

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| McpError::Transport {
                server: server_name.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            server_name: server_name.to_string(),
            url,
            headers,
            http,
            session_id: std::sync::Mutex::new(None),
        })
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::Transport {
            server: self.server_name.clone(),
            reason,
        }
    }

    fn current_session(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|s| s.clone())
    }

    fn remember_session(&self, headers: &HeaderMap) {
        let Some(value) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) else {
            return;
        };
        if let Ok(mut slot) = self.session_id.lock() {
            *slot = Some(value.to_string());
        }
    }

    /// POST one message and return the raw response after status checking.
    async fn post(&self, body: &serde_json::Value) -> Result<reqwest::Response, McpError> {
        let mut req = self
            .http
            .post(&self.url)
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session) = self.current_session() {
            req = req.header(SESSION_HEADER, session);
        }

        let response = req.send().await.map_err(|e| {
            let kind = if e.is_connect() {
                "connection failed"
            } else if e.is_timeout() {
                "request timed out"
            } else {
                "request failed"
            };
            self.transport_error(format!("{kind}: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(self.transport_error(format!("HTTP {}: {body_text}", status.as_u16())));
        }

        self.remember_session(response.headers());
        Ok(response)
    }

    /// Read an event-stream body until the response for `id` shows up.
    async fn read_event_stream(
        &self,
        response: reqwest::Response,
        id: u64,
    ) -> Result<JsonRpcResponse, McpError> {
        let mut lines = SseLineBuffer::default();
        let mut bytes = response.bytes_stream();

        while let Some(chunk) = bytes.next().await {
            let chunk =
                chunk.map_err(|e| self.transport_error(format!("stream read error: {e}")))?;
            for line in lines.push(&chunk) {
                if let Some(resp) = match_sse_response(&line, id) {
                    return Ok(resp);
                }
            }
        }
        for line in lines.finish() {
            if let Some(resp) = match_sse_response(&line, id) {
                return Ok(resp);
            }
        }

        Err(self.transport_error(format!(
            "event stream ended without a response for request {id}"
        )))
    }
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let body = serde_json::to_value(JsonRpcRequest::new(id, method, params))
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;

        let response = self.post(&body).await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if is_event_stream_content_type(&content_type) {
            return self.read_event_stream(response, id).await;
        }

        let text = response
            .text()
            .await
            .map_err(|e| self.transport_error(format!("failed to read response body: {e}")))?;
        serde_json::from_str::<JsonRpcResponse>(&text)
            .map_err(|e| self.transport_error(format!("invalid JSON-RPC response: {e}")))
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let body = serde_json::to_value(JsonRpcNotification::new(method, params)).map_err(|e| {
            self.transport_error(format!("failed to serialize notification: {e}"))
        })?;
        // 202 Accepted with an empty body is the normal answer.
        self.post(&body).await.map(|_| ())
    }

    async fn close(&self) {
        let Some(session) = self.current_session() else {
            return;
        };
        let result = self
            .http
            .delete(&self.url)
            .headers(self.headers.clone())
            .header(SESSION_HEADER, session)
            .send()
            .await;
        if let Err(e) = result {
            tracing::debug!(server = %self.server_name, error = %e, "session DELETE failed");
        }
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn build_header_map(headers: &HashMap<String, String>) -> Result<HeaderMap, McpError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| McpError::ConfigError {
                reason: format!("invalid header name '{name}': {e}"),
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| McpError::ConfigError {
            reason: format!("invalid value for header '{name}': {e}"),
        })?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

/// Parse a `data:` line and keep it only if it is the response for `id`.
fn match_sse_response(line: &str, id: u64) -> Option<JsonRpcResponse> {
    let payload = line.strip_prefix("data:")?.trim();
    serde_json::from_str::<JsonRpcResponse>(payload)
        .ok()
        .filter(|resp| resp.id == id)
}

/// Splits a byte stream into trimmed, non-empty text lines.
#[derive(Default)]
struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut start = 0;

        while let Some(offset) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            if let Ok(text) = std::str::from_utf8(&self.buffer[start..end]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            start = end + 1;
        }

        if flush {
            if let Ok(text) = std::str::from_utf8(&self.buffer[start..]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            self.buffer.clear();
        } else if start > 0 {
            self.buffer.drain(..start);
        }

        lines
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_http::Reply;

    #[test]
    fn test_new_requires_url() {
        let err = StreamableHttpTransport::new("remote", &ServerConfig::default())
            .err()
            .unwrap();
        assert!(err.to_string().contains("missing url"));
    }

    #[test]
    fn test_invalid_header_is_config_error() {
        let config = ServerConfig {
            url: Some("http://localhost:1/mcp".into()),
            headers: HashMap::from([("bad header".to_string(), "x".to_string())]),
            ..Default::default()
        };
        let err = StreamableHttpTransport::new("remote", &config).err().unwrap();
        assert!(matches!(err, McpError::ConfigError { .. }));
    }

    #[test]
    fn test_event_stream_content_type_detection() {
        assert!(is_event_stream_content_type("text/event-stream"));
        assert!(is_event_stream_content_type("Text/Event-Stream; charset=utf-8"));
        assert!(!is_event_stream_content_type("application/json"));
        assert!(!is_event_stream_content_type(""));
    }

    #[test]
    fn test_line_buffer_handles_split_chunks() {
        let mut buf = SseLineBuffer::default();
        assert_eq!(
            buf.push(b"event: message\r\ndata: {\"jsonrpc\":"),
            vec!["event: message"]
        );
        let lines = buf.push(b"\"2.0\",\"id\":7,\"result\":{}}\n\n");
        assert_eq!(lines, vec![r#"data: {"jsonrpc":"2.0","id":7,"result":{}}"#]);
        assert!(buf.finish().is_empty());
    }

    #[test]
    fn test_match_sse_response_filters_by_id() {
        let line = r#"data: {"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#;
        assert!(match_sse_response(line, 7).is_some());
        assert!(match_sse_response(line, 8).is_none());
        assert!(match_sse_response("event: message", 7).is_none());
        assert!(match_sse_response(r#"data: {"jsonrpc":"2.0","method":"notifications/progress"}"#, 7).is_none());
    }

    #[tokio::test]
    async fn test_request_to_unreachable_server_is_transport_error() {
        let config = ServerConfig {
            url: Some("http://127.0.0.1:9/mcp".into()),
            ..Default::default()
        };
        let transport = StreamableHttpTransport::new("remote", &config).unwrap();
        let err = transport.request("initialize", None).await.unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }));
    }

    #[tokio::test]
    async fn test_session_round_trip_against_stub_server() {
        use crate::test_http::serve;

        let (base, server) = serve(vec![
            Reply::json(r#"{"jsonrpc":"2.0","id":$ID,"result":{"protocolVersion":"2025-03-26"}}"#)
                .header(SESSION_HEADER, "sess-42"),
            Reply::empty(202),
            Reply::event_stream(concat!(
                "event: message\n",
                "data: {\"jsonrpc\":\"2.0\",\"method\":\"notifications/progress\",\"params\":{}}\n\n",
                "data: {\"jsonrpc\":\"2.0\",\"id\":999999999,\"result\":{}}\n\n",
                "event: message\n",
                "data: {\"jsonrpc\":\"2.0\",\"id\":$ID,\"result\":{\"tools\":[]}}\n\n",
            )),
            Reply::empty(200),
        ])
        .await;

        let config = ServerConfig {
            url: Some(format!("{base}/mcp")),
            headers: HashMap::from([("x-api-key".to_string(), "secret".to_string())]),
            ..Default::default()
        };
        let transport = StreamableHttpTransport::new("remote", &config).unwrap();

        let init = transport.request("initialize", None).await.unwrap();
        assert_eq!(init.result.unwrap()["protocolVersion"], "2025-03-26");
        assert_eq!(transport.current_session().as_deref(), Some("sess-42"));

        transport
            .notify("notifications/initialized", None)
            .await
            .unwrap();

        let listed = transport.request("tools/list", None).await.unwrap();
        assert_ne!(listed.id, 999999999);
        assert_eq!(listed.result.unwrap()["tools"], serde_json::json!([]));

        transport.close().await;

        let seen = server.await.unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen.iter().all(|r| r.path == "/mcp"));
        assert!(seen.iter().all(|r| r.header("x-api-key") == Some("secret")));

        assert_eq!(seen[0].method, "POST");
        assert!(seen[0].header(SESSION_HEADER).is_none());
        assert!(seen[0]
            .header("accept")
            .is_some_and(|v| v.contains("text/event-stream")));
        assert!(seen[0].body.contains("\"initialize\""));

        for later in &seen[1..] {
            assert_eq!(later.header(SESSION_HEADER), Some("sess-42"));
        }
        assert_eq!(seen[1].method, "POST");
        assert!(seen[2].body.contains("\"tools/list\""));
        assert_eq!(seen[3].method, "DELETE");
    }

    #[tokio::test]
    async fn test_close_without_session_sends_nothing() {
        let (base, server) = crate::test_http::serve(vec![Reply::json(
            r#"{"jsonrpc":"2.0","id":$ID,"result":{}}"#,
        )])
        .await;
        let config = ServerConfig {
            url: Some(base),
            ..Default::default()
        };
        let transport = StreamableHttpTransport::new("remote", &config).unwrap();
        transport.request("ping", None).await.unwrap();
        transport.close().await;

        let seen = server.await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, "POST");
    }

    #[tokio::test]
    async fn test_http_error_status_is_transport_error() {
        let (base, server) =
            crate::test_http::serve(vec![Reply::json("session expired").status(404)]).await;
        let config = ServerConfig {
            url: Some(base),
            ..Default::default()
        };
        let transport = StreamableHttpTransport::new("remote", &config).unwrap();
        let err = transport.request("tools/list", None).await.unwrap_err();
        assert!(err.to_string().contains("HTTP 404"));
        server.await.unwrap();
    }
}
