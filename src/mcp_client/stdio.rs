//! JSON-RPC over a child process's stdio.
//!
//! - Line-delimited JSON: one message per line in each direction
//! - Non-JSON stdout lines (server log output) are skipped
//! - stderr is drained into debug logs and never treated as fatal

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::transport::{next_request_id, McpTransport};
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ServerConfig};

/// Time allowed for the process to exit after a kill request.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Both pipe ends, locked together so concurrent requests cannot read each
/// other's responses.
struct StdioPipes {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Bi-directional JSON-RPC transport over a spawned server process.
pub struct StdioTransport {
    server_name: String,
    pipes: Mutex<StdioPipes>,
    child: Mutex<Child>,
}

impl StdioTransport {
    /// Spawn the configured command with piped stdio.
    pub async fn spawn(server_name: &str, config: &ServerConfig) -> Result<Self, McpError> {
        let command = config
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| McpError::ConfigError {
                reason: format!("missing command for stdio MCP server '{server_name}'"),
            })?;

        let mut cmd = Command::new(command);
        cmd.args(&config.args);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = config.cwd.as_deref() {
            cmd.current_dir(dir);
        }

        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            server: server_name.to_string(),
            reason: format!("{command}: {e}"),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::SpawnFailed {
            server: server_name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::SpawnFailed {
            server: server_name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;

        if let Some(stderr) = child.stderr.take() {
            let name = server_name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %name, line = %line, "server stderr");
                }
            });
        }

        tracing::debug!(
            server = server_name,
            command = command,
            pid = child.id().unwrap_or_default(),
            "spawned stdio MCP server"
        );

        Ok(Self {
            server_name: server_name.to_string(),
            pipes: Mutex::new(StdioPipes {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            child: Mutex::new(child),
        })
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::Transport {
            server: self.server_name.clone(),
            reason,
        }
    }

    async fn write_line(&self, stdin: &mut ChildStdin, mut json: String) -> Result<(), McpError> {
        json.push('\n');
        stdin
            .write_all(json.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush stdin: {e}")))
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req)
            .map_err(|e| self.transport_error(format!("failed to serialize request: {e}")))?;

        let mut pipes = self.pipes.lock().await;
        self.write_line(&mut pipes.stdin, json).await?;

        let mut line_buf = String::new();
        loop {
            line_buf.clear();
            let bytes_read = pipes
                .stdout
                .read_line(&mut line_buf)
                .await
                .map_err(|e| self.transport_error(format!("failed to read from stdout: {e}")))?;

            if bytes_read == 0 {
                return Err(self.transport_error(
                    "server stdout closed (process may have exited)".into(),
                ));
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            // Server-initiated requests, notifications and log lines all fail
            // this match and are skipped.
            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == id => return Ok(resp),
                _ => continue,
            }
        }
    }

    async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notification).map_err(|e| {
            self.transport_error(format!("failed to serialize notification: {e}"))
        })?;

        let mut pipes = self.pipes.lock().await;
        self.write_line(&mut pipes.stdin, json).await
    }

    async fn close(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.start_kill() {
            tracing::debug!(server = %self.server_name, error = %e, "kill failed (already exited?)");
            return;
        }
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, child.wait())
            .await
            .is_err()
        {
            tracing::warn!(server = %self.server_name, "server did not exit after kill");
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// A tiny shell "server" that prints a log line, then answers every
    /// request line with a canned result echoing the request id.
    fn echo_server_config() -> ServerConfig {
        let script = r#"echo "starting up" >&2
echo "not json at all"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id"
  fi
done"#;
        ServerConfig {
            command: Some("sh".into()),
            args: vec!["-c".into(), script.into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_request_skips_non_json_lines() {
        let transport = StdioTransport::spawn("echo", &echo_server_config())
            .await
            .unwrap();
        let resp = transport.request("ping", None).await.unwrap();
        assert_eq!(resp.result.unwrap()["ok"], true);

        // Notifications carry no id and get no reply; the next request still works.
        transport.notify("notifications/initialized", None).await.unwrap();
        let resp = transport.request("ping", None).await.unwrap();
        assert!(resp.error.is_none());
        transport.close().await;
    }

    #[tokio::test]
    async fn test_request_after_exit_is_transport_error() {
        let config = ServerConfig {
            command: Some("true".into()),
            ..Default::default()
        };
        let transport = StdioTransport::spawn("short", &config).await.unwrap();
        let err = transport.request("ping", None).await.unwrap_err();
        assert!(matches!(err, McpError::Transport { .. }));
    }
}
