//! One server's connection state machine.
//!
//! `Disconnected → Connecting → Connected`, or `Connecting → Error`.
//! Disabled servers stay `Disconnected` and are never opened. Nothing leaves
//! `Error` except a fresh reconcile, which builds a new connection.

use std::sync::Arc;

use async_trait::async_trait;

use super::client::McpClient;
use super::errors::McpError;
use super::transport::open_transport;
use super::types::{ServerConfig, ServerSnapshot, ServerStatus, TransportKind};

// ─── Connector ───────────────────────────────────────────────────────────────

/// Opens a transport and completes the protocol handshake.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, server_id: &str, config: &ServerConfig)
        -> Result<McpClient, McpError>;
}

/// Real connector: stdio spawn or streamable HTTP, chosen by config.
pub struct TransportConnector;

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(
        &self,
        server_id: &str,
        config: &ServerConfig,
    ) -> Result<McpClient, McpError> {
        let transport = open_transport(server_id, config).await?;
        McpClient::connect(server_id, transport).await
    }
}

// ─── ServerConnection ────────────────────────────────────────────────────────

pub struct ServerConnection {
    id: String,
    state: ServerStatus,
    transport: TransportKind,
    config: ServerConfig,
    last_error: Option<String>,
    client: Option<Arc<McpClient>>,
}

impl ServerConnection {
    pub fn new(id: &str, config: ServerConfig) -> Self {
        Self {
            id: id.to_string(),
            state: ServerStatus::Disconnected,
            transport: config.transport_kind(),
            config,
            last_error: None,
            client: None,
        }
    }

    /// Row shown while an open is in flight: `Connecting`, or
    /// `Disconnected` for disabled servers.
    pub fn pending(id: &str, config: ServerConfig) -> Self {
        let mut conn = Self::new(id, config);
        if !conn.config.disabled {
            conn.state = ServerStatus::Connecting;
        }
        conn
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ServerStatus {
        self.state
    }

    /// The protocol client, only while `Connected`.
    pub fn client(&self) -> Option<Arc<McpClient>> {
        match self.state {
            ServerStatus::Connected => self.client.clone(),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> ServerSnapshot {
        ServerSnapshot {
            id: self.id.clone(),
            status: self.state,
            transport: self.transport,
            error: self.last_error.clone(),
        }
    }

    /// Attempt to connect. Disabled servers are left `Disconnected`.
    ///
    /// Never fails: an open error is recorded as `Error` with its message.
    pub async fn open(&mut self, connector: &dyn Connector) {
        if self.config.disabled {
            self.state = ServerStatus::Disconnected;
            tracing::info!(server = %self.id, "MCP server disabled, not connecting");
            return;
        }

        self.state = ServerStatus::Connecting;
        self.last_error = None;

        match connector.connect(&self.id, &self.config).await {
            Ok(client) => {
                self.client = Some(Arc::new(client));
                self.state = ServerStatus::Connected;
                tracing::info!(server = %self.id, transport = ?self.transport, "MCP server connected");
            }
            Err(e) => {
                tracing::warn!(server = %self.id, error = %e, "MCP server failed to connect");
                self.fail(e.to_string());
            }
        }
    }

    /// Record a failure that happened outside `open` (e.g. a panicked task).
    pub fn fail(&mut self, message: String) {
        self.client = None;
        self.last_error = Some(message);
        self.state = ServerStatus::Error;
    }

    /// Close the channel, if any. Best-effort.
    pub async fn close(&mut self) {
        if let Some(client) = self.client.take() {
            client.close().await;
            tracing::debug!(server = %self.id, "MCP server connection closed");
        }
        if self.state != ServerStatus::Error {
            self.state = ServerStatus::Disconnected;
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::test_support::FakeConnector;
    use super::*;

    fn stdio(command: &str) -> ServerConfig {
        ServerConfig {
            command: Some(command.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_disabled_server_never_opens() {
        let connector = FakeConnector::default();
        let mut conn = ServerConnection::new(
            "off",
            ServerConfig {
                disabled: true,
                ..stdio("npx")
            },
        );
        conn.open(&connector).await;
        assert_eq!(conn.state(), ServerStatus::Disconnected);
        assert_eq!(connector.attempts_for("off"), 0);
        assert!(conn.client().is_none());
    }

    #[test]
    fn test_pending_row_state() {
        let row = ServerConnection::pending("fs", stdio("npx"));
        assert_eq!(row.state(), ServerStatus::Connecting);
        assert!(row.client().is_none());

        let off = ServerConnection::pending(
            "off",
            ServerConfig {
                disabled: true,
                ..stdio("npx")
            },
        );
        assert_eq!(off.state(), ServerStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_open_success_then_close() {
        let connector = FakeConnector::default();
        let mut conn = ServerConnection::new("fs", stdio("npx"));
        conn.open(&connector).await;
        assert_eq!(conn.state(), ServerStatus::Connected);
        assert!(conn.client().is_some());

        conn.close().await;
        assert_eq!(conn.state(), ServerStatus::Disconnected);
        assert!(*connector.transport("fs").closed.lock().unwrap());
    }

    #[tokio::test]
    async fn test_open_failure_records_error() {
        let connector = FakeConnector::failing(&["fs"]);
        let mut conn = ServerConnection::new("fs", stdio("npx"));
        conn.open(&connector).await;
        let snap = conn.snapshot();
        assert_eq!(snap.status, ServerStatus::Error);
        assert!(snap.error.unwrap().contains("os error 2"));
        assert!(conn.client().is_none());

        // Closing keeps the error visible.
        conn.close().await;
        assert_eq!(conn.state(), ServerStatus::Error);
    }

    #[tokio::test]
    async fn test_real_connector_reports_missing_command() {
        let mut conn = ServerConnection::new("broken", ServerConfig::default());
        conn.open(&TransportConnector).await;
        let snap = conn.snapshot();
        assert_eq!(snap.status, ServerStatus::Error);
        assert_eq!(snap.transport, TransportKind::Stdio);
        assert!(snap.error.unwrap().contains("missing command"));
    }
}
