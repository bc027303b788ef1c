//! MCP Registry: the server-id-keyed table of connections.
//!
//! `reconcile` replaces the whole table to match a config snapshot
//! (close everything, then open every enabled entry in parallel). Catalog
//! queries aggregate over `Connected` servers only and never fail as a whole.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{Mutex, RwLock};

use super::client::McpClient;
use super::connection::{Connector, ServerConnection, TransportConnector};
use super::errors::McpError;
use super::types::{
    McpServersConfig, PromptDescriptor, ResourceDescriptor, ServerSnapshot, ToolDescriptor,
};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default timeout for a single `tools/call`.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Timeout for resource reads, prompt fetches and per-server list queries.
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

// ─── McpRegistry ─────────────────────────────────────────────────────────────

pub struct McpRegistry {
    connector: Arc<dyn Connector>,
    connections: RwLock<HashMap<String, ServerConnection>>,
    /// Serializes `reconcile`/`shutdown`; a second call waits for the first.
    reconcile_lock: Mutex<()>,
    call_timeout: Duration,
}

impl Default for McpRegistry {
    fn default() -> Self {
        Self::new(Arc::new(TransportConnector))
    }
}

impl McpRegistry {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: RwLock::new(HashMap::new()),
            reconcile_lock: Mutex::new(()),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Override the tool-call timeout.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Replace the connection table to match `config`.
    ///
    /// When this returns, every config id has exactly one entry, each
    /// `Connected`, `Error`, or `Disconnected` (disabled).
    pub async fn reconcile(&self, config: &McpServersConfig) {
        let _guard = self.reconcile_lock.lock().await;

        // Swap in `Connecting` rows so listings stay populated while the
        // old connections close and the new ones open.
        let previous = {
            let mut table = self.connections.write().await;
            let placeholders = config
                .servers
                .iter()
                .map(|(id, c)| (id.clone(), ServerConnection::pending(id, c.clone())))
                .collect();
            std::mem::replace(&mut *table, placeholders)
        };
        close_all(previous).await;

        let mut opens: FuturesUnordered<_> = config
            .servers
            .iter()
            .map(|(id, server_config)| {
                let connector = Arc::clone(&self.connector);
                let mut conn = ServerConnection::new(id, server_config.clone());
                let handle = tokio::spawn(async move {
                    conn.open(connector.as_ref()).await;
                    conn
                });
                let id = id.clone();
                let server_config = server_config.clone();
                async move {
                    match handle.await {
                        Ok(conn) => conn,
                        Err(e) => {
                            let mut conn = ServerConnection::new(&id, server_config);
                            conn.fail(format!("connect task failed: {e}"));
                            conn
                        }
                    }
                }
            })
            .collect();

        // Each row is replaced as soon as its own open settles.
        while let Some(conn) = opens.next().await {
            self.connections
                .write()
                .await
                .insert(conn.id().to_string(), conn);
        }

        let table = self.connections.read().await;
        let connected = table
            .values()
            .filter(|c| c.client().is_some())
            .count();
        tracing::info!(
            servers = table.len(),
            connected,
            "MCP registry reconciled"
        );
    }

    /// Close every connection and empty the table.
    pub async fn shutdown(&self) {
        let _guard = self.reconcile_lock.lock().await;
        let previous = std::mem::take(&mut *self.connections.write().await);
        close_all(previous).await;
        tracing::info!("MCP registry shut down");
    }

    // ─── Snapshots ───────────────────────────────────────────────────────

    /// One row per table entry, sorted by id.
    pub async fn list_servers(&self) -> Vec<ServerSnapshot> {
        let table = self.connections.read().await;
        let mut rows: Vec<ServerSnapshot> = table.values().map(|c| c.snapshot()).collect();
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        rows
    }

    /// Clients of all `Connected` servers, sorted by id.
    async fn connected_clients(&self) -> Vec<Arc<McpClient>> {
        let table = self.connections.read().await;
        let mut clients: Vec<Arc<McpClient>> =
            table.values().filter_map(|c| c.client()).collect();
        clients.sort_by(|a, b| a.server_id().cmp(b.server_id()));
        clients
    }

    async fn client_for(&self, server_id: &str) -> Result<Arc<McpClient>, McpError> {
        let table = self.connections.read().await;
        table
            .get(server_id)
            .and_then(|c| c.client())
            .ok_or_else(|| McpError::NotConnected {
                server: server_id.to_string(),
            })
    }

    pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
        let clients = self.connected_clients().await;
        let results = join_all(clients.iter().map(|client| async move {
            let tools = bounded(client.server_id(), "tools/list", client.list_tools()).await;
            (client.server_id(), tools)
        }))
        .await;

        let mut out = Vec::new();
        for (server_id, result) in results {
            match result {
                Ok(tools) => out.extend(tools.into_iter().map(|t| ToolDescriptor {
                    server_id: server_id.to_string(),
                    name: t.name,
                    description: t.description,
                    input_schema: t.input_schema,
                })),
                Err(e) => {
                    tracing::warn!(server = %server_id, error = %e, "tools/list failed, omitting server");
                }
            }
        }
        out
    }

    pub async fn list_resources(&self) -> Vec<ResourceDescriptor> {
        let clients = self.connected_clients().await;
        let results = join_all(clients.iter().map(|client| async move {
            let resources =
                bounded(client.server_id(), "resources/list", client.list_resources()).await;
            (client.server_id(), resources)
        }))
        .await;

        let mut out = Vec::new();
        for (server_id, result) in results {
            match result {
                Ok(resources) => out.extend(resources.into_iter().map(|r| ResourceDescriptor {
                    server_id: server_id.to_string(),
                    uri: r.uri,
                    name: r.name,
                    description: r.description,
                    mime_type: r.mime_type,
                })),
                Err(e) => {
                    tracing::debug!(server = %server_id, error = %e, "resources/list failed, omitting server");
                }
            }
        }
        out
    }

    pub async fn list_prompts(&self) -> Vec<PromptDescriptor> {
        let clients = self.connected_clients().await;
        let results = join_all(clients.iter().map(|client| async move {
            let prompts = bounded(client.server_id(), "prompts/list", client.list_prompts()).await;
            (client.server_id(), prompts)
        }))
        .await;

        let mut out = Vec::new();
        for (server_id, result) in results {
            match result {
                Ok(prompts) => out.extend(prompts.into_iter().map(|p| PromptDescriptor {
                    server_id: server_id.to_string(),
                    name: p.name,
                    description: p.description,
                    arguments: p.arguments,
                })),
                Err(e) => {
                    tracing::debug!(server = %server_id, error = %e, "prompts/list failed, omitting server");
                }
            }
        }
        out
    }

    // ─── Routed Operations ───────────────────────────────────────────────

    /// Route a tool call to `server_id`, bounded by the call timeout.
    pub async fn call_tool(
        &self,
        server_id: &str,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let client = self.client_for(server_id).await?;

        tracing::info!(server = %server_id, tool = %name, "calling MCP tool");
        let start = std::time::Instant::now();

        let result = match tokio::time::timeout(
            self.call_timeout,
            client.call_tool(name, arguments),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                server: server_id.to_string(),
                operation: format!("tools/call '{name}'"),
                timeout_ms: self.call_timeout.as_millis() as u64,
            }),
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => tracing::info!(server = %server_id, tool = %name, elapsed_ms, "MCP tool succeeded"),
            Err(e) => tracing::warn!(server = %server_id, tool = %name, elapsed_ms, error = %e, "MCP tool failed"),
        }
        result
    }

    pub async fn read_resource(
        &self,
        server_id: &str,
        uri: &str,
    ) -> Result<serde_json::Value, McpError> {
        let client = self.client_for(server_id).await?;
        bounded(server_id, "resources/read", client.read_resource(uri)).await
    }

    pub async fn get_prompt(
        &self,
        server_id: &str,
        name: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let client = self.client_for(server_id).await?;
        bounded(server_id, "prompts/get", client.get_prompt(name, arguments)).await
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Close connections in parallel, swallowing errors.
async fn close_all(connections: HashMap<String, ServerConnection>) {
    if connections.is_empty() {
        return;
    }
    join_all(connections.into_values().map(|mut conn| async move {
        conn.close().await;
    }))
    .await;
}

/// Apply `QUERY_TIMEOUT` to a per-server operation.
async fn bounded<T>(
    server_id: &str,
    operation: &str,
    fut: impl std::future::Future<Output = Result<T, McpError>>,
) -> Result<T, McpError> {
    tokio::time::timeout(QUERY_TIMEOUT, fut)
        .await
        .unwrap_or_else(|_| {
            Err(McpError::Timeout {
                server: server_id.to_string(),
                operation: operation.to_string(),
                timeout_ms: QUERY_TIMEOUT.as_millis() as u64,
            })
        })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
