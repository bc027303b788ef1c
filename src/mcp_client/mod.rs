//! MCP Client: connections to Model Context Protocol servers.
//!
//! This module handles:
//! - JSON-RPC 2.0 over child-process stdio or streamable HTTP
//! - The initialize handshake and typed tool/resource/prompt operations
//! - Per-server connection state (`Disconnected`/`Connecting`/`Connected`/`Error`)
//! - The registry that reconciles the connection table against `mcp.json`
//!
//! The registry is consulted by session setup (to advertise tools to the
//! model) and by the tool-call orchestrator (to execute them).

pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod http;
pub mod registry;
pub mod stdio;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use client::McpClient;
pub use connection::{Connector, ServerConnection, TransportConnector};
pub use errors::McpError;
pub use registry::McpRegistry;
pub use types::{
    McpServersConfig, PromptDescriptor, ResourceDescriptor, ServerConfig, ServerSnapshot,
    ServerStatus, ToolDescriptor, TransportKind,
};
