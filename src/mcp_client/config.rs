//! Loading and writing the MCP servers file (`mcp/mcp.json`).
//!
//! A missing or malformed file never stops startup: it yields an empty
//! server set so the rest of the app keeps working. Legacy filesystem
//! entries are rewritten to the current launcher on load.

use std::path::Path;

use super::errors::McpError;
use super::types::{McpServersConfig, ServerConfig};

/// Id of the server written into a fresh config.
pub const DEFAULT_SERVER_ID: &str = "filesystem";

/// Package the default filesystem server is launched from.
const FILESYSTEM_PACKAGE: &str = "@modelcontextprotocol/server-filesystem";

/// Script name used by older configs that ran a local filesystem server.
const LEGACY_FILESYSTEM_SCRIPT: &str = "mcp-filesystem";

/// Read `path` as an MCP servers config.
///
/// Missing file → empty set. Parse error → empty set plus a warning.
/// A config that needed normalizing is written back so the fix sticks.
pub fn load_servers_config(path: &Path, workspace: &Path) -> McpServersConfig {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "no MCP config file, starting with no servers");
            return McpServersConfig::default();
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to read MCP config");
            return McpServersConfig::default();
        }
    };

    match serde_json::from_str::<McpServersConfig>(&content) {
        Ok(mut config) => {
            if normalize_servers_config(&mut config, workspace) {
                match save_servers_config(path, &config) {
                    Ok(()) => tracing::info!(path = %path.display(), "rewrote legacy MCP config"),
                    Err(e) => tracing::warn!(error = %e, "failed to write normalized MCP config"),
                }
            }
            tracing::info!(
                path = %path.display(),
                servers = ?config.servers.keys().collect::<Vec<_>>(),
                "loaded MCP config"
            );
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to parse MCP config, falling back to no servers"
            );
            McpServersConfig::default()
        }
    }
}

/// Rewrite a legacy filesystem entry (`node`/`npx` running the old
/// `mcp-filesystem` script) to launch the published package against
/// `workspace`. Returns `true` if anything changed.
pub fn normalize_servers_config(config: &mut McpServersConfig, workspace: &Path) -> bool {
    let Some(server) = config.servers.get_mut(DEFAULT_SERVER_ID) else {
        return false;
    };
    let legacy_launcher = matches!(server.command.as_deref(), Some("node") | Some("npx"));
    let legacy_script = server
        .args
        .first()
        .is_some_and(|arg| arg == LEGACY_FILESYSTEM_SCRIPT);
    if !(legacy_launcher && legacy_script) {
        return false;
    }

    server.command = Some("npx".into());
    server.args = filesystem_args(workspace);
    true
}

fn filesystem_args(workspace: &Path) -> Vec<String> {
    vec![
        "-y".into(),
        FILESYSTEM_PACKAGE.into(),
        workspace.to_string_lossy().into_owned(),
    ]
}

/// Write `config` as pretty JSON, creating parent directories.
pub fn save_servers_config(path: &Path, config: &McpServersConfig) -> Result<(), McpError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| McpError::ConfigError {
            reason: format!("failed to create {}: {e}", parent.display()),
        })?;
    }
    let json = serde_json::to_string_pretty(config).map_err(|e| McpError::ConfigError {
        reason: format!("failed to serialize MCP config: {e}"),
    })?;
    std::fs::write(path, json).map_err(|e| McpError::ConfigError {
        reason: format!("failed to write {}: {e}", path.display()),
    })
}

/// The config written on first run: one filesystem server rooted at `workspace`.
pub fn default_servers_config(workspace: &Path) -> McpServersConfig {
    let filesystem = ServerConfig {
        command: Some("npx".into()),
        args: filesystem_args(workspace),
        ..Default::default()
    };
    McpServersConfig {
        servers: [(DEFAULT_SERVER_ID.to_string(), filesystem)].into(),
    }
}

/// Write the default config if `path` does not exist yet.
///
/// Returns `true` when a file was written. The workspace directory is
/// created too so the filesystem server has something to serve.
pub fn ensure_default_config(path: &Path, workspace: &Path) -> Result<bool, McpError> {
    if path.exists() {
        return Ok(false);
    }
    std::fs::create_dir_all(workspace).map_err(|e| McpError::ConfigError {
        reason: format!("failed to create workspace {}: {e}", workspace.display()),
    })?;
    save_servers_config(path, &default_servers_config(workspace))?;
    tracing::info!(path = %path.display(), "wrote default MCP config");
    Ok(true)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
