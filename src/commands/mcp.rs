//! MCP commands: registry listings, routed operations, and config editing.

use serde_json::Value;

use crate::mcp_client::config::{load_servers_config, save_servers_config};
use crate::mcp_client::{
    McpServersConfig, PromptDescriptor, ResourceDescriptor, ServerSnapshot, ToolDescriptor,
};
use crate::AppState;

pub async fn list_servers(state: &AppState) -> Result<Vec<ServerSnapshot>, String> {
    Ok(state.registry.list_servers().await)
}

pub async fn list_tools(state: &AppState) -> Result<Vec<ToolDescriptor>, String> {
    Ok(state.registry.list_tools().await)
}

pub async fn list_resources(state: &AppState) -> Result<Vec<ResourceDescriptor>, String> {
    Ok(state.registry.list_resources().await)
}

pub async fn list_prompts(state: &AppState) -> Result<Vec<PromptDescriptor>, String> {
    Ok(state.registry.list_prompts().await)
}

/// Invoke a tool directly, outside any conversation.
pub async fn call_tool(
    state: &AppState,
    server_id: String,
    name: String,
    arguments: Option<Value>,
) -> Result<Value, String> {
    let arguments = arguments.unwrap_or_else(|| Value::Object(Default::default()));
    state
        .registry
        .call_tool(&server_id, &name, arguments)
        .await
        .map_err(|e| format!("{e}"))
}

pub async fn read_resource(
    state: &AppState,
    server_id: String,
    uri: String,
) -> Result<Value, String> {
    state
        .registry
        .read_resource(&server_id, &uri)
        .await
        .map_err(|e| format!("{e}"))
}

pub async fn get_prompt(
    state: &AppState,
    server_id: String,
    name: String,
    arguments: Option<Value>,
) -> Result<Value, String> {
    state
        .registry
        .get_prompt(&server_id, &name, arguments)
        .await
        .map_err(|e| format!("{e}"))
}

/// Re-read the config file and reconcile connections against it.
pub async fn reload_mcp(state: &AppState) -> Result<Vec<ServerSnapshot>, String> {
    Ok(state.reload_mcp().await)
}

/// Current config file contents. Unreadable files read as empty.
pub async fn get_mcp_config(state: &AppState) -> Result<McpServersConfig, String> {
    Ok(load_servers_config(&state.paths.mcp_config, &state.paths.workspace))
}

/// Write the config file and apply it.
pub async fn save_mcp_config(
    state: &AppState,
    config: McpServersConfig,
) -> Result<Vec<ServerSnapshot>, String> {
    save_servers_config(&state.paths.mcp_config, &config).map_err(|e| format!("{e}"))?;
    Ok(state.reload_mcp().await)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::commands::test_support::{app_state, SequenceProvider};
    use crate::mcp_client::{ServerConfig, ServerStatus};

    #[tokio::test]
    async fn test_listings_are_qualified() {
        let fixture = app_state(SequenceProvider::new(vec![])).await;

        let servers = list_servers(&fixture.state).await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].status, ServerStatus::Connected);

        let tools = list_tools(&fixture.state).await.unwrap();
        assert_eq!(tools[0].qualified_name(), "fs:list_directory");
        assert_eq!(list_resources(&fixture.state).await.unwrap().len(), 1);
        assert_eq!(list_prompts(&fixture.state).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_routed_operations() {
        let fixture = app_state(SequenceProvider::new(vec![])).await;

        let result = call_tool(
            &fixture.state,
            "fs".into(),
            "list_directory".into(),
            Some(serde_json::json!({"path": "/tmp/ws"})),
        )
        .await
        .unwrap();
        assert_eq!(result["content"][0]["text"], "[FILE] a.txt in /tmp/ws");

        let resource = read_resource(&fixture.state, "fs".into(), "file:///tmp/ws/a.txt".into())
            .await
            .unwrap();
        assert_eq!(resource["contents"][0]["text"], "hello");

        let prompt = get_prompt(&fixture.state, "fs".into(), "summarize".into(), None)
            .await
            .unwrap();
        assert!(prompt["messages"].is_array());
    }

    #[tokio::test]
    async fn test_call_tool_on_unknown_server() {
        let fixture = app_state(SequenceProvider::new(vec![])).await;
        let err = call_tool(&fixture.state, "ghost".into(), "x".into(), None)
            .await
            .unwrap_err();
        assert!(err.contains("ghost"));
    }

    #[tokio::test]
    async fn test_save_config_reconciles() {
        let fixture = app_state(SequenceProvider::new(vec![])).await;

        let mut servers = HashMap::new();
        servers.insert(
            "notes".to_string(),
            ServerConfig {
                command: Some("fake-notes".into()),
                ..Default::default()
            },
        );
        let snapshots = save_mcp_config(&fixture.state, McpServersConfig { servers })
            .await
            .unwrap();
        let ids: Vec<&str> = snapshots.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["notes"]);

        let saved = get_mcp_config(&fixture.state).await.unwrap();
        assert!(saved.servers.contains_key("notes"));
        assert_eq!(fixture.connector.attempts_for("notes"), 1);
    }
}
