//! Settings panel commands.
//!
//! Exposes the loaded `settings.yaml` (with the API key redacted), the
//! resolved file locations, the registered LLM providers, and the models
//! the configured endpoint offers.

use serde::Serialize;

use crate::inference::{AppSettings, InferenceClient, MockProvider};
use crate::AppState;

/// Settings overview returned to the frontend.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsInfo {
    pub settings: AppSettings,
    pub settings_file: String,
    pub mcp_config: String,
    pub workspace: String,
    pub api_key_set: bool,
}

/// Registered provider ids, sorted.
pub fn list_providers(state: &AppState) -> Result<Vec<String>, String> {
    Ok(state.providers.list())
}

/// Models offered by the configured endpoint.
///
/// The mock provider has no endpoint and lists itself.
pub async fn list_models(state: &AppState) -> Result<Vec<String>, String> {
    let llm = &state.settings.llm;
    if llm.provider == MockProvider::ID {
        return Ok(vec![MockProvider::ID.to_string()]);
    }
    let client = InferenceClient::from_settings(&llm.provider, llm).map_err(|e| format!("{e}"))?;
    client.list_models().await.map_err(|e| format!("{e}"))
}

pub fn get_settings(state: &AppState) -> Result<SettingsInfo, String> {
    let mut settings = state.settings.clone();
    let api_key_set = settings.llm.resolve_api_key().is_some();
    settings.llm.api_key = None;

    Ok(SettingsInfo {
        settings,
        settings_file: state.paths.settings_file.display().to_string(),
        mcp_config: state.paths.mcp_config.display().to_string(),
        workspace: state.paths.workspace.display().to_string(),
        api_key_set,
    })
}
