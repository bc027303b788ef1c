//! Application settings loading.
//!
//! Reads `settings.yaml` from the data directory and resolves environment
//! variables. Covers the default LLM provider and sampling parameters, the
//! MCP config location, and stream session timing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::errors::InferenceError;

/// Environment variable that points at an alternate settings file.
pub const SETTINGS_PATH_ENV: &str = "AGENT_DESKTOP_SETTINGS";

/// Environment variable consulted when no API key is configured.
pub const API_KEY_ENV: &str = "DASHSCOPE_API_KEY";

pub const DEFAULT_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level settings (mirrors `settings.yaml`). Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub llm: LlmSettings,
    pub mcp: McpSettings,
    pub stream: StreamSettings,
}

/// Default provider, model and sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: String,
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "qwen".into(),
            model: "qwen-plus".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: None,
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

impl LlmSettings {
    /// Configured key, else `DASHSCOPE_API_KEY`. Empty strings count as unset.
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct McpSettings {
    pub enabled: bool,
    /// Overrides `<data_dir>/mcp/mcp.json`.
    pub config_path: Option<String>,
    /// Root handed to the default filesystem server.
    pub workspace: Option<String>,
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            config_path: None,
            workspace: None,
        }
    }
}

/// Stream session timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamSettings {
    /// No-content window before the fallback request fires.
    pub watchdog_ms: u64,
    /// Coalescing interval for content flushes.
    pub flush_interval_ms: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            watchdog_ms: 8_000,
            flush_interval_ms: 16,
        }
    }
}

impl StreamSettings {
    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Settings file location: `$AGENT_DESKTOP_SETTINGS`, else `<data_dir>/settings.yaml`.
pub fn settings_path(data_dir: &Path) -> PathBuf {
    if let Ok(path) = std::env::var(SETTINGS_PATH_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(expand_tilde(&path));
        }
    }
    data_dir.join("settings.yaml")
}

/// Load and parse the settings file.
///
/// A missing file yields defaults. Performs environment-variable
/// interpolation on `${VAR_NAME}` or `${VAR_NAME:-default}`.
pub fn load_settings(path: &Path) -> Result<AppSettings, InferenceError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(AppSettings::default());
        }
        Err(e) => {
            return Err(InferenceError::ConfigError {
                reason: format!("failed to read {}: {e}", path.display()),
            })
        }
    };

    let interpolated = interpolate_env_vars(&raw);
    if interpolated.trim().is_empty() {
        return Ok(AppSettings::default());
    }

    serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to parse {}: {e}", path.display()),
    })
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some((var_name, default)) = expr.split_once(":-") {
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if rest.is_empty() || rest.starts_with('/') || rest.starts_with('\\') {
            if let Some(home) = dirs::home_dir() {
                return format!("{}{rest}", home.display());
            }
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpolate_env_vars_with_default() {
        std::env::remove_var("__TEST_NONEXISTENT_SETTINGS_VAR__");
        let input = "${__TEST_NONEXISTENT_SETTINGS_VAR__:-fallback}";
        assert_eq!(interpolate_env_vars(input), "fallback");
    }

    #[test]
    fn test_interpolate_env_vars_with_value() {
        std::env::set_var("__TEST_SETTINGS_KEY__", "sk-test");
        let input = "api_key: ${__TEST_SETTINGS_KEY__:-none}";
        assert_eq!(interpolate_env_vars(input), "api_key: sk-test");
        std::env::remove_var("__TEST_SETTINGS_KEY__");
    }

    #[test]
    fn test_expand_tilde_only_for_home_prefix() {
        let expanded = expand_tilde("~/Documents");
        assert!(!expanded.starts_with('~'));
        assert!(expanded.ends_with("/Documents"));
        assert_eq!(expand_tilde("~user/x"), "~user/x");
        assert_eq!(expand_tilde("/abs"), "/abs");
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("settings.yaml")).unwrap();
        assert_eq!(settings, AppSettings::default());
        assert_eq!(settings.llm.provider, "qwen");
        assert_eq!(settings.llm.model, "qwen-plus");
        assert_eq!(settings.stream.watchdog(), Duration::from_secs(8));
        assert!(settings.mcp.enabled);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(
            &path,
            "llm:\n  model: qwen-max\n  temperature: 0.2\nstream:\n  watchdog_ms: 500\n",
        )
        .unwrap();
        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.llm.model, "qwen-max");
        assert_eq!(settings.llm.provider, "qwen");
        assert_eq!(settings.llm.max_tokens, 1024);
        assert_eq!(settings.stream.watchdog(), Duration::from_millis(500));
        assert_eq!(settings.stream.flush_interval_ms, 16);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.yaml");
        std::fs::write(&path, "llm: [unclosed").unwrap();
        assert!(matches!(
            load_settings(&path),
            Err(InferenceError::ConfigError { .. })
        ));
    }

    #[test]
    fn test_resolve_api_key_prefers_configured_value() {
        let llm = LlmSettings {
            api_key: Some("sk-configured".into()),
            ..Default::default()
        };
        assert_eq!(llm.resolve_api_key().as_deref(), Some("sk-configured"));
    }
}
