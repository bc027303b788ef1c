//! Provider registry and the offline mock provider.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::client::InferenceClient;
use super::config::LlmSettings;
use super::errors::InferenceError;
use super::provider::{FragmentStream, LlmProvider};
use super::types::{ChatRequest, ChatResponse, Role};

// ─── MockProvider ────────────────────────────────────────────────────────────

/// Answers without any network I/O by echoing the last user message.
pub struct MockProvider;

impl MockProvider {
    pub const ID: &'static str = "mock";
}

#[async_trait]
impl LlmProvider for MockProvider {
    fn id(&self) -> &str {
        Self::ID
    }

    fn supports_streaming(&self) -> bool {
        false
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, InferenceError> {
        let last = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(ChatResponse {
            id: format!("mock-{}", chrono::Utc::now().timestamp_millis()),
            content: format!("Mock reply: {last}"),
            usage: None,
        })
    }

    async fn stream_chat(&self, _request: &ChatRequest) -> Result<FragmentStream, InferenceError> {
        Err(InferenceError::StreamingNotSupported {
            provider: Self::ID.to_string(),
        })
    }
}

// ─── ProviderRegistry ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn LlmProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `mock` plus the OpenAI-compatible provider named in settings.
    pub fn from_settings(settings: &LlmSettings) -> Result<Self, InferenceError> {
        let mut registry = Self::new();
        registry.register(Arc::new(MockProvider));
        if settings.provider != MockProvider::ID {
            let client = InferenceClient::from_settings(&settings.provider, settings)?;
            registry.register(Arc::new(client));
        }
        Ok(registry)
    }

    /// Add or replace a provider under its own id.
    pub fn register(&mut self, provider: Arc<dyn LlmProvider>) {
        self.providers.insert(provider.id().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn LlmProvider>, InferenceError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| InferenceError::UnknownProvider {
                name: name.to_string(),
            })
    }

    /// Registered provider ids, sorted.
    pub fn list(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::ChatMessage;

    fn request(provider: &str) -> ChatRequest {
        ChatRequest {
            provider: provider.into(),
            model: "any".into(),
            messages: vec![
                ChatMessage::user("first"),
                ChatMessage::assistant("ok"),
                ChatMessage::user("second"),
            ],
            temperature: None,
            max_tokens: None,
        }
    }

    #[tokio::test]
    async fn test_mock_echoes_last_user_message() {
        let resp = MockProvider.chat(&request("mock")).await.unwrap();
        assert_eq!(resp.content, "Mock reply: second");
        assert!(resp.id.starts_with("mock-"));
    }

    #[tokio::test]
    async fn test_mock_does_not_stream() {
        let err = MockProvider.stream_chat(&request("mock")).await.err().unwrap();
        assert_eq!(err.to_string(), "streaming not supported for provider: mock");
    }

    #[test]
    fn test_registry_from_default_settings() {
        let registry = ProviderRegistry::from_settings(&LlmSettings::default()).unwrap();
        assert_eq!(registry.list(), vec!["mock", "qwen"]);
        assert!(registry.get("qwen").unwrap().supports_streaming());
        assert!(matches!(
            registry.get("openai").err().unwrap(),
            InferenceError::UnknownProvider { .. }
        ));
    }
}
