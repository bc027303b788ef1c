//! Shared types for the inference layer.
//!
//! `ChatRequest`/`ChatResponse` are the UI-facing contract; the
//! `ChatCompletion*` types mirror the OpenAI Chat Completions wire format.

use serde::{Deserialize, Serialize};

// ─── Messages ────────────────────────────────────────────────────────────────

/// A single message in the conversation sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

// ─── UI Contract ─────────────────────────────────────────────────────────────

/// A chat request as issued by the UI: `(provider, model, messages, temperature?, maxTokens?)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub provider: String,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl ChatRequest {
    /// Same provider and sampling settings, different messages.
    pub fn with_messages(&self, messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..self.clone()
        }
    }
}

/// Result of a non-streaming chat call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

// ─── Wire Types ──────────────────────────────────────────────────────────────

/// Request body for `POST {base_url}/chat/completions`.
#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    pub stream: bool,
}

/// A single SSE chunk from a streaming response.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatCompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_request_from_ui_json() {
        let json = r#"{
            "provider": "qwen",
            "model": "qwen-plus",
            "messages": [{"role": "user", "content": "hi"}],
            "maxTokens": 256
        }"#;
        let req: ChatRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.messages, vec![ChatMessage::user("hi")]);
        assert_eq!(req.max_tokens, Some(256));
        assert!(req.temperature.is_none());
    }

    #[test]
    fn test_wire_request_skips_unset_sampling() {
        let body = ChatCompletionRequest {
            model: "qwen-plus".into(),
            messages: vec![ChatMessage::system("s")],
            temperature: None,
            max_tokens: Some(1024),
            stream: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("temperature").is_none());
        assert_eq!(json["max_tokens"], 1024);
        assert_eq!(json["messages"][0]["role"], "system");
    }

    #[test]
    fn test_chunk_tolerates_role_only_delta() {
        let json = r#"{"choices":[{"delta":{"role":"assistant"},"index":0}]}"#;
        let chunk: ChatCompletionChunk = serde_json::from_str(json).unwrap();
        assert!(chunk.choices[0].delta.content.is_none());
    }

    #[test]
    fn test_response_usage_is_camel_case() {
        let resp = ChatResponse {
            id: "x".into(),
            content: "y".into(),
            usage: Some(Usage {
                prompt_tokens: 1,
                completion_tokens: 2,
                total_tokens: 3,
            }),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["usage"]["totalTokens"], 3);
    }
}
