//! OpenAI-compatible inference client.
//!
//! Sends chat completion requests to a hosted endpoint (DashScope
//! compatible mode by default) and streams back content fragments.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client as HttpClient;

use super::config::LlmSettings;
use super::errors::InferenceError;
use super::provider::{FragmentStream, LlmProvider};
use super::streaming::{parse_non_streaming_response, parse_sse_stream};
use super::types::{ChatCompletionRequest, ChatRequest, ChatResponse};

// ─── Constants ───────────────────────────────────────────────────────────────

/// TCP connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Total request timeout for non-streaming calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Total request timeout for streaming calls.
///
/// Long answers keep the body open well past the non-streaming budget;
/// stalls before the first token are handled by the session watchdog.
const STREAM_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

// ─── InferenceClient ─────────────────────────────────────────────────────────

pub struct InferenceClient {
    id: String,
    /// HTTP client for non-streaming requests.
    http: HttpClient,
    /// HTTP client for streaming requests.
    http_stream: HttpClient,
    base_url: String,
    api_key: Option<String>,
}

impl InferenceClient {
    /// Build a client registered under `id` from the LLM settings.
    ///
    /// Does NOT check connectivity or the key; that happens per request.
    pub fn from_settings(id: &str, settings: &LlmSettings) -> Result<Self, InferenceError> {
        let base_url = settings.base_url.trim_end_matches('/').to_string();

        let http = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let http_stream = HttpClient::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(STREAM_REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InferenceError::ConnectionFailed {
                endpoint: base_url.clone(),
                reason: format!("failed to build streaming HTTP client: {e}"),
            })?;

        Ok(Self {
            id: id.to_string(),
            http,
            http_stream,
            base_url,
            api_key: settings.resolve_api_key(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn api_key(&self) -> Result<&str, InferenceError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| InferenceError::MissingApiKey {
                provider: self.id.clone(),
            })
    }

    fn build_body(request: &ChatRequest, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: request.model.clone(),
            messages: request.messages.clone(),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
        }
    }

    /// Send `body` and return the response after status checking.
    async fn send(
        &self,
        client: &HttpClient,
        body: &ChatCompletionRequest,
        timeout: Duration,
    ) -> Result<reqwest::Response, InferenceError> {
        let url = self.endpoint();
        let key = self.api_key()?;

        // Log the request metadata (not the full body, it can be huge)
        tracing::info!(
            provider = %self.id,
            url = %url,
            model = %body.model,
            message_count = body.messages.len(),
            max_tokens = ?body.max_tokens,
            stream = body.stream,
            "=== LLM REQUEST ==="
        );

        let mut req = client.post(&url).bearer_auth(key).json(body);
        if body.stream {
            req = req.header("Accept", "text/event-stream");
        }

        let response = req
            .send()
            .await
            .map_err(|e| InferenceError::from_send_error(&url, e, timeout.as_secs()))?;

        self.check_status(response).await
    }

    async fn check_status(
        &self,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, InferenceError> {
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            tracing::warn!(provider = %self.id, status = status.as_u16(), "LLM request rejected");
            return Err(InferenceError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }
        Ok(response)
    }

    /// Model ids offered by the endpoint (`GET {base_url}/models`).
    pub async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        let url = format!("{}/models", self.base_url);
        let key = self.api_key()?;

        let response = self
            .http
            .get(&url)
            .bearer_auth(key)
            .send()
            .await
            .map_err(|e| InferenceError::from_send_error(&url, e, REQUEST_TIMEOUT.as_secs()))?;
        let response = self.check_status(response).await?;

        let body: serde_json::Value =
            response
                .json()
                .await
                .map_err(|e| InferenceError::StreamError {
                    reason: format!("failed to parse model list: {e}"),
                })?;
        let models = parse_model_ids(&body);
        tracing::debug!(provider = %self.id, count = models.len(), "listed models");
        Ok(models)
    }
}

/// Pull model ids out of a `/models` body.
///
/// The list sits under `data`, under `models`, or is the body itself.
/// Entries are plain strings or objects carrying `id`, `model` or `name`.
/// Duplicates are dropped, first occurrence wins.
fn parse_model_ids(body: &serde_json::Value) -> Vec<String> {
    let entries = body
        .get("data")
        .or_else(|| body.get("models"))
        .unwrap_or(body)
        .as_array()
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut ids: Vec<String> = Vec::new();
    for entry in entries {
        let id = match entry {
            serde_json::Value::String(s) => Some(s.as_str()),
            serde_json::Value::Object(obj) => ["id", "model", "name"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(|v| v.as_str())),
            _ => None,
        };
        if let Some(id) = id.map(str::trim).filter(|id| !id.is_empty()) {
            if !ids.iter().any(|seen| seen == id) {
                ids.push(id.to_string());
            }
        }
    }
    ids
}

#[async_trait]
impl LlmProvider for InferenceClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, InferenceError> {
        let body = Self::build_body(request, false);
        let response = self.send(&self.http, &body, REQUEST_TIMEOUT).await?;
        let text = response
            .text()
            .await
            .map_err(|e| InferenceError::StreamError {
                reason: format!("failed to read response body: {e}"),
            })?;
        let fallback_id = format!("{}-{}", self.id, chrono::Utc::now().timestamp_millis());
        parse_non_streaming_response(&text, &fallback_id)
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<FragmentStream, InferenceError> {
        let body = Self::build_body(request, true);
        let response = self
            .send(&self.http_stream, &body, STREAM_REQUEST_TIMEOUT)
            .await?;
        Ok(parse_sse_stream(response.bytes_stream()).boxed())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
