//! The provider seam: anything that can answer a chat request.

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::InferenceError;
use super::types::{ChatRequest, ChatResponse};

/// Content fragments in arrival order. The stream ending is the
/// end-of-stream marker; an `Err` item is a mid-stream failure.
pub type FragmentStream = BoxStream<'static, Result<String, InferenceError>>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Registry key (e.g. `"qwen"`, `"mock"`).
    fn id(&self) -> &str;

    fn supports_streaming(&self) -> bool;

    /// One-shot, non-streaming completion.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, InferenceError>;

    /// Dispatch a streaming completion. Dropping the returned stream aborts
    /// the underlying request.
    async fn stream_chat(&self, request: &ChatRequest) -> Result<FragmentStream, InferenceError>;
}
