//! Inference: LLM providers behind a single chat/stream contract.
//!
//! This module handles:
//! - The `LlmProvider` trait (non-streaming chat + fragment streams)
//! - An OpenAI-compatible HTTP provider and an offline mock
//! - SSE stream parsing
//! - Application settings loading from `settings.yaml`
//!
//! Providers are looked up by name, so switching backends is a settings
//! change, not a code change.

pub mod client;
pub mod config;
pub mod errors;
pub mod provider;
pub mod providers;
pub mod streaming;
pub mod types;

// Re-exports for convenience
pub use client::InferenceClient;
pub use config::{AppSettings, LlmSettings, McpSettings, StreamSettings};
pub use errors::InferenceError;
pub use provider::{FragmentStream, LlmProvider};
pub use providers::{MockProvider, ProviderRegistry};
pub use types::{ChatMessage, ChatRequest, ChatResponse, Role, Usage};
