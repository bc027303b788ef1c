//! Inference error types.
//!
//! All errors implement `std::error::Error` via `thiserror`. Structured logging
//! is the caller's responsibility: these types carry the context needed to build
//! meaningful log entries.

use thiserror::Error;

/// Errors that can occur while talking to an LLM provider.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the provider endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed {
        endpoint: String,
        reason: String,
    },

    /// The provider did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout {
        duration_secs: u64,
    },

    /// Non-2xx HTTP response from the provider.
    #[error("API error {status}: {body}")]
    HttpError {
        status: u16,
        body: String,
    },

    /// Network or parse failure in the middle of a stream.
    #[error("stream error: {reason}")]
    StreamError {
        reason: String,
    },

    /// No provider registered under this name.
    #[error("unknown provider: {name}")]
    UnknownProvider {
        name: String,
    },

    /// The provider only offers non-streaming chat.
    #[error("streaming not supported for provider: {provider}")]
    StreamingNotSupported {
        provider: String,
    },

    /// The provider needs an API key and none was configured.
    #[error("missing API key for {provider}")]
    MissingApiKey {
        provider: String,
    },

    /// Configuration loading or validation error.
    #[error("config error: {reason}")]
    ConfigError {
        reason: String,
    },
}

impl InferenceError {
    /// Map a `reqwest` send error to the matching variant.
    pub fn from_send_error(endpoint: &str, err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            InferenceError::Timeout {
                duration_secs: timeout_secs,
            }
        } else {
            InferenceError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                reason: err.to_string(),
            }
        }
    }

    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            InferenceError::ConnectionFailed { .. }
            | InferenceError::Timeout { .. }
            | InferenceError::StreamError { .. } => true,
            InferenceError::HttpError { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}
