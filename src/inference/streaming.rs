//! SSE streaming response parser for OpenAI-compatible chat completions.
//!
//! Reads a byte stream, splits it on SSE event boundaries (`data: …\n\n`),
//! parses each chunk as JSON and yields the non-empty `delta.content`
//! fragments in arrival order. `data: [DONE]` ends the stream.

use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;

use super::errors::InferenceError;
use super::types::{ChatCompletionChunk, ChatResponse, Usage};

// ─── SSE parser ──────────────────────────────────────────────────────────────

/// Outcome of processing one SSE event.
#[derive(Debug, PartialEq)]
enum SseEvent {
    Fragment(String),
    Done,
    Skip,
}

/// Parse raw SSE bytes into content fragments.
///
/// Bytes are buffered until a full event is available, so multi-byte UTF-8
/// sequences split across network chunks decode correctly.
pub fn parse_sse_stream<S, B, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<String, InferenceError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let byte_stream = Box::pin(byte_stream);

    stream::unfold(
        (byte_stream, Vec::<u8>::new(), false),
        |(mut byte_stream, mut buffer, finished)| async move {
            if finished {
                return None;
            }
            loop {
                if let Some(event_end) = find_event_boundary(&buffer) {
                    let event: Vec<u8> = buffer.drain(..event_end + 2).collect();
                    let event = String::from_utf8_lossy(&event[..event_end]).into_owned();

                    match process_event(&event) {
                        Ok(SseEvent::Fragment(text)) => {
                            return Some((Ok(text), (byte_stream, buffer, false)))
                        }
                        Ok(SseEvent::Done) => return None,
                        Ok(SseEvent::Skip) => continue,
                        Err(e) => return Some((Err(e), (byte_stream, buffer, true))),
                    }
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => {
                        buffer.extend(bytes.as_ref().iter().filter(|b| **b != b'\r'));
                    }
                    Some(Err(e)) => {
                        return Some((
                            Err(InferenceError::StreamError {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, buffer, true),
                        ));
                    }
                    None => {
                        // Stream ended without a trailing blank line.
                        let rest = String::from_utf8_lossy(&buffer).trim().to_string();
                        buffer.clear();
                        if rest.is_empty() {
                            return None;
                        }
                        return match process_event(&rest) {
                            Ok(SseEvent::Fragment(text)) => {
                                Some((Ok(text), (byte_stream, buffer, true)))
                            }
                            Ok(_) => None,
                            Err(e) => Some((Err(e), (byte_stream, buffer, true))),
                        };
                    }
                }
            }
        },
    )
}

fn find_event_boundary(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

/// Process a single SSE event string (may contain multiple `data:` lines).
fn process_event(event: &str) -> Result<SseEvent, InferenceError> {
    let mut data_content = String::new();

    for line in event.lines() {
        if let Some(data) = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))
        {
            let data = data.trim();
            if data == "[DONE]" {
                return Ok(SseEvent::Done);
            }
            data_content.push_str(data);
        }
        // Ignore non-data lines (comments, event types, ids)
    }

    if data_content.is_empty() {
        return Ok(SseEvent::Skip);
    }

    let value: serde_json::Value =
        serde_json::from_str(&data_content).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse SSE chunk: {e} (data: {data_content})"),
        })?;

    if let Some(err) = value.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(String::from)
            .unwrap_or_else(|| err.to_string());
        return Err(InferenceError::StreamError { reason: message });
    }

    let chunk: ChatCompletionChunk =
        serde_json::from_value(value).map_err(|e| InferenceError::StreamError {
            reason: format!("unexpected SSE chunk shape: {e}"),
        })?;

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)
        .filter(|c| !c.is_empty())
        .map(SseEvent::Fragment)
        .unwrap_or(SseEvent::Skip))
}

// ─── Non-streaming ───────────────────────────────────────────────────────────

/// Parse a non-streaming chat completion body.
///
/// `fallback_id` is used when the provider omits `id`.
pub fn parse_non_streaming_response(
    body: &str,
    fallback_id: &str,
) -> Result<ChatResponse, InferenceError> {
    #[derive(Deserialize)]
    struct NonStreamResponse {
        id: Option<String>,
        #[serde(default)]
        choices: Vec<NonStreamChoice>,
        usage: Option<NonStreamUsage>,
    }

    #[derive(Deserialize)]
    struct NonStreamChoice {
        message: NonStreamMessage,
    }

    #[derive(Deserialize)]
    struct NonStreamMessage {
        content: Option<String>,
    }

    #[derive(Deserialize)]
    struct NonStreamUsage {
        #[serde(default)]
        prompt_tokens: u32,
        #[serde(default)]
        completion_tokens: u32,
        #[serde(default)]
        total_tokens: u32,
    }

    let resp: NonStreamResponse =
        serde_json::from_str(body).map_err(|e| InferenceError::StreamError {
            reason: format!("failed to parse non-streaming response: {e}"),
        })?;

    let content = resp
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .unwrap_or_default();

    Ok(ChatResponse {
        id: resp.id.unwrap_or_else(|| fallback_id.to_string()),
        content,
        usage: resp.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        }),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
