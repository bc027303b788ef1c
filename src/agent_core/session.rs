//! Stream sessions: concurrent, cancellable chat generations.
//!
//! Each session owns a cancellation token, an accumulation buffer, a
//! watchdog timer and an optional one-shot non-streaming fallback. The
//! `StreamController` is the registry of live sessions; records are removed
//! on every terminal outcome (done, error, aborted) and the watchdog handle
//! is aborted at the same point so it can never fire after teardown.
//!
//! Observers receive `SessionEvent`s over an unbounded channel. Fragments
//! are coalesced and flushed once per `flush_interval`, in arrival order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::inference::{
    ChatMessage, ChatRequest, FragmentStream, InferenceError, LlmProvider, ProviderRegistry,
    StreamSettings,
};

use super::errors::AgentError;

/// Shown in the target message when the watchdog fires with nothing to fall back on.
pub const NO_OUTPUT_PLACEHOLDER: &str = "(no response from the model yet)";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Where a session's output goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionTarget {
    /// Raw stream with no conversation behind it.
    Detached,
    /// An assistant message in a stored conversation.
    Message {
        conversation_id: String,
        message_id: String,
    },
}

impl SessionTarget {
    pub fn message(conversation_id: &str, message_id: &str) -> Self {
        SessionTarget::Message {
            conversation_id: conversation_id.to_string(),
            message_id: message_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Streaming,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub stream_id: String,
    pub target: SessionTarget,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEventKind {
    /// A coalesced batch of fragments. `buffer` is everything received so far.
    Content { delta: String, buffer: String },
    /// The watchdog fired with no content and no fallback.
    Placeholder { text: String },
    /// Terminal: the provider finished (or the fallback answered).
    Done { content: String },
    /// Terminal: transport or parse failure not caused by cancellation.
    Error { message: String },
    /// Terminal: cancelled by the caller or superseded.
    Aborted,
}

impl SessionEventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionEventKind::Done { .. } | SessionEventKind::Error { .. } | SessionEventKind::Aborted
        )
    }
}

// ─── Fallback ────────────────────────────────────────────────────────────────

/// Non-streaming request issued at most once when a session stalls.
#[derive(Debug)]
pub struct FallbackRequest {
    messages: Vec<ChatMessage>,
    used: AtomicBool,
}

impl FallbackRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            used: AtomicBool::new(false),
        }
    }

    /// Claim the fallback. Only the first call gets the messages.
    pub fn take(&self) -> Option<&[ChatMessage]> {
        if self.used.swap(true, Ordering::AcqRel) {
            None
        } else {
            Some(&self.messages)
        }
    }

    pub fn is_used(&self) -> bool {
        self.used.load(Ordering::Acquire)
    }
}

// ─── Session Registry ────────────────────────────────────────────────────────

struct SessionRecord {
    target: SessionTarget,
    state: SessionState,
    cancel: CancellationToken,
    watchdog: Option<JoinHandle<()>>,
}

type SessionTable = Arc<Mutex<HashMap<String, SessionRecord>>>;

fn lock_table(table: &SessionTable) -> MutexGuard<'_, HashMap<String, SessionRecord>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct StreamController {
    providers: Arc<ProviderRegistry>,
    watchdog: Duration,
    flush_interval: Duration,
    sessions: SessionTable,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl StreamController {
    pub fn new(
        providers: Arc<ProviderRegistry>,
        settings: &StreamSettings,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            providers,
            watchdog: settings.watchdog(),
            flush_interval: settings.flush_interval(),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    /// Start a generation for `target` and return its stream id.
    ///
    /// Any live session writing to the same message is cancelled first. When
    /// `fallback` is given and nothing arrives within the watchdog window,
    /// those messages are sent once as a non-streaming request instead.
    /// Must be called from within a Tokio runtime.
    pub fn start(
        &self,
        request: ChatRequest,
        target: SessionTarget,
        fallback: Option<Vec<ChatMessage>>,
    ) -> Result<String, AgentError> {
        let provider = self.providers.get(&request.provider)?;
        let cancel = CancellationToken::new();
        let (watchdog_tx, watchdog_rx) = oneshot::channel();

        let stream_id = {
            let mut sessions = lock_table(&self.sessions);

            if target != SessionTarget::Detached {
                for (id, record) in sessions.iter().filter(|(_, r)| r.target == target) {
                    tracing::info!(stream_id = %id, "superseding stream session");
                    record.cancel.cancel();
                }
            }

            let stream_id = loop {
                let candidate = new_stream_id();
                if !sessions.contains_key(&candidate) {
                    break candidate;
                }
            };

            let window = self.watchdog;
            let watchdog = tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let _ = watchdog_tx.send(());
            });

            sessions.insert(
                stream_id.clone(),
                SessionRecord {
                    target: target.clone(),
                    state: SessionState::Idle,
                    cancel: cancel.clone(),
                    watchdog: Some(watchdog),
                },
            );
            stream_id
        };

        tracing::info!(
            stream_id = %stream_id,
            provider = %request.provider,
            model = %request.model,
            message_count = request.messages.len(),
            has_fallback = fallback.is_some(),
            "stream session started"
        );

        let driver = SessionDriver {
            stream_id: stream_id.clone(),
            target,
            provider,
            request,
            fallback: fallback.map(FallbackRequest::new),
            cancel,
            flush_interval: self.flush_interval,
            sessions: Arc::clone(&self.sessions),
            events: self.events.clone(),
        };
        tokio::spawn(driver.run(watchdog_rx));

        Ok(stream_id)
    }

    /// Request cancellation. The session reports `Aborted` once its driver
    /// observes the token. Returns `false` for unknown ids.
    pub fn stop(&self, stream_id: &str) -> bool {
        match lock_table(&self.sessions).get(stream_id) {
            Some(record) => {
                record.cancel.cancel();
                tracing::info!(stream_id = %stream_id, "stream stop requested");
                true
            }
            None => false,
        }
    }

    /// Cancel every live session.
    pub fn stop_all(&self) {
        for record in lock_table(&self.sessions).values() {
            record.cancel.cancel();
        }
    }

    pub fn state(&self, stream_id: &str) -> Option<SessionState> {
        lock_table(&self.sessions).get(stream_id).map(|r| r.state)
    }

    pub fn active_count(&self) -> usize {
        lock_table(&self.sessions).len()
    }
}

/// `stream-<millis>-<random>`.
fn new_stream_id() -> String {
    let random = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "stream-{}-{}",
        chrono::Utc::now().timestamp_millis(),
        &random[..8]
    )
}

// ─── Driver ──────────────────────────────────────────────────────────────────

enum Outcome {
    Done(String),
    Error(String),
    Aborted,
}

/// Runs one session to its terminal outcome.
struct SessionDriver {
    stream_id: String,
    target: SessionTarget,
    provider: Arc<dyn LlmProvider>,
    request: ChatRequest,
    fallback: Option<FallbackRequest>,
    cancel: CancellationToken,
    flush_interval: Duration,
    sessions: SessionTable,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionDriver {
    async fn run(self, mut watchdog: oneshot::Receiver<()>) {
        self.set_state(SessionState::Streaming);

        let mut buffer = String::new();
        let mut pending = String::new();

        let outcome = if self.provider.supports_streaming() {
            self.stream(&mut watchdog, &mut buffer, &mut pending).await
        } else {
            // One-shot request for providers without streaming.
            let messages = self.request.messages.clone();
            self.one_shot(&messages).await
        };

        let outcome = match outcome {
            Outcome::Error(_) if self.cancel.is_cancelled() => Outcome::Aborted,
            other => other,
        };

        // A one-shot answer arrives whole; deliver it as content first.
        if let Outcome::Done(content) = &outcome {
            if buffer.is_empty() && pending.is_empty() {
                pending.push_str(content);
            }
        }

        if !pending.is_empty() {
            self.flush(&mut buffer, &mut pending);
        }
        self.finish(outcome);
    }

    async fn stream(
        &self,
        watchdog: &mut oneshot::Receiver<()>,
        buffer: &mut String,
        pending: &mut String,
    ) -> Outcome {
        let provider = Arc::clone(&self.provider);
        let request = self.request.clone();
        let open = async move { provider.stream_chat(&request).await };
        tokio::pin!(open);

        let mut opened = false;
        let mut fragments: Option<FragmentStream> = None;
        let mut watchdog_armed = true;
        let mut has_content = false;

        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.flush_interval, self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Outcome::Aborted,

                fired = &mut *watchdog, if watchdog_armed => {
                    watchdog_armed = false;
                    if fired.is_err() || has_content {
                        continue;
                    }
                    match self.fallback.as_ref().and_then(FallbackRequest::take) {
                        Some(messages) => {
                            tracing::warn!(
                                stream_id = %self.stream_id,
                                "no content within watchdog window, issuing fallback request"
                            );
                            return self.one_shot(messages).await;
                        }
                        None => {
                            tracing::warn!(
                                stream_id = %self.stream_id,
                                "no content within watchdog window"
                            );
                            self.emit(SessionEventKind::Placeholder {
                                text: NO_OUTPUT_PLACEHOLDER.to_string(),
                            });
                        }
                    }
                }

                result = &mut open, if !opened => {
                    opened = true;
                    match result {
                        Ok(stream) => fragments = Some(stream),
                        Err(e) => return Outcome::Error(e.to_string()),
                    }
                }

                _ = ticker.tick(), if !pending.is_empty() => {
                    self.flush(buffer, pending);
                }

                item = next_fragment(&mut fragments) => match item {
                    Some(Ok(fragment)) => {
                        if !fragment.is_empty() {
                            has_content = true;
                            pending.push_str(&fragment);
                        }
                    }
                    Some(Err(e)) => return Outcome::Error(e.to_string()),
                    None => {
                        if !pending.is_empty() {
                            self.flush(buffer, pending);
                        }
                        return Outcome::Done(buffer.clone());
                    }
                },
            }
        }
    }

    /// Non-streaming request, still cancellable.
    async fn one_shot(&self, messages: &[ChatMessage]) -> Outcome {
        let request = self.request.with_messages(messages.to_vec());
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Outcome::Aborted,
            result = self.provider.chat(&request) => match result {
                Ok(response) => Outcome::Done(response.content),
                Err(e) => Outcome::Error(e.to_string()),
            },
        }
    }

    fn flush(&self, buffer: &mut String, pending: &mut String) {
        let delta = std::mem::take(pending);
        buffer.push_str(&delta);
        self.emit(SessionEventKind::Content {
            delta,
            buffer: buffer.clone(),
        });
    }

    fn set_state(&self, state: SessionState) {
        if let Some(record) = lock_table(&self.sessions).get_mut(&self.stream_id) {
            record.state = state;
        }
    }

    /// Remove the record, disarm the watchdog, and report the outcome.
    fn finish(&self, outcome: Outcome) {
        if let Some(mut record) = lock_table(&self.sessions).remove(&self.stream_id) {
            if let Some(handle) = record.watchdog.take() {
                handle.abort();
            }
        }

        let fallback_used = self.fallback.as_ref().is_some_and(FallbackRequest::is_used);
        let kind = match outcome {
            Outcome::Done(content) => {
                tracing::info!(
                    stream_id = %self.stream_id,
                    chars = content.len(),
                    fallback_used,
                    "stream session done"
                );
                SessionEventKind::Done { content }
            }
            Outcome::Error(message) => {
                tracing::warn!(stream_id = %self.stream_id, error = %message, "stream session failed");
                SessionEventKind::Error { message }
            }
            Outcome::Aborted => {
                tracing::info!(stream_id = %self.stream_id, "stream session aborted");
                SessionEventKind::Aborted
            }
        };
        self.emit(kind);
    }

    fn emit(&self, kind: SessionEventKind) {
        let _ = self.events.send(SessionEvent {
            stream_id: self.stream_id.clone(),
            target: self.target.clone(),
            kind,
        });
    }
}

/// Next fragment, or pend forever while the stream is not open yet.
async fn next_fragment(
    fragments: &mut Option<FragmentStream>,
) -> Option<Result<String, InferenceError>> {
    match fragments {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

// ─── Test Support ────────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use futures::stream;

    use super::*;
    use crate::inference::types::{ChatResponse, Role};

    /// Provider that replays scripted fragments.
    ///
    /// `Err` entries become stream errors; `hang` keeps the stream open
    /// forever after the script runs out.
    pub struct ScriptedProvider {
        pub id: String,
        pub fragments: Vec<Result<String, String>>,
        pub delay: Duration,
        pub hang: bool,
        pub reply: String,
        pub chat_calls: AtomicUsize,
        pub stream_calls: AtomicUsize,
        pub requests: Mutex<Vec<ChatRequest>>,
    }

    impl ScriptedProvider {
        pub fn new(fragments: &[&str]) -> Self {
            Self {
                id: "scripted".into(),
                fragments: fragments.iter().map(|f| Ok(f.to_string())).collect(),
                delay: Duration::ZERO,
                hang: false,
                reply: "fallback reply".into(),
                chat_calls: AtomicUsize::new(0),
                stream_calls: AtomicUsize::new(0),
                requests: Mutex::new(Vec::new()),
            }
        }

        pub fn silent() -> Self {
            Self {
                hang: true,
                ..Self::new(&[])
            }
        }

        pub fn chat_calls(&self) -> usize {
            self.chat_calls.load(Ordering::SeqCst)
        }

        pub fn last_request(&self) -> Option<ChatRequest> {
            self.requests.lock().unwrap().last().cloned()
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn id(&self) -> &str {
            &self.id
        }

        fn supports_streaming(&self) -> bool {
            true
        }

        async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, InferenceError> {
            self.chat_calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            assert!(request.messages.iter().any(|m| m.role == Role::User));
            Ok(ChatResponse {
                id: "scripted-1".into(),
                content: self.reply.clone(),
                usage: None,
            })
        }

        async fn stream_chat(
            &self,
            request: &ChatRequest,
        ) -> Result<FragmentStream, InferenceError> {
            self.stream_calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request.clone());
            let delay = self.delay;
            let items = self.fragments.clone();
            let scripted = stream::iter(items).then(move |item| async move {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                item.map_err(|reason| InferenceError::StreamError { reason })
            });
            if self.hang {
                Ok(scripted.chain(stream::pending()).boxed())
            } else {
                Ok(scripted.boxed())
            }
        }
    }

    pub fn request(provider: &str) -> ChatRequest {
        ChatRequest {
            provider: provider.into(),
            model: "test-model".into(),
            messages: vec![ChatMessage::user("hi")],
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn controller(
        provider: Arc<dyn LlmProvider>,
        watchdog_ms: u64,
    ) -> (StreamController, mpsc::UnboundedReceiver<SessionEvent>) {
        let mut registry = ProviderRegistry::new();
        registry.register(provider);
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = StreamSettings {
            watchdog_ms,
            flush_interval_ms: 5,
        };
        (StreamController::new(Arc::new(registry), &settings, tx), rx)
    }

    /// Collect events for `stream_id` up to and including its terminal event.
    pub async fn collect_until_terminal(
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        stream_id: &str,
    ) -> Vec<SessionEventKind> {
        let mut kinds = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for session events")
                .expect("event channel closed");
            if event.stream_id != stream_id {
                continue;
            }
            let terminal = event.kind.is_terminal();
            kinds.push(event.kind);
            if terminal {
                return kinds;
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
