//! Model provider abstraction.
//!
//! Every backend turns one request into a stream of normalized
//! [`StreamEvent`]s. The wire formats differ wildly (Anthropic sends typed
//! content-block events, OpenAI sends choice deltas) but both decoders emit
//! the same four events, so the loop controller in [`crate::engine`] never
//! needs to know which backend it is talking to.
//!
//! - [`ModelProvider`]: the async trait implemented by each backend
//! - [`ProviderError`]: transport, API and stream-protocol failures
//! - [`ScriptedProvider`]: replays scripted turns for tests and dry runs
//! - [`build_provider`]: picks a backend from configuration

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use probe_core::config::{CredentialProvider, ProviderConfig, ProviderKind};
use serde_json::Value;

use crate::anthropic::AnthropicProvider;
use crate::message::{Message, ToolSpec};
use crate::openai::OpenAiProvider;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("provider not configured: {0}")]
    NotConfigured(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },
    #[error("request timed out")]
    Timeout,
    #[error("stream protocol error: {0}")]
    Protocol(String),
    #[error("malformed arguments for tool `{tool}`: {message}")]
    MalformedToolArgs { tool: String, message: String },
}

impl ProviderError {
    /// Failures worth retrying after a backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Http(_) | ProviderError::Timeout | ProviderError::RateLimited { .. } => {
                true
            }
            ProviderError::Api { status, .. } => *status == 408 || *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Http(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Normalized stream events
// ---------------------------------------------------------------------------

/// Why the model stopped producing output for this turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Other(String),
}

impl StopReason {
    /// Map either backend's stop/finish reason string.
    pub fn from_wire(reason: &str) -> Self {
        match reason {
            "end_turn" | "stop" => StopReason::EndTurn,
            "tool_use" | "tool_calls" | "function_call" => StopReason::ToolUse,
            "max_tokens" | "length" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            other => StopReason::Other(other.to_string()),
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, StopReason::ToolUse)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A fragment of assistant text.
    TextDelta(String),
    /// The current text block is complete.
    TextBlockEnd,
    /// A tool call with fully parsed arguments.
    ToolCallComplete(ToolCall),
    /// The turn is over; no further events follow.
    TurnTerminated(StopReason),
}

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;

// ---------------------------------------------------------------------------
// Request + trait
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub max_tokens: u32,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Open a streaming completion for `request`.
    async fn stream(&self, request: ModelRequest) -> Result<EventStream, ProviderError>;

    /// Short name used in logs.
    fn name(&self) -> &str;
}

/// Drain a tool-less request and return the concatenated text.
pub async fn complete_text(
    provider: &dyn ModelProvider,
    request: ModelRequest,
) -> Result<String, ProviderError> {
    let mut stream = provider.stream(request).await?;
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            StreamEvent::TextDelta(delta) => text.push_str(&delta),
            StreamEvent::TurnTerminated(_) => break,
            StreamEvent::TextBlockEnd | StreamEvent::ToolCallComplete(_) => {}
        }
    }
    Ok(text)
}

/// Construct the configured backend. Missing credentials are fatal here.
pub fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn ModelProvider>, ProviderError> {
    let api_key = CredentialProvider::api_key(config).map_err(|e| {
        let others: Vec<String> = CredentialProvider::available_providers()
            .into_iter()
            .filter(|kind| *kind != config.kind)
            .map(|kind| kind.to_string())
            .collect();
        match others.as_slice() {
            [] => ProviderError::NotConfigured(e.to_string()),
            found => ProviderError::NotConfigured(format!(
                "{e} (keys are set for: {})",
                found.join(", ")
            )),
        }
    })?;
    let provider: Arc<dyn ModelProvider> = match config.kind {
        ProviderKind::Anthropic => Arc::new(AnthropicProvider::from_config(api_key, config)),
        ProviderKind::Openai => Arc::new(OpenAiProvider::from_config(api_key, config)),
    };
    tracing::info!(provider = %config.kind, model = config.model(), "model provider ready");
    Ok(provider)
}

/// HTTP client for the API backends.
///
/// The read timeout bounds each wait for data, not the whole response, so
/// a long stream that keeps producing events is never cut off.
pub(crate) fn http_client(connect_timeout: Duration, read_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .read_timeout(read_timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "HTTP client setup failed, using defaults");
            reqwest::Client::new()
        })
}

// ---------------------------------------------------------------------------
// ScriptedProvider
// ---------------------------------------------------------------------------

type ScriptedTurn = Result<Vec<StreamEvent>, ProviderError>;

/// Provider that replays pre-scripted turns.
///
/// Each `stream` call pops the next turn. Once the script is exhausted the
/// fallback turn is replayed (an empty end-of-turn unless overridden).
/// Every request is captured for assertions.
pub struct ScriptedProvider {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    fallback: Vec<StreamEvent>,
    delay: Option<Duration>,
    requests: Arc<Mutex<Vec<ModelRequest>>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            turns: Mutex::new(VecDeque::new()),
            fallback: vec![StreamEvent::TurnTerminated(StopReason::EndTurn)],
            delay: None,
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Queue a turn made of raw events.
    pub fn with_turn(self, events: Vec<StreamEvent>) -> Self {
        lock(&self.turns).push_back(Ok(events));
        self
    }

    /// Queue a turn that ends with plain text.
    pub fn with_text(self, text: impl Into<String>) -> Self {
        self.with_turn(Self::text_turn(text))
    }

    /// Queue a turn that requests one tool call.
    pub fn with_tool_call(self, id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        self.with_turn(Self::tool_turn(id, name, args))
    }

    /// Queue a failed request.
    pub fn with_error(self, error: ProviderError) -> Self {
        lock(&self.turns).push_back(Err(error));
        self
    }

    /// Turn replayed once the script runs out.
    pub fn with_fallback(mut self, events: Vec<StreamEvent>) -> Self {
        self.fallback = events;
        self
    }

    /// Sleep before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn text_turn(text: impl Into<String>) -> Vec<StreamEvent> {
        vec![
            StreamEvent::TextDelta(text.into()),
            StreamEvent::TextBlockEnd,
            StreamEvent::TurnTerminated(StopReason::EndTurn),
        ]
    }

    pub fn tool_turn(id: impl Into<String>, name: impl Into<String>, args: Value) -> Vec<StreamEvent> {
        vec![
            StreamEvent::ToolCallComplete(ToolCall {
                id: id.into(),
                name: name.into(),
                args,
            }),
            StreamEvent::TurnTerminated(StopReason::ToolUse),
        ]
    }

    /// Requests received so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn stream(&self, request: ModelRequest) -> Result<EventStream, ProviderError> {
        lock(&self.requests).push(request);
        let turn = lock(&self.turns)
            .pop_front()
            .unwrap_or_else(|| Ok(self.fallback.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let events = turn?;
        Ok(Box::pin(futures_util::stream::iter(events.into_iter().map(Ok))))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> ModelRequest {
        ModelRequest {
            system: "sys".into(),
            messages: vec![Message::user("hi")],
            tools: vec![],
            max_tokens: 64,
        }
    }

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(StopReason::from_wire("tool_use"), StopReason::ToolUse);
        assert_eq!(StopReason::from_wire("tool_calls"), StopReason::ToolUse);
        assert_eq!(StopReason::from_wire("stop"), StopReason::EndTurn);
        assert_eq!(StopReason::from_wire("length"), StopReason::MaxTokens);
        assert_eq!(
            StopReason::from_wire("content_filter"),
            StopReason::Other("content_filter".into())
        );
    }

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Timeout.is_transient());
        assert!(ProviderError::RateLimited { retry_after_secs: None }.is_transient());
        assert!(ProviderError::Api { status: 529, message: "overloaded".into() }.is_transient());
        assert!(!ProviderError::Api { status: 400, message: "bad".into() }.is_transient());
        assert!(!ProviderError::NotConfigured("x".into()).is_transient());
    }

    #[tokio::test]
    async fn scripted_provider_replays_in_order() {
        let provider = ScriptedProvider::new()
            .with_tool_call("t1", "ls", json!({}))
            .with_text("done");

        let mut first = provider.stream(request()).await.unwrap();
        let ev = first.next().await.unwrap().unwrap();
        assert!(matches!(ev, StreamEvent::ToolCallComplete(ref c) if c.name == "ls"));

        let text = complete_text(&provider, request()).await.unwrap();
        assert_eq!(text, "done");
        assert_eq!(provider.request_count(), 2);
    }

    #[tokio::test]
    async fn scripted_provider_falls_back_when_exhausted() {
        let provider = ScriptedProvider::new();
        let text = complete_text(&provider, request()).await.unwrap();
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn scripted_error_surfaces() {
        let provider = ScriptedProvider::new().with_error(ProviderError::Timeout);
        assert!(matches!(
            provider.stream(request()).await,
            Err(ProviderError::Timeout)
        ));
    }

    /// Serve one chunked response, sending `chunks` one-byte chunks `gap` apart.
    async fn trickle_server(chunks: usize, gap: Duration) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = socket.read(&mut buf).await;
            let head = "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ntransfer-encoding: chunked\r\n\r\n";
            socket.write_all(head.as_bytes()).await.unwrap();
            for _ in 0..chunks {
                tokio::time::sleep(gap).await;
                if socket.write_all(b"1\r\nx\r\n").await.is_err() {
                    return;
                }
            }
            let _ = socket.write_all(b"0\r\n\r\n").await;
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn slow_stream_outlives_the_read_timeout() {
        let url = trickle_server(8, Duration::from_millis(100)).await;
        let client = http_client(Duration::from_secs(2), Duration::from_millis(400));

        let body = client.get(&url).send().await.unwrap().text().await.unwrap();
        assert_eq!(body, "xxxxxxxx");
    }

    #[tokio::test]
    async fn stalled_stream_hits_the_read_timeout() {
        let url = trickle_server(1, Duration::from_secs(3)).await;
        let client = http_client(Duration::from_secs(2), Duration::from_millis(300));

        let result = async { client.get(&url).send().await?.text().await }.await;
        assert!(result.is_err());
    }

    #[test]
    fn build_provider_without_key_is_not_configured() {
        let config = ProviderConfig {
            api_key_env: Some("PROBE_HARNESS_TEST_UNSET_KEY".into()),
            ..ProviderConfig::default()
        };
        let err = build_provider(&config).err().expect("should fail");
        assert!(matches!(err, ProviderError::NotConfigured(_)));
        assert!(err.to_string().contains("PROBE_HARNESS_TEST_UNSET_KEY"));
    }
}
