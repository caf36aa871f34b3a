//! OpenAI Chat Completions backend (and compatible servers).
//!
//! Chunks carry optional `content` text and partial `tool_calls`; the turn
//! ends with a `finish_reason` on the last choice. Only one tool call is
//! tracked per turn (index 0), and requests ask for sequential tool use.

use async_trait::async_trait;
use probe_core::config::ProviderConfig;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::anthropic::parse_tool_args;
use crate::message::{ContentBlock, Message, MessageContent, Role};
use crate::provider::{
    http_client, EventStream, ModelProvider, ModelRequest, ProviderError, StopReason, StreamEvent,
    ToolCall,
};
use crate::sse::{decode_stream, SseFrame, StreamDecoder};

// ---------------------------------------------------------------------------
// Wire chunks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    error: Option<ChunkError>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    delta: Delta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkError {
    #[serde(default)]
    message: String,
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

// ---------------------------------------------------------------------------
// OpenAiDecoder
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PendingCall {
    id: String,
    name: String,
    arguments: String,
}

/// Stateful decoder for one Chat Completions stream.
#[derive(Debug, Default)]
pub struct OpenAiDecoder {
    saw_text: bool,
    call: Option<PendingCall>,
    flushed: bool,
}

impl OpenAiDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn flush(&mut self, reason: Option<&str>) -> Result<Vec<StreamEvent>, ProviderError> {
        self.flushed = true;
        let mut events = Vec::new();
        if std::mem::take(&mut self.saw_text) {
            events.push(StreamEvent::TextBlockEnd);
        }
        let had_call = self.call.is_some();
        if let Some(call) = self.call.take() {
            let args = parse_tool_args(&call.name, &call.arguments)?;
            let id = if call.id.is_empty() {
                "call_0".to_string()
            } else {
                call.id
            };
            events.push(StreamEvent::ToolCallComplete(ToolCall {
                id,
                name: call.name,
                args,
            }));
        }
        let stop = match reason {
            Some(r) => StopReason::from_wire(r),
            None if had_call => StopReason::ToolUse,
            None => StopReason::EndTurn,
        };
        events.push(StreamEvent::TurnTerminated(stop));
        Ok(events)
    }
}

impl StreamDecoder for OpenAiDecoder {
    fn decode(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>, ProviderError> {
        if frame.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        if frame.is_done() {
            return if self.flushed {
                Ok(Vec::new())
            } else {
                self.flush(None)
            };
        }
        if self.flushed {
            // Trailing usage chunks after finish_reason.
            return Ok(Vec::new());
        }

        let chunk: Chunk = serde_json::from_str(&frame.data)
            .map_err(|e| ProviderError::Protocol(format!("invalid chunk payload: {e}")))?;
        if let Some(err) = chunk.error {
            return Err(match err.kind.as_deref() {
                Some("rate_limit_exceeded") => ProviderError::RateLimited {
                    retry_after_secs: None,
                },
                _ => ProviderError::Api {
                    status: 500,
                    message: err.message,
                },
            });
        }

        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                self.saw_text = true;
                events.push(StreamEvent::TextDelta(text));
            }
            for delta in choice.delta.tool_calls {
                if delta.index != 0 {
                    tracing::debug!(index = delta.index, "ignoring parallel tool call fragment");
                    continue;
                }
                let call = self.call.get_or_insert_with(PendingCall::default);
                if let Some(id) = delta.id {
                    call.id = id;
                }
                if let Some(f) = delta.function {
                    if let Some(name) = f.name {
                        call.name.push_str(&name);
                    }
                    if let Some(args) = f.arguments {
                        call.arguments.push_str(&args);
                    }
                }
            }
            if let Some(reason) = choice.finish_reason {
                events.extend(self.flush(Some(&reason))?);
                break;
            }
        }
        Ok(events)
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>, ProviderError> {
        if self.flushed {
            Ok(Vec::new())
        } else {
            Err(ProviderError::Protocol(
                "stream ended before finish_reason (connection closed early)".into(),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// OpenAiProvider
// ---------------------------------------------------------------------------

/// Streaming client for `POST /v1/chat/completions`.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: Option<f32>,
}

impl OpenAiProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com".to_string(),
            model: model.into(),
            temperature: None,
        }
    }

    pub fn from_config(api_key: String, config: &ProviderConfig) -> Self {
        let client = http_client(config.connect_timeout(), config.read_timeout());
        Self {
            client,
            api_key,
            base_url: config.base_url().trim_end_matches('/').to_string(),
            model: config.model().to_string(),
            temperature: config.temperature,
        }
    }

    /// Override the base URL (useful for testing with a mock server).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn build_request_body(&self, request: &ModelRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if !request.system.is_empty() {
            messages.push(json!({ "role": "system", "content": request.system }));
        }
        messages.extend(request.messages.iter().flat_map(render_message));

        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "stream": true,
            "messages": messages,
        });
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
            body["parallel_tool_calls"] = Value::Bool(false);
        }
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        body
    }
}

/// One internal message can expand to several wire messages: each tool
/// result becomes its own `role: tool` entry.
fn render_message(msg: &Message) -> Vec<Value> {
    match (&msg.role, &msg.content) {
        (role, MessageContent::Text(text)) => vec![json!({
            "role": role_name(*role),
            "content": text,
        })],
        (Role::Assistant, MessageContent::Blocks(blocks)) => {
            let text = msg.text_content();
            let calls: Vec<Value> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, args } => Some(json!({
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": args.to_string() },
                    })),
                    _ => None,
                })
                .collect();
            let mut out = json!({
                "role": "assistant",
                "content": if text.is_empty() { Value::Null } else { Value::String(text) },
            });
            if !calls.is_empty() {
                out["tool_calls"] = Value::Array(calls);
            }
            vec![out]
        }
        (_, MessageContent::Blocks(blocks)) => {
            let mut out: Vec<Value> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => Some(json!({
                        "role": "tool",
                        "tool_call_id": tool_use_id,
                        "content": content,
                    })),
                    _ => None,
                })
                .collect();
            let text = msg.text_content();
            if !text.is_empty() {
                out.push(json!({ "role": "user", "content": text }));
            }
            out
        }
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    async fn stream(&self, request: ModelRequest) -> Result<EventStream, ProviderError> {
        let body = self.build_request_body(&request);
        let url = format!("{}/v1/chat/completions", self.base_url);

        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(ProviderError::RateLimited {
                retry_after_secs: retry_after,
            });
        }
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status,
                message: text,
            });
        }

        tracing::debug!(model = %self.model, messages = request.messages.len(), "openai stream opened");
        Ok(decode_stream(resp.bytes_stream(), OpenAiDecoder::new()))
    }

    fn name(&self) -> &str {
        "openai"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
