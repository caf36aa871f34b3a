//! Anthropic Messages API backend.
//!
//! The stream is a sequence of typed events. Text blocks arrive as
//! `text_delta` fragments; tool-use blocks arrive as `input_json_delta`
//! fragments that only form valid JSON once `content_block_stop` is seen.
//! The stop reason rides on `message_delta` and the turn ends at
//! `message_stop`.

use std::collections::HashMap;

use async_trait::async_trait;
use probe_core::config::ProviderConfig;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::message::{ContentBlock, Message, MessageContent, Role};
use crate::provider::{
    http_client, EventStream, ModelProvider, ModelRequest, ProviderError, StopReason, StreamEvent,
    ToolCall,
};
use crate::sse::{decode_stream, SseFrame, StreamDecoder};

pub const ANTHROPIC_VERSION: &str = "2023-06-01";

// ---------------------------------------------------------------------------
// Wire events
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    MessageStart,
    ContentBlockStart {
        index: usize,
        content_block: StartBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: MessageDeltaBody,
    },
    MessageStop,
    Ping,
    Error {
        error: ErrorBody,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StartBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

// ---------------------------------------------------------------------------
// AnthropicDecoder
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum OpenBlock {
    Text,
    Tool { id: String, name: String, raw: String },
    Ignored,
}

/// Stateful decoder for one Anthropic response stream.
#[derive(Debug, Default)]
pub struct AnthropicDecoder {
    blocks: HashMap<usize, OpenBlock>,
    stop_reason: Option<StopReason>,
    terminated: bool,
}

impl AnthropicDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    fn close_block(&mut self, index: usize) -> Result<Vec<StreamEvent>, ProviderError> {
        match self.blocks.remove(&index) {
            Some(OpenBlock::Text) => Ok(vec![StreamEvent::TextBlockEnd]),
            Some(OpenBlock::Tool { id, name, raw }) => {
                let args = parse_tool_args(&name, &raw)?;
                Ok(vec![StreamEvent::ToolCallComplete(ToolCall { id, name, args })])
            }
            Some(OpenBlock::Ignored) | None => Ok(Vec::new()),
        }
    }
}

/// Arguments are only valid JSON once every fragment has arrived.
pub(crate) fn parse_tool_args(tool: &str, raw: &str) -> Result<Value, ProviderError> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| ProviderError::MalformedToolArgs {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

impl StreamDecoder for AnthropicDecoder {
    fn decode(&mut self, frame: &SseFrame) -> Result<Vec<StreamEvent>, ProviderError> {
        if frame.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let event: AnthropicEvent = serde_json::from_str(&frame.data)
            .map_err(|e| ProviderError::Protocol(format!("invalid event payload: {e}")))?;

        match event {
            AnthropicEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                StartBlock::Text { text } => {
                    self.blocks.insert(index, OpenBlock::Text);
                    if text.is_empty() {
                        Ok(Vec::new())
                    } else {
                        Ok(vec![StreamEvent::TextDelta(text)])
                    }
                }
                StartBlock::ToolUse { id, name } => {
                    self.blocks.insert(
                        index,
                        OpenBlock::Tool {
                            id,
                            name,
                            raw: String::new(),
                        },
                    );
                    Ok(Vec::new())
                }
                StartBlock::Other => {
                    self.blocks.insert(index, OpenBlock::Ignored);
                    Ok(Vec::new())
                }
            },
            AnthropicEvent::ContentBlockDelta { index, delta } => {
                match (self.blocks.get_mut(&index), delta) {
                    (Some(OpenBlock::Text), BlockDelta::TextDelta { text }) => {
                        Ok(vec![StreamEvent::TextDelta(text)])
                    }
                    (Some(OpenBlock::Tool { raw, .. }), BlockDelta::InputJsonDelta { partial_json }) => {
                        raw.push_str(&partial_json);
                        Ok(Vec::new())
                    }
                    (None, _) => Err(ProviderError::Protocol(format!(
                        "delta for unopened content block {index}"
                    ))),
                    _ => Ok(Vec::new()),
                }
            }
            AnthropicEvent::ContentBlockStop { index } => self.close_block(index),
            AnthropicEvent::MessageDelta { delta } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(StopReason::from_wire(&reason));
                }
                Ok(Vec::new())
            }
            AnthropicEvent::MessageStop => {
                self.terminated = true;
                let reason = self.stop_reason.take().unwrap_or(StopReason::EndTurn);
                Ok(vec![StreamEvent::TurnTerminated(reason)])
            }
            AnthropicEvent::Error { error } => Err(match error.kind.as_str() {
                "overloaded_error" => ProviderError::Api {
                    status: 529,
                    message: error.message,
                },
                "rate_limit_error" => ProviderError::RateLimited {
                    retry_after_secs: None,
                },
                "api_error" => ProviderError::Api {
                    status: 500,
                    message: error.message,
                },
                kind => ProviderError::Protocol(format!("{kind}: {}", error.message)),
            }),
            AnthropicEvent::MessageStart | AnthropicEvent::Ping | AnthropicEvent::Unknown => {
                Ok(Vec::new())
            }
        }
    }

    fn finish(&mut self) -> Result<Vec<StreamEvent>, ProviderError> {
        if self.terminated {
            Ok(Vec::new())
        } else {
            Err(ProviderError::Protocol(
                "stream ended before message_stop (connection closed early)".into(),
            ))
        }
    }
}

// ---------------------------------------------------------------------------
// AnthropicProvider
// ---------------------------------------------------------------------------

/// Streaming client for `POST /v1/messages`.
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: Option<f32>,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.anthropic.com".to_string(),
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

    /// Build the streaming request body.
    ///
    /// Cache-marked messages get an ephemeral `cache_control` breakpoint on
    /// their last content block.
    pub fn build_request_body(&self, request: &ModelRequest) -> Value {
        let messages: Vec<Value> = request.messages.iter().map(render_message).collect();
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "max_tokens": request.max_tokens,
            "stream": true,
            "messages": messages,
        });
        if !request.system.is_empty() {
            body["system"] = Value::String(request.system.clone());
        }
        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        if let Some(t) = self.temperature {
            body["temperature"] = json!(t);
        }
        body
    }
}

fn render_message(msg: &Message) -> Value {
    let (role, mut blocks) = match (&msg.role, &msg.content) {
        (role, MessageContent::Text(text)) => {
            let role = if *role == Role::Assistant { "assistant" } else { "user" };
            if !msg.cache_mark {
                return json!({ "role": role, "content": text });
            }
            (role, vec![json!({ "type": "text", "text": text })])
        }
        (role, MessageContent::Blocks(blocks)) => {
            let role = if *role == Role::Assistant { "assistant" } else { "user" };
            (role, blocks.iter().map(render_block).collect())
        }
    };
    if msg.cache_mark {
        if let Some(last) = blocks.last_mut() {
            last["cache_control"] = json!({ "type": "ephemeral" });
        }
    }
    json!({ "role": role, "content": blocks })
}

fn render_block(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
        ContentBlock::ToolUse { id, name, args } => json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": args,
        }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => json!({
            "type": "tool_result",
            "tool_use_id": tool_use_id,
            "content": content,
            "is_error": is_error,
        }),
    }
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    async fn stream(&self, request: ModelRequest) -> Result<EventStream, ProviderError> {
        let body = self.build_request_body(&request);
        let url = format!("{}/v1/messages", self.base_url);

        let resp = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
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

        tracing::debug!(model = %self.model, messages = request.messages.len(), "anthropic stream opened");
        Ok(decode_stream(resp.bytes_stream(), AnthropicDecoder::new()))
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ToolSpec;

    fn frame(data: Value) -> SseFrame {
        SseFrame {
            event: None,
            data: data.to_string(),
        }
    }

    #[test]
    fn tool_args_parsed_only_at_block_stop() {
        let mut d = AnthropicDecoder::new();
        d.decode(&frame(json!({"type":"content_block_start","index":0,
            "content_block":{"type":"tool_use","id":"toolu_1","name":"execute_command","input":{}}})))
            .unwrap();
        for part in ["{\"comm", "and\": \"ls", " -la\"}"] {
            let ev = d
                .decode(&frame(json!({"type":"content_block_delta","index":0,
                    "delta":{"type":"input_json_delta","partial_json":part}})))
                .unwrap();
            assert!(ev.is_empty());
        }
        let ev = d
            .decode(&frame(json!({"type":"content_block_stop","index":0})))
            .unwrap();
        assert_eq!(
            ev,
            vec![StreamEvent::ToolCallComplete(ToolCall {
                id: "toolu_1".into(),
                name: "execute_command".into(),
                args: json!({"command": "ls -la"}),
            })]
        );
    }

    #[test]
    fn empty_tool_input_is_empty_object() {
        let mut d = AnthropicDecoder::new();
        d.decode(&frame(json!({"type":"content_block_start","index":1,
            "content_block":{"type":"tool_use","id":"t","name":"list"}})))
            .unwrap();
        let ev = d
            .decode(&frame(json!({"type":"content_block_stop","index":1})))
            .unwrap();
        assert!(matches!(&ev[0], StreamEvent::ToolCallComplete(c) if c.args == json!({})));
    }

    #[test]
    fn malformed_tool_json_is_an_error() {
        let mut d = AnthropicDecoder::new();
        d.decode(&frame(json!({"type":"content_block_start","index":0,
            "content_block":{"type":"tool_use","id":"t","name":"x"}})))
            .unwrap();
        d.decode(&frame(json!({"type":"content_block_delta","index":0,
            "delta":{"type":"input_json_delta","partial_json":"{\"a\":"}})))
            .unwrap();
        let err = d
            .decode(&frame(json!({"type":"content_block_stop","index":0})))
            .unwrap_err();
        assert!(matches!(err, ProviderError::MalformedToolArgs { .. }));
    }

    #[test]
    fn stop_reason_comes_from_message_delta() {
        let mut d = AnthropicDecoder::new();
        d.decode(&frame(json!({"type":"message_delta","delta":{"stop_reason":"tool_use"}})))
            .unwrap();
        let ev = d.decode(&frame(json!({"type":"message_stop"}))).unwrap();
        assert_eq!(ev, vec![StreamEvent::TurnTerminated(StopReason::ToolUse)]);
        assert!(d.finish().unwrap().is_empty());
    }

    #[test]
    fn stream_without_message_stop_fails_on_finish() {
        let mut d = AnthropicDecoder::new();
        d.decode(&frame(json!({"type":"message_start","message":{"id":"m"}})))
            .unwrap();
        assert!(matches!(d.finish(), Err(ProviderError::Protocol(_))));
    }

    #[test]
    fn overloaded_error_event_is_transient() {
        let mut d = AnthropicDecoder::new();
        let err = d
            .decode(&frame(json!({"type":"error",
                "error":{"type":"overloaded_error","message":"Overloaded"}})))
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn request_body_places_system_and_cache_marks() {
        let provider = AnthropicProvider::new("key", "claude-test");
        let mut old = Message::user("old");
        old.cache_mark = false;
        let mut recent = Message::tool_result("toolu_1", "file.txt", false);
        recent.cache_mark = true;
        let request = ModelRequest {
            system: "be careful".into(),
            messages: vec![old, Message::tool_use("toolu_1", "ls", json!({})), recent],
            tools: vec![ToolSpec {
                name: "ls".into(),
                description: "list".into(),
                parameters: json!({"type":"object"}),
            }],
            max_tokens: 100,
        };
        let body = provider.build_request_body(&request);
        assert_eq!(body["system"], "be careful");
        assert_eq!(body["stream"], true);
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["messages"][0]["content"], "old");
        assert_eq!(body["messages"][1]["content"][0]["type"], "tool_use");
        let last = &body["messages"][2]["content"][0];
        assert_eq!(last["type"], "tool_result");
        assert_eq!(last["cache_control"]["type"], "ephemeral");
    }
}
