use ahash::AHashMap;
use probe_core::types::ToolExecution;
use serde_json::Value;
use tracing::{info, warn};

use crate::message::ToolSpec;
use crate::provider::ToolCall;
use crate::tool::{ToolExecutionResult, ToolRegistry};

/// A completed call kept for reuse within one conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRecord {
    pub name: String,
    pub args: Value,
    pub result: ToolExecutionResult,
    pub tool_use_id: String,
}

/// Cache key for a call: tool name plus compact JSON of the arguments.
///
/// Object keys serialize in sorted order, so argument objects that differ
/// only in key order share a signature.
pub fn call_signature(name: &str, args: &Value) -> String {
    format!("{name}\u{0}{args}")
}

/// Result of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub result: ToolExecutionResult,
    /// Served from an earlier identical call.
    pub cached: bool,
}

impl Dispatch {
    pub fn to_execution(&self, call: &ToolCall) -> ToolExecution {
        ToolExecution {
            tool_use_id: call.id.clone(),
            name: call.name.clone(),
            args: call.args.clone(),
            success: self.result.success,
            output: self.result.output.clone(),
            error: self.result.error_message().map(str::to_string),
            cached: self.cached,
        }
    }
}

/// Routes tool calls to handlers and owns the per-conversation call cache.
///
/// One dispatcher per conversation; the cache dies with it.
pub struct ToolDispatcher {
    registry: ToolRegistry,
    cache: AHashMap<String, ToolCallRecord>,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Self {
            registry,
            cache: AHashMap::new(),
        }
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.registry.specs()
    }

    pub fn cached_calls(&self) -> usize {
        self.cache.len()
    }

    /// Execute `call`, or reuse the result of an identical earlier call.
    ///
    /// Never fails: unknown tools and handler errors come back as failed
    /// results for the model to read.
    pub async fn dispatch(&mut self, call: &ToolCall) -> Dispatch {
        let signature = call_signature(&call.name, &call.args);
        if let Some(record) = self.cache.get(&signature) {
            info!(
                tool = %call.name,
                first_use = %record.tool_use_id,
                "tool call served from cache"
            );
            return Dispatch {
                result: record.result.clone(),
                cached: true,
            };
        }

        let Some(handler) = self.registry.get(&call.name) else {
            warn!(tool = %call.name, "model requested unknown tool");
            return Dispatch {
                result: ToolExecutionResult::failed(format!("tool not found: {}", call.name))
                    .with_code("TOOL_NOT_FOUND"),
                cached: false,
            };
        };

        let result = match handler.execute(call.args.clone()).await {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = %call.name, error = %e, "tool execution raised");
                ToolExecutionResult::failed(e.to_string()).with_code("TOOL_EXCEPTION")
            }
        };
        info!(tool = %call.name, success = result.success, "executed tool");

        self.cache.insert(
            signature,
            ToolCallRecord {
                name: call.name.clone(),
                args: call.args.clone(),
                result: result.clone(),
                tool_use_id: call.id.clone(),
            },
        );
        Dispatch {
            result,
            cached: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
