use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::message::ToolSpec;

// ---------------------------------------------------------------------------
// ToolExecutionResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolErrorInfo {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Outcome of one tool execution, success or not. Failures are data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolExecutionResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorInfo>,
}

impl ToolExecutionResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(ToolErrorInfo {
                message: message.into(),
                code: None,
                details: None,
            }),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        if let Some(err) = self.error.as_mut() {
            err.code = Some(code.into());
        }
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error.as_ref().map(|e| e.message.as_str())
    }

    /// Text handed back to the model as the tool result.
    pub fn to_model_text(&self) -> String {
        match (&self.error, self.output.is_empty()) {
            (None, _) => self.output.clone(),
            (Some(err), true) => format!("Error: {}", err.message),
            (Some(err), false) => format!("Error: {}\n{}", err.message, self.output),
        }
    }
}

// ---------------------------------------------------------------------------
// ToolError / ToolHandler
// ---------------------------------------------------------------------------

/// Raised by a tool that could not run at all. The dispatcher turns it into
/// a failed [`ToolExecutionResult`].
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// A named capability the model may invoke.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Name, description and JSON Schema advertised to the model.
    fn spec(&self) -> ToolSpec;

    async fn execute(&self, args: Value) -> Result<ToolExecutionResult, ToolError>;
}

// ---------------------------------------------------------------------------
// ToolRegistry
// ---------------------------------------------------------------------------

/// Tools available to one conversation, keyed by name.
///
/// Ordered so the advertised tool list is stable between requests.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn ToolHandler>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any previous tool of the same name.
    pub fn register(&mut self, tool: Arc<dyn ToolHandler>) {
        let name = tool.spec().name;
        debug!(tool = %name, "registering tool");
        self.tools.insert(name, tool);
    }

    pub fn extend(&mut self, tools: impl IntoIterator<Item = Arc<dyn ToolHandler>>) {
        for tool in tools {
            self.register(tool);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).cloned()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(|t| t.spec()).collect()
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

// ---------------------------------------------------------------------------
// AsyncFnTool
// ---------------------------------------------------------------------------

type AsyncToolFn = Box<
    dyn Fn(Value) -> Pin<Box<dyn Future<Output = Result<ToolExecutionResult, ToolError>> + Send>>
        + Send
        + Sync,
>;

/// A tool built from an async closure.
pub struct AsyncFnTool {
    spec: ToolSpec,
    func: AsyncToolFn,
}

impl AsyncFnTool {
    pub fn new<F, Fut>(spec: ToolSpec, func: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolExecutionResult, ToolError>> + Send + 'static,
    {
        Self {
            spec,
            func: Box::new(move |args| Box::pin(func(args))),
        }
    }
}

#[async_trait]
impl ToolHandler for AsyncFnTool {
    fn spec(&self) -> ToolSpec {
        self.spec.clone()
    }

    async fn execute(&self, args: Value) -> Result<ToolExecutionResult, ToolError> {
        (self.func)(args).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo() -> Arc<dyn ToolHandler> {
        Arc::new(AsyncFnTool::new(
            ToolSpec {
                name: "echo".into(),
                description: "echo args".into(),
                parameters: json!({"type": "object"}),
            },
            |args| async move { Ok(ToolExecutionResult::ok(args.to_string())) },
        ))
    }

    #[tokio::test]
    async fn registry_lookup_and_execute() {
        let mut reg = ToolRegistry::new();
        reg.register(echo());
        assert!(reg.has_tool("echo"));
        assert_eq!(reg.len(), 1);
        let out = reg
            .get("echo")
            .unwrap()
            .execute(json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(out.output, "{\"a\":1}");
    }

    #[test]
    fn model_text_includes_error() {
        let r = ToolExecutionResult::failed("boom").with_output("partial");
        assert_eq!(r.to_model_text(), "Error: boom\npartial");
        assert_eq!(ToolExecutionResult::ok("fine").to_model_text(), "fine");
    }

    #[test]
    fn with_code_sets_error_code() {
        let r = ToolExecutionResult::failed("no").with_code("NOT_FOUND");
        assert_eq!(r.error.unwrap().code.as_deref(), Some("NOT_FOUND"));
    }
}
