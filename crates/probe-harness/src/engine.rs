//! Conversation loop controller.
//!
//! One [`Conversation`] drives a single scenario attempt:
//!
//! ```text
//! AwaitingModel -> (ProcessingStream -> ToolDispatch)* -> Terminated
//! ```
//!
//! Each iteration sends the whole transcript plus the system prompt and
//! consumes the normalized event stream. A completed tool call is appended
//! as an assistant tool-use message, dispatched to completion, and answered
//! with a tool-result message before the next stream event is read, so a
//! tool-use block is always paired with its result before the next request.
//!
//! The loop ends when a turn stops for any reason other than tool use, or
//! when the API-call budget runs out; the latter appends an explanatory
//! assistant message and is not an error.

use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::StreamExt;
use probe_core::types::ToolExecution;
use tracing::{debug, info, warn};

use crate::cancel::CancelSignal;
use crate::dispatch::ToolDispatcher;
use crate::message::{apply_cache_window, Message, Role};
use crate::provider::{EventStream, ModelProvider, ModelRequest, ProviderError, StopReason, StreamEvent};
use crate::tool::ToolRegistry;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("conversation cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub system_prompt: String,
    pub api_call_budget: u32,
    pub cache_window: usize,
    pub max_tokens: u32,
}

impl EngineConfig {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            api_call_budget: 30,
            cache_window: 3,
            max_tokens: 4096,
        }
    }

    pub fn with_budget(mut self, budget: u32) -> Self {
        self.api_call_budget = budget;
        self
    }

    pub fn with_cache_window(mut self, window: usize) -> Self {
        self.cache_window = window;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingModel,
    ProcessingStream,
    ToolDispatch,
    Terminated,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// The model ended its turn without asking for a tool.
    Completed(StopReason),
    /// The request budget ran out while the model still wanted tools.
    BudgetExhausted { requests: u32 },
}

/// Everything a finished conversation produced.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub messages: Vec<Message>,
    pub tool_executions: Vec<ToolExecution>,
    pub requests: u32,
    pub termination: Termination,
}

impl Transcript {
    /// Text of the last non-empty assistant message.
    pub fn final_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .map(Message::text_content)
            .find(|t| !t.trim().is_empty())
    }

    pub fn budget_exhausted(&self) -> bool {
        matches!(self.termination, Termination::BudgetExhausted { .. })
    }
}

/// Tool executions recorded as they complete.
///
/// Clones share one log. Entries survive the conversation being dropped or
/// failing part way.
#[derive(Debug, Clone, Default)]
pub struct ExecutionLog(Arc<Mutex<Vec<ToolExecution>>>);

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, execution: ToolExecution) {
        self.lock().push(execution);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the executions recorded so far.
    pub fn snapshot(&self) -> Vec<ToolExecution> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ToolExecution>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One conversation: transcript, dispatcher (with its call cache) and budget.
pub struct Conversation {
    provider: Arc<dyn ModelProvider>,
    dispatcher: ToolDispatcher,
    config: EngineConfig,
    messages: Vec<Message>,
    executions: ExecutionLog,
    requests: u32,
    state: LoopState,
}

impl Conversation {
    pub fn new(provider: Arc<dyn ModelProvider>, tools: ToolRegistry, config: EngineConfig) -> Self {
        Self {
            provider,
            dispatcher: ToolDispatcher::new(tools),
            config,
            messages: Vec::new(),
            executions: ExecutionLog::new(),
            requests: 0,
            state: LoopState::AwaitingModel,
        }
    }

    /// Record tool executions into `log` instead of a private one.
    pub fn with_execution_log(mut self, log: ExecutionLog) -> Self {
        self.executions = log;
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run the loop to completion for `prompt`.
    ///
    /// Returns [`EngineError::Cancelled`] as soon as `cancel` fires, whether
    /// the loop is waiting on the model or on a tool.
    pub async fn run(
        mut self,
        prompt: impl Into<String>,
        cancel: &CancelSignal,
    ) -> Result<Transcript, EngineError> {
        self.messages.push(Message::user(prompt));

        loop {
            if self.requests >= self.config.api_call_budget {
                let budget = self.config.api_call_budget;
                warn!(budget, "API call budget exhausted");
                self.messages.push(Message::assistant(format!(
                    "Stopping here: the API call budget of {budget} requests was exhausted \
                     before the task was finished."
                )));
                let requests = self.requests;
                return Ok(self.finish(Termination::BudgetExhausted { requests }));
            }

            self.state = LoopState::AwaitingModel;
            apply_cache_window(&mut self.messages, self.config.cache_window);
            let request = ModelRequest {
                system: self.config.system_prompt.clone(),
                messages: self.messages.clone(),
                tools: self.dispatcher.specs(),
                max_tokens: self.config.max_tokens,
            };
            self.requests += 1;
            debug!(request = self.requests, messages = self.messages.len(), "sending model request");

            let provider = Arc::clone(&self.provider);
            let mut stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                opened = provider.stream(request) => opened?,
            };

            self.state = LoopState::ProcessingStream;
            let (stop, tool_calls) = self.consume(&mut stream, cancel).await?;

            if !stop.is_tool_use() {
                return Ok(self.finish(Termination::Completed(stop)));
            }
            if tool_calls == 0 {
                warn!("turn stopped for tool use without a tool call");
                return Ok(self.finish(Termination::Completed(stop)));
            }
        }
    }

    /// Read one turn's events, dispatching tool calls inline.
    async fn consume(
        &mut self,
        stream: &mut EventStream,
        cancel: &CancelSignal,
    ) -> Result<(StopReason, usize), EngineError> {
        let mut text = String::new();
        let mut tool_calls = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                next = stream.next() => next,
            };
            let event = match next {
                Some(event) => event?,
                None => {
                    return Err(ProviderError::Protocol(
                        "stream ended without a termination signal".into(),
                    )
                    .into())
                }
            };

            match event {
                StreamEvent::TextDelta(delta) => text.push_str(&delta),
                StreamEvent::TextBlockEnd => self.flush_text(&mut text),
                StreamEvent::ToolCallComplete(call) => {
                    self.flush_text(&mut text);
                    self.messages
                        .push(Message::tool_use(&call.id, &call.name, call.args.clone()));

                    self.state = LoopState::ToolDispatch;
                    let dispatch = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                        d = self.dispatcher.dispatch(&call) => d,
                    };
                    self.executions.record(dispatch.to_execution(&call));
                    self.messages.push(Message::tool_result(
                        &call.id,
                        dispatch.result.to_model_text(),
                        !dispatch.result.success,
                    ));
                    self.state = LoopState::ProcessingStream;
                    tool_calls += 1;
                }
                StreamEvent::TurnTerminated(stop) => {
                    self.flush_text(&mut text);
                    return Ok((stop, tool_calls));
                }
            }
        }
    }

    fn flush_text(&mut self, text: &mut String) {
        if !text.is_empty() {
            self.messages.push(Message::assistant(std::mem::take(text)));
        }
    }

    fn finish(mut self, termination: Termination) -> Transcript {
        self.state = LoopState::Terminated;
        info!(
            requests = self.requests,
            tools = self.executions.len(),
            distinct_calls = self.dispatcher.cached_calls(),
            termination = ?termination,
            "conversation finished"
        );
        Transcript {
            messages: self.messages,
            tool_executions: self.executions.snapshot(),
            requests: self.requests,
            termination,
        }
    }
}
