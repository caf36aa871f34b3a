//! Harness: the conversation engine that drives a model through tool calls.
//!
//! This crate sits between the scenario runner and the outside world:
//! - Message model and the provider trait every backend implements
//! - Streaming decoders for the Anthropic and OpenAI wire formats, unified
//!   into one event set
//! - Tool registry, the scoped command tool and its policy
//! - Stdio remote tool client (JSON-RPC `tools/list` / `tools/call`)
//! - Per-conversation dispatch cache and the budgeted loop controller
//! - Cancellation signal threaded through every await of a conversation

pub mod anthropic;
pub mod cancel;
pub mod command_tool;
pub mod dispatch;
pub mod engine;
pub mod mcp;
pub mod message;
pub mod openai;
pub mod provider;
pub mod remote;
pub mod security;
pub mod sse;
pub mod tool;
