//! Conversation loop tests against the scripted provider.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use probe_harness::cancel::CancelSignal;
use probe_harness::engine::{Conversation, EngineConfig, EngineError, ExecutionLog, Termination};
use probe_harness::message::{ContentBlock, Role, ToolSpec};
use probe_harness::provider::{ProviderError, ScriptedProvider, StopReason, StreamEvent};
use probe_harness::tool::{AsyncFnTool, ToolError, ToolExecutionResult, ToolRegistry};
use serde_json::json;

fn spec(name: &str) -> ToolSpec {
    ToolSpec {
        name: name.into(),
        description: format!("{name} tool"),
        parameters: json!({"type": "object"}),
    }
}

fn counting_tool(name: &str, counter: Arc<AtomicUsize>) -> ToolRegistry {
    let mut reg = ToolRegistry::new();
    reg.register(Arc::new(AsyncFnTool::new(spec(name), move |args| {
        let counter = counter.clone();
        async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(ToolExecutionResult::ok(format!("run {n} with {args}")))
        }
    })));
    reg
}

// ===========================================================================
// Turn handling
// ===========================================================================

#[tokio::test]
async fn test_plain_text_turn_completes() {
    let provider = Arc::new(ScriptedProvider::new().with_text("all done"));
    let conv = Conversation::new(provider.clone(), ToolRegistry::new(), EngineConfig::new("sys"));

    let transcript = conv.run("do it", &CancelSignal::new()).await.unwrap();

    assert_eq!(transcript.requests, 1);
    assert_eq!(transcript.termination, Termination::Completed(StopReason::EndTurn));
    assert_eq!(transcript.final_text().as_deref(), Some("all done"));
    assert_eq!(provider.requests()[0].system, "sys");
}

#[tokio::test]
async fn test_tool_use_is_paired_with_result_before_next_request() {
    let counter = Arc::new(AtomicUsize::new(0));
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_tool_call("toolu_1", "probe", json!({"path": "a"}))
            .with_text("finished"),
    );
    let conv = Conversation::new(
        provider.clone(),
        counting_tool("probe", counter.clone()),
        EngineConfig::new("sys"),
    );

    let transcript = conv.run("go", &CancelSignal::new()).await.unwrap();
    assert_eq!(transcript.requests, 2);
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // Second request must already contain the tool_use and its result.
    let second = &provider.requests()[1];
    let n = second.messages.len();
    assert!(matches!(
        second.messages[n - 2].blocks(),
        [ContentBlock::ToolUse { id, .. }] if id == "toolu_1"
    ));
    assert!(matches!(
        second.messages[n - 1].blocks(),
        [ContentBlock::ToolResult { tool_use_id, is_error: false, .. }] if tool_use_id == "toolu_1"
    ));
    assert_eq!(second.messages[n - 1].role, Role::User);
    assert_eq!(transcript.tool_executions.len(), 1);
}

#[tokio::test]
async fn test_identical_calls_hit_the_cache() {
    let counter = Arc::new(AtomicUsize::new(0));
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_tool_call("t1", "probe", json!({"b": 2, "a": 1}))
            .with_tool_call("t2", "probe", json!({"a": 1, "b": 2}))
            .with_text("ok"),
    );
    let conv = Conversation::new(provider, counting_tool("probe", counter.clone()), EngineConfig::new("s"));

    let transcript = conv.run("go", &CancelSignal::new()).await.unwrap();

    assert_eq!(counter.load(Ordering::SeqCst), 1, "second call served from cache");
    let execs = &transcript.tool_executions;
    assert_eq!(execs.len(), 2);
    assert!(!execs[0].cached);
    assert!(execs[1].cached);
    assert_eq!(execs[0].output, execs[1].output);

    let results: Vec<&str> = transcript
        .messages
        .iter()
        .flat_map(|m| m.blocks())
        .filter_map(|b| match b {
            ContentBlock::ToolResult { content, .. } => Some(content.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0], results[1]);
}

#[tokio::test]
async fn test_unknown_and_failing_tools_do_not_stop_the_loop() {
    let mut reg = ToolRegistry::new();
    reg.register(Arc::new(AsyncFnTool::new(spec("flaky"), |_| async {
        Err(ToolError::ExecutionFailed("network unreachable".into()))
    })));
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_tool_call("t1", "missing", json!({}))
            .with_tool_call("t2", "flaky", json!({}))
            .with_text("gave up"),
    );
    let conv = Conversation::new(provider, reg, EngineConfig::new("s"));

    let transcript = conv.run("go", &CancelSignal::new()).await.unwrap();
    assert_eq!(transcript.requests, 3);
    let execs = &transcript.tool_executions;
    assert!(!execs[0].success);
    assert!(execs[0].error.as_deref().unwrap().contains("tool not found"));
    assert!(!execs[1].success);
    assert!(execs[1].error.as_deref().unwrap().contains("network unreachable"));
}

#[tokio::test]
async fn test_text_and_tool_in_one_turn_keep_order() {
    let counter = Arc::new(AtomicUsize::new(0));
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_turn(vec![
                StreamEvent::TextDelta("Let me ".into()),
                StreamEvent::TextDelta("look.".into()),
                StreamEvent::TextBlockEnd,
                StreamEvent::ToolCallComplete(probe_harness::provider::ToolCall {
                    id: "t1".into(),
                    name: "probe".into(),
                    args: json!({}),
                }),
                StreamEvent::TurnTerminated(StopReason::ToolUse),
            ])
            .with_text("done"),
    );
    let conv = Conversation::new(provider, counting_tool("probe", counter), EngineConfig::new("s"));
    let transcript = conv.run("go", &CancelSignal::new()).await.unwrap();

    assert_eq!(transcript.messages[1].text_content(), "Let me look.");
    assert!(matches!(transcript.messages[2].blocks(), [ContentBlock::ToolUse { .. }]));
    assert!(matches!(transcript.messages[3].blocks(), [ContentBlock::ToolResult { .. }]));
}

// ===========================================================================
// Budget and cache window
// ===========================================================================

#[tokio::test]
async fn test_budget_exhaustion_is_a_controlled_stop() {
    let counter = Arc::new(AtomicUsize::new(0));
    let provider = Arc::new(ScriptedProvider::new().with_fallback(ScriptedProvider::tool_turn(
        "loop",
        "probe",
        json!({"n": 1}),
    )));
    let conv = Conversation::new(
        provider.clone(),
        counting_tool("probe", counter),
        EngineConfig::new("s").with_budget(4),
    );

    let transcript = conv.run("go", &CancelSignal::new()).await.unwrap();

    assert_eq!(provider.request_count(), 4);
    assert!(transcript.budget_exhausted());
    assert_eq!(transcript.termination, Termination::BudgetExhausted { requests: 4 });
    let last = transcript.messages.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    assert!(last.text_content().contains("budget"));
}

#[tokio::test]
async fn test_cache_window_marks_only_recent_messages() {
    let counter = Arc::new(AtomicUsize::new(0));
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_tool_call("t1", "probe", json!({"n": 1}))
            .with_tool_call("t2", "probe", json!({"n": 2}))
            .with_text("done"),
    );
    let conv = Conversation::new(
        provider.clone(),
        counting_tool("probe", counter),
        EngineConfig::new("s").with_cache_window(3),
    );
    conv.run("go", &CancelSignal::new()).await.unwrap();

    let last = provider.requests().pop().unwrap();
    let marks: Vec<bool> = last.messages.iter().map(|m| m.cache_mark).collect();
    assert_eq!(marks, vec![false, false, true, true, true]);
}

// ===========================================================================
// Errors and cancellation
// ===========================================================================

#[tokio::test]
async fn test_provider_error_propagates() {
    let provider = Arc::new(
        ScriptedProvider::new().with_error(ProviderError::Api {
            status: 503,
            message: "overloaded".into(),
        }),
    );
    let conv = Conversation::new(provider, ToolRegistry::new(), EngineConfig::new("s"));
    let err = conv.run("go", &CancelSignal::new()).await.unwrap_err();
    match err {
        EngineError::Provider(e) => assert!(e.is_transient()),
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn test_execution_log_keeps_calls_made_before_a_failure() {
    let counter = Arc::new(AtomicUsize::new(0));
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_tool_call("t1", "lookup", json!({"path": "a"}))
            .with_error(ProviderError::Api {
                status: 500,
                message: "boom".into(),
            }),
    );
    let log = ExecutionLog::new();
    let conv = Conversation::new(provider, counting_tool("lookup", counter), EngineConfig::new("s"))
        .with_execution_log(log.clone());

    assert!(conv.run("go", &CancelSignal::new()).await.is_err());
    let recorded = log.snapshot();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].tool_use_id, "t1");
    assert!(recorded[0].success);
}

#[tokio::test]
async fn test_stream_without_termination_is_a_protocol_error() {
    let provider = Arc::new(ScriptedProvider::new().with_turn(vec![StreamEvent::TextDelta("hi".into())]));
    let conv = Conversation::new(provider, ToolRegistry::new(), EngineConfig::new("s"));
    let err = conv.run("go", &CancelSignal::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Provider(ProviderError::Protocol(_))));
}

#[tokio::test]
async fn test_cancel_interrupts_a_slow_model() {
    let provider = Arc::new(
        ScriptedProvider::new()
            .with_text("too late")
            .with_delay(Duration::from_secs(30)),
    );
    let conv = Conversation::new(provider, ToolRegistry::new(), EngineConfig::new("s"));
    let cancel = CancelSignal::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(2), conv.run("go", &cancel))
        .await
        .expect("cancellation is prompt");
    assert!(matches!(result, Err(EngineError::Cancelled)));
}

#[tokio::test]
async fn test_cancel_interrupts_a_running_tool() {
    let mut reg = ToolRegistry::new();
    reg.register(Arc::new(AsyncFnTool::new(spec("slow"), |_| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(ToolExecutionResult::ok("never"))
    })));
    let provider = Arc::new(ScriptedProvider::new().with_tool_call("t1", "slow", json!({})));
    let conv = Conversation::new(provider, reg, EngineConfig::new("s"));
    let cancel = CancelSignal::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(2), conv.run("go", &cancel))
        .await
        .expect("cancellation is prompt");
    assert!(matches!(result, Err(EngineError::Cancelled)));
}
