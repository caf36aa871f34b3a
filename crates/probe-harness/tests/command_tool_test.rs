use std::time::Duration;

use probe_harness::command_tool::{CommandTool, EnvOverrides};
use probe_harness::security::CommandPolicy;
use probe_harness::tool::{ToolError, ToolHandler};
use serde_json::json;

fn policy() -> CommandPolicy {
    CommandPolicy::new(["echo", "ls", "cat", "printenv", "sleep", "false", "pwd"])
}

#[tokio::test]
async fn test_runs_inside_workdir() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("marker.txt"), "hello marker").unwrap();
    let tool = CommandTool::new(dir.path(), policy());

    let listed = tool.execute(json!({"command": "ls"})).await.unwrap();
    assert!(listed.success);
    assert!(listed.output.contains("marker.txt"));

    let read = tool.execute(json!({"command": "cat marker.txt"})).await.unwrap();
    assert_eq!(read.output, "hello marker");
}

#[tokio::test]
async fn test_env_overrides_apply() {
    let dir = tempfile::tempdir().unwrap();
    let mut env = EnvOverrides::new();
    env.set("PROBE_GREETING", "bonjour");
    env.unset("HOME");
    let tool = CommandTool::new(dir.path(), policy()).with_env(env);

    let out = tool
        .execute(json!({"command": "printenv PROBE_GREETING"}))
        .await
        .unwrap();
    assert_eq!(out.output.trim(), "bonjour");

    let home = tool.execute(json!({"command": "printenv HOME"})).await.unwrap();
    assert!(!home.success, "HOME should be unset");
}

#[tokio::test]
async fn test_rejected_commands_never_run() {
    let dir = tempfile::tempdir().unwrap();
    let victim = dir.path().join("keep.txt");
    std::fs::write(&victim, "x").unwrap();
    let tool = CommandTool::new(dir.path(), policy());

    let out = tool
        .execute(json!({"command": "echo hi && rm keep.txt"}))
        .await
        .unwrap();
    assert!(!out.success);
    assert_eq!(out.error.as_ref().unwrap().code.as_deref(), Some("COMMAND_REJECTED"));
    assert!(victim.exists());

    let out = tool.execute(json!({"command": "curl example.com"})).await.unwrap();
    assert!(!out.success);
}

#[tokio::test]
async fn test_non_zero_exit_is_failed_result() {
    let dir = tempfile::tempdir().unwrap();
    let tool = CommandTool::new(dir.path(), policy());
    let out = tool.execute(json!({"command": "false"})).await.unwrap();
    assert!(!out.success);
    assert_eq!(out.error.as_ref().unwrap().code.as_deref(), Some("EXIT_1"));
}

#[tokio::test]
async fn test_timeout_kills_the_command() {
    let dir = tempfile::tempdir().unwrap();
    let tool = CommandTool::new(dir.path(), policy()).with_timeout(Duration::from_millis(100));
    let out = tool.execute(json!({"command": "sleep 5"})).await.unwrap();
    assert!(!out.success);
    assert!(out.error_message().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_missing_command_argument() {
    let dir = tempfile::tempdir().unwrap();
    let tool = CommandTool::new(dir.path(), policy());
    let err = tool.execute(json!({"cmd": "ls"})).await.unwrap_err();
    assert!(matches!(err, ToolError::InvalidArgs(_)));
}
