use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, info};

use crate::message::ToolSpec;
use crate::security::CommandPolicy;
use crate::tool::{ToolError, ToolExecutionResult, ToolHandler};

pub const COMMAND_TOOL_NAME: &str = "execute_command";

/// Output beyond this many bytes is cut before it reaches the model.
const MAX_OUTPUT_BYTES: usize = 32 * 1024;

// ---------------------------------------------------------------------------
// EnvOverrides
// ---------------------------------------------------------------------------

/// Environment changes applied to every command of one scenario.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOverrides {
    set: BTreeMap<String, String>,
    unset: BTreeSet<String>,
}

impl EnvOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later directives win over earlier ones for the same key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.unset.remove(&key);
        self.set.insert(key, value.into());
    }

    pub fn unset(&mut self, key: impl Into<String>) {
        let key = key.into();
        self.set.remove(&key);
        self.unset.insert(key);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.set.get(key).map(String::as_str)
    }

    pub fn is_unset(&self, key: &str) -> bool {
        self.unset.contains(key)
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.unset.is_empty()
    }

    pub fn apply(&self, cmd: &mut Command) {
        for key in &self.unset {
            cmd.env_remove(key);
        }
        cmd.envs(&self.set);
    }
}

// ---------------------------------------------------------------------------
// CommandTool
// ---------------------------------------------------------------------------

/// Runs policy-checked shell commands inside one scenario directory.
pub struct CommandTool {
    workdir: PathBuf,
    policy: CommandPolicy,
    env: EnvOverrides,
    timeout: Duration,
}

impl CommandTool {
    pub fn new(workdir: impl Into<PathBuf>, policy: CommandPolicy) -> Self {
        Self {
            workdir: workdir.into(),
            policy,
            env: EnvOverrides::default(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn with_env(mut self, env: EnvOverrides) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }
}

#[async_trait]
impl ToolHandler for CommandTool {
    fn spec(&self) -> ToolSpec {
        let verbs: Vec<&str> = self.policy.allowed_verbs().collect();
        ToolSpec {
            name: COMMAND_TOOL_NAME.into(),
            description: format!(
                "Run a shell command in the scenario working directory {}. \
                 Allowed commands: {}. Destructive commands are rejected.",
                self.workdir.display(),
                verbs.join(", ")
            ),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "The command line to execute"
                    }
                },
                "required": ["command"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> Result<ToolExecutionResult, ToolError> {
        let command = args
            .get("command")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::InvalidArgs("missing string field `command`".into()))?;

        if let Err(e) = self.policy.check(command) {
            return Ok(ToolExecutionResult::failed(format!("command rejected: {e}"))
                .with_code("COMMAND_REJECTED"));
        }

        debug!(command, workdir = %self.workdir.display(), "running command");
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.env.apply(&mut cmd);

        let child = cmd.spawn()?;
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(out) => out?,
            Err(_) => {
                return Ok(ToolExecutionResult::failed(format!(
                    "command timed out after {}s",
                    self.timeout.as_secs()
                ))
                .with_code("COMMAND_TIMEOUT"));
            }
        };

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str("[stderr]\n");
            text.push_str(&stderr);
        }
        let text = truncate_output(text);

        info!(command, status = ?output.status.code(), "command finished");
        if output.status.success() {
            Ok(ToolExecutionResult::ok(text))
        } else {
            let code = output
                .status
                .code()
                .map(|c| format!("EXIT_{c}"))
                .unwrap_or_else(|| "SIGNALED".into());
            Ok(ToolExecutionResult::failed(format!(
                "command exited with status {}",
                output.status
            ))
            .with_code(code)
            .with_output(text))
        }
    }
}

fn truncate_output(mut text: String) -> String {
    if text.len() <= MAX_OUTPUT_BYTES {
        return text;
    }
    let mut cut = MAX_OUTPUT_BYTES;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let dropped = text.len() - cut;
    text.truncate(cut);
    text.push_str(&format!("\n... [{dropped} bytes truncated]"));
    text
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_last_directive_wins() {
        let mut env = EnvOverrides::new();
        env.set("A", "1");
        env.unset("A");
        assert!(env.get("A").is_none());
        assert!(env.is_unset("A"));
        env.set("A", "2");
        assert_eq!(env.get("A"), Some("2"));
        assert!(!env.is_unset("A"));
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let long = "é".repeat(MAX_OUTPUT_BYTES);
        let out = truncate_output(long);
        assert!(out.contains("bytes truncated"));
    }

    #[test]
    fn spec_lists_allowed_verbs() {
        let tool = CommandTool::new("/tmp", CommandPolicy::new(["ls"]).with_product_cli("acme"));
        let spec = tool.spec();
        assert_eq!(spec.name, COMMAND_TOOL_NAME);
        assert!(spec.description.contains("ls, acme"));
    }
}
