//! Scenario execution harness.
//!
//! One [`ScenarioHarness::run`] call owns a scenario from start to finish:
//!
//! 1. create the isolated environment, copy project metadata, process the
//!    task directives and build the tools bound to that directory
//! 2. run attempts until one produces a verdict, a non-retryable error
//!    occurs, the timeout fires or the attempt budget runs out
//! 3. shut down the remote tool server and remove the environment
//! 4. summarize the approach and classify PASS/FAIL
//!
//! Every exit path returns a [`ScenarioResult`]; nothing escapes as an error.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use probe_core::config::{Config, RemoteToolsConfig};
use probe_core::types::{FinalAnswer, Outcome, ScenarioDescriptor, ScenarioResult, ToolExecution};
use probe_harness::cancel::{CancelGuard, CancelSignal};
use probe_harness::command_tool::{CommandTool, EnvOverrides};
use probe_harness::engine::{
    Conversation, EngineConfig, EngineError, ExecutionLog, Termination, Transcript,
};
use probe_harness::mcp::RemoteServerConfig;
use probe_harness::provider::{ModelProvider, ProviderError};
use probe_harness::remote::RemoteToolClient;
use probe_harness::security::CommandPolicy;
use probe_harness::tool::{ToolHandler, ToolRegistry};
use tracing::{debug, error, info, warn};

use crate::answer::parse_final_answer;
use crate::assets::AssetResolver;
use crate::environment::IsolatedEnvironment;
use crate::prompts::{task_prompt, DEFAULT_SYSTEM_PROMPT};
use crate::retry::{is_transient_message, RetryPolicy};
use crate::summarizer::ApproachSummarizer;

// ---------------------------------------------------------------------------
// Attempt errors
// ---------------------------------------------------------------------------

/// Why one attempt did not yield a verdict.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttemptError {
    /// Network-like failure; retried after a backoff.
    #[error("{message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },
    /// Missing or malformed verdict, bad tool-call JSON, broken stream.
    /// Counts as a failed attempt and is retried like a transient one.
    #[error("{0}")]
    Protocol(String),
    /// Not worth retrying.
    #[error("{0}")]
    Fatal(String),
    /// Wall clock exceeded. Ends the scenario without further attempts.
    #[error("scenario timed out after {}s", .0.as_secs())]
    Timeout(Duration),
}

impl AttemptError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AttemptError::Transient { .. } | AttemptError::Protocol(_))
    }

    fn from_engine(err: EngineError) -> Self {
        let provider = match err {
            EngineError::Cancelled => return AttemptError::Fatal("scenario cancelled".into()),
            EngineError::Provider(e) => e,
        };
        let message = provider.to_string();
        match provider {
            ProviderError::RateLimited { retry_after_secs } => AttemptError::Transient {
                message,
                retry_after: retry_after_secs.map(Duration::from_secs),
            },
            ProviderError::Protocol(_) | ProviderError::MalformedToolArgs { .. } => {
                AttemptError::Protocol(message)
            }
            ProviderError::NotConfigured(_) => AttemptError::Fatal(message),
            other if other.is_transient() || is_transient_message(&message) => {
                AttemptError::Transient {
                    message,
                    retry_after: None,
                }
            }
            _ => AttemptError::Fatal(message),
        }
    }
}

/// What one attempt left behind, verdict or not.
struct AttemptRecord {
    outcome: Result<FinalAnswer, AttemptError>,
    executions: Vec<ToolExecution>,
    final_text: String,
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HarnessSettings {
    pub workspace_root: PathBuf,
    pub project_root: PathBuf,
    pub metadata_files: Vec<String>,
    pub assets_dir: PathBuf,
    pub policy: CommandPolicy,
    pub command_timeout: Duration,
    /// Wall-clock limit for one attempt.
    pub scenario_timeout: Duration,
    pub retry: RetryPolicy,
    pub engine: EngineConfig,
    pub summary_max_tokens: u32,
    pub remote_tools: Option<RemoteToolsConfig>,
}

impl HarnessSettings {
    pub fn from_config(config: &Config) -> Self {
        let system_prompt = config
            .conversation
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
        Self {
            workspace_root: config.runner.workspace_root(),
            project_root: config.runner.project_root.clone(),
            metadata_files: config.runner.metadata_files.clone(),
            assets_dir: config.runner.assets_dir.clone(),
            policy: CommandPolicy::from_config(&config.runner),
            command_timeout: config.runner.command_timeout(),
            scenario_timeout: config.runner.scenario_timeout(),
            retry: RetryPolicy::from_config(&config.retry),
            engine: EngineConfig::new(system_prompt)
                .with_budget(config.conversation.api_call_budget)
                .with_cache_window(config.conversation.cache_window)
                .with_max_tokens(config.provider.max_tokens),
            summary_max_tokens: config.conversation.summary_max_tokens,
            remote_tools: config
                .remote_tools
                .enabled
                .then(|| config.remote_tools.clone()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.scenario_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

// ===========================================================================
// ScenarioHarness
// ===========================================================================

pub struct ScenarioHarness {
    provider: Arc<dyn ModelProvider>,
    summarizer: ApproachSummarizer,
    settings: HarnessSettings,
    assets: AssetResolver,
    extra_tools: Vec<Arc<dyn ToolHandler>>,
    cancel: CancelSignal,
}

impl ScenarioHarness {
    pub fn new(provider: Arc<dyn ModelProvider>, settings: HarnessSettings) -> Self {
        Self {
            summarizer: ApproachSummarizer::new(Arc::clone(&provider), settings.summary_max_tokens),
            assets: AssetResolver::new(settings.assets_dir.clone()),
            provider,
            settings,
            extra_tools: Vec::new(),
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_summarizer(mut self, summarizer: ApproachSummarizer) -> Self {
        self.summarizer = summarizer;
        self
    }

    /// Register an extra tool in every scenario's conversation.
    pub fn with_tool(mut self, tool: Arc<dyn ToolHandler>) -> Self {
        self.extra_tools.push(tool);
        self
    }

    /// Run-wide signal; every attempt listens to a child of it.
    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn settings(&self) -> &HarnessSettings {
        &self.settings
    }

    pub async fn run(&self, descriptor: &ScenarioDescriptor) -> ScenarioResult {
        let started = Instant::now();
        let id = descriptor.id.as_str();
        info!(scenario = id, "scenario started");

        let env = match IsolatedEnvironment::create(&self.settings.workspace_root, id).await {
            Ok(env) => env,
            Err(e) => return setup_failure(descriptor, started, e.to_string()),
        };
        if let Err(e) = env
            .copy_metadata(&self.settings.project_root, &self.settings.metadata_files)
            .await
        {
            env.destroy().await;
            return setup_failure(descriptor, started, e.to_string());
        }
        let prepared = match self.assets.prepare(descriptor, env.path()).await {
            Ok(prepared) => prepared,
            Err(e) => {
                env.destroy().await;
                return setup_failure(descriptor, started, e.to_string());
            }
        };

        if !prepared.materialized.is_empty() {
            debug!(
                scenario = id,
                assets = prepared.materialized.len(),
                "task assets ready"
            );
        }
        let prompt = task_prompt(descriptor, &prepared.description, env.path());
        let (registry, mut remote) = self.build_tools(env.path().to_path_buf(), prepared.env).await;

        let policy = &self.settings.retry;
        let mut attempt = 0;
        let record = loop {
            attempt += 1;
            let record = self.attempt(id, attempt, &prompt, registry.clone()).await;
            let retry = match &record.outcome {
                Err(err) if err.is_retryable() && policy.has_attempts_left(attempt) => {
                    let hint = match err {
                        AttemptError::Transient { retry_after, .. } => *retry_after,
                        _ => None,
                    };
                    Some((err.to_string(), hint))
                }
                _ => None,
            };
            let Some((reason, retry_after)) = retry else {
                break record;
            };

            let delay = policy.delay_with_hint(attempt, retry_after);
            warn!(scenario = id, attempt, error = %reason, delay_ms = delay.as_millis() as u64, "attempt failed, retrying");
            tokio::select! {
                _ = self.cancel.cancelled() => break record,
                _ = tokio::time::sleep(delay) => {}
            }
        };

        if let Some(client) = remote.as_mut() {
            client.shutdown().await;
        }
        env.destroy().await;

        let approach_summary = self
            .summarizer
            .summarize(id, &record.executions, &record.final_text)
            .await;
        let result = classify(descriptor, record, attempt, started.elapsed(), approach_summary);
        info!(
            scenario = id,
            result = %result.result,
            attempts = result.attempts,
            secs = result.execution_time,
            "scenario finished"
        );
        result
    }

    async fn build_tools(
        &self,
        workdir: PathBuf,
        env: EnvOverrides,
    ) -> (ToolRegistry, Option<RemoteToolClient>) {
        let mut registry = ToolRegistry::new();
        let mut remote = None;

        if let Some(config) = &self.settings.remote_tools {
            let mut client = RemoteToolClient::new(RemoteServerConfig::from_config(config, &workdir));
            let discovered = match client.connect().await {
                Ok(()) => client.discover().await,
                Err(e) => Err(e),
            };
            match discovered {
                Ok(tools) => {
                    registry.extend(tools);
                    remote = Some(client);
                }
                Err(e) => {
                    warn!(server = %config.name, error = %e, "remote tools unavailable for this scenario");
                    client.shutdown().await;
                }
            }
        }

        registry.register(Arc::new(
            CommandTool::new(workdir, self.settings.policy.clone())
                .with_env(env)
                .with_timeout(self.settings.command_timeout),
        ));
        registry.extend(self.extra_tools.iter().cloned());
        debug!(tools = registry.len(), "scenario tools ready");
        (registry, remote)
    }

    async fn attempt(
        &self,
        id: &str,
        attempt: u32,
        prompt: &str,
        tools: ToolRegistry,
    ) -> AttemptRecord {
        debug!(scenario = id, attempt, "attempt started");
        let guard = CancelGuard::new(self.cancel.child());
        let log = ExecutionLog::new();
        let conversation = Conversation::new(
            Arc::clone(&self.provider),
            tools,
            self.settings.engine.clone(),
        )
        .with_execution_log(log.clone());
        let timeout = self.settings.scenario_timeout;

        let finished = tokio::select! {
            out = conversation.run(prompt, guard.signal()) => out,
            _ = tokio::time::sleep(timeout) => {
                warn!(
                    scenario = id,
                    attempt,
                    timeout_secs = timeout.as_secs(),
                    tools = log.len(),
                    "attempt timed out"
                );
                guard.signal().cancel();
                return AttemptRecord {
                    outcome: Err(AttemptError::Timeout(timeout)),
                    executions: log.snapshot(),
                    final_text: String::new(),
                };
            }
        };

        match finished {
            Ok(transcript) => judge(transcript),
            Err(e) => {
                let err = AttemptError::from_engine(e);
                if matches!(err, AttemptError::Fatal(_)) {
                    error!(scenario = id, attempt, error = %err, "attempt failed");
                }
                AttemptRecord {
                    outcome: Err(err),
                    executions: log.snapshot(),
                    final_text: String::new(),
                }
            }
        }
    }
}

/// Read the verdict out of a finished conversation.
fn judge(transcript: Transcript) -> AttemptRecord {
    let final_text = transcript.final_text().unwrap_or_default();
    let outcome = match parse_final_answer(&final_text) {
        Ok(answer) => Ok(answer),
        Err(e) => {
            let mut message = match transcript.termination {
                Termination::BudgetExhausted { requests } => {
                    format!("API call budget exhausted after {requests} requests without a final answer")
                }
                Termination::Completed(_) => e.to_string(),
            };
            if let Some(tool_error) = transcript
                .tool_executions
                .iter()
                .rev()
                .find_map(|x| x.error.as_deref())
            {
                message.push_str(&format!(" (last tool error: {tool_error})"));
            }
            Err(AttemptError::Protocol(message))
        }
    };
    AttemptRecord {
        outcome,
        executions: transcript.tool_executions,
        final_text,
    }
}

fn classify(
    descriptor: &ScenarioDescriptor,
    record: AttemptRecord,
    attempts: u32,
    elapsed: Duration,
    approach_summary: String,
) -> ScenarioResult {
    let (result, explanation, error, final_answer) = match record.outcome {
        Ok(answer) => {
            let outcome = answer.outcome();
            let error = match outcome {
                Outcome::Pass => None,
                Outcome::Fail => Some(
                    answer
                        .error
                        .clone()
                        .unwrap_or_else(|| format!("model reported status {}", answer.status)),
                ),
            };
            (outcome, answer.summary.clone(), error, Some(answer))
        }
        Err(AttemptError::Timeout(limit)) => (
            Outcome::Fail,
            format!(
                "Scenario timed out after {}s on attempt {attempts}; no further attempts were made.",
                limit.as_secs()
            ),
            Some(AttemptError::Timeout(limit).to_string()),
            None,
        ),
        Err(err) => (
            Outcome::Fail,
            format!("Failed after {attempts} attempt(s): {err}"),
            Some(err.to_string()),
            None,
        ),
    };

    ScenarioResult {
        id: descriptor.id.clone(),
        result,
        attempts,
        execution_time: elapsed.as_secs_f64(),
        approach_summary,
        tool_executions: record.executions,
        explanation,
        error,
        final_answer,
    }
}

fn setup_failure(descriptor: &ScenarioDescriptor, started: Instant, reason: String) -> ScenarioResult {
    error!(scenario = %descriptor.id, error = %reason, "scenario setup failed");
    ScenarioResult {
        id: descriptor.id.clone(),
        result: Outcome::Fail,
        attempts: 1,
        execution_time: started.elapsed().as_secs_f64(),
        approach_summary: "Scenario did not start.".into(),
        tool_executions: Vec::new(),
        explanation: format!("Environment setup failed: {reason}"),
        error: Some(reason),
        final_answer: None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_are_classified() {
        let rate = AttemptError::from_engine(EngineError::Provider(ProviderError::RateLimited {
            retry_after_secs: Some(7),
        }));
        assert_eq!(
            rate,
            AttemptError::Transient {
                message: "rate limited: retry after Some(7)s".into(),
                retry_after: Some(Duration::from_secs(7)),
            }
        );

        let proto = AttemptError::from_engine(EngineError::Provider(ProviderError::MalformedToolArgs {
            tool: "t".into(),
            message: "eof".into(),
        }));
        assert!(matches!(proto, AttemptError::Protocol(_)));
        assert!(proto.is_retryable());

        let fatal = AttemptError::from_engine(EngineError::Provider(ProviderError::Api {
            status: 400,
            message: "bad request".into(),
        }));
        assert!(!fatal.is_retryable());

        let conn = AttemptError::from_engine(EngineError::Provider(ProviderError::Http(
            "connection refused".into(),
        )));
        assert!(matches!(conn, AttemptError::Transient { retry_after: None, .. }));

        assert!(!AttemptError::from_engine(EngineError::Cancelled).is_retryable());
        assert!(!AttemptError::Timeout(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn timeout_message_mentions_seconds() {
        assert_eq!(
            AttemptError::Timeout(Duration::from_secs(5)).to_string(),
            "scenario timed out after 5s"
        );
    }
}
