use std::sync::Arc;
use std::time::Duration;

use probe_core::types::ToolExecution;
use probe_harness::message::Message;
use probe_harness::provider::{complete_text, ModelProvider, ModelRequest};
use tracing::{debug, warn};

use crate::prompts::summary_prompt;

const SUMMARY_SYSTEM_PROMPT: &str =
    "You write concise, factual summaries of automated test runs for QA reports.";

/// Turns a transcript into the "approach taken" narrative of a report.
#[derive(Clone)]
pub struct ApproachSummarizer {
    provider: Arc<dyn ModelProvider>,
    max_tokens: u32,
    timeout: Duration,
}

impl ApproachSummarizer {
    pub fn new(provider: Arc<dyn ModelProvider>, max_tokens: u32) -> Self {
        Self {
            provider,
            max_tokens,
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Never fails: a broken summary call becomes an inline error string.
    pub async fn summarize(
        &self,
        scenario_id: &str,
        executions: &[ToolExecution],
        final_text: &str,
    ) -> String {
        let request = ModelRequest {
            system: SUMMARY_SYSTEM_PROMPT.into(),
            messages: vec![Message::user(summary_prompt(scenario_id, executions, final_text))],
            tools: Vec::new(),
            max_tokens: self.max_tokens,
        };

        let outcome = tokio::time::timeout(self.timeout, complete_text(&*self.provider, request)).await;
        match outcome {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                debug!(scenario = scenario_id, "approach summarized");
                text.trim().to_string()
            }
            Ok(Ok(_)) => "Failed to summarize approach: empty response".into(),
            Ok(Err(e)) => {
                warn!(scenario = scenario_id, error = %e, "approach summary failed");
                format!("Failed to summarize approach: {e}")
            }
            Err(_) => {
                warn!(scenario = scenario_id, "approach summary timed out");
                format!(
                    "Failed to summarize approach: timed out after {}s",
                    self.timeout.as_secs()
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_harness::provider::{ProviderError, ScriptedProvider};

    #[tokio::test]
    async fn returns_model_text() {
        let provider = Arc::new(ScriptedProvider::new().with_text("  Ran ls, then the CLI.  "));
        let s = ApproachSummarizer::new(provider.clone(), 256);
        let text = s.summarize("a/b/1", &[], "done").await;
        assert_eq!(text, "Ran ls, then the CLI.");

        let req = &provider.requests()[0];
        assert!(req.tools.is_empty());
        assert_eq!(req.max_tokens, 256);
    }

    #[tokio::test]
    async fn failure_degrades_to_inline_error() {
        let provider = Arc::new(ScriptedProvider::new().with_error(ProviderError::Timeout));
        let s = ApproachSummarizer::new(provider, 256);
        let text = s.summarize("a/b/1", &[], "").await;
        assert!(text.starts_with("Failed to summarize approach:"));
    }

    #[tokio::test]
    async fn slow_summary_is_bounded() {
        let provider = Arc::new(
            ScriptedProvider::new()
                .with_text("late")
                .with_delay(Duration::from_secs(30)),
        );
        let s = ApproachSummarizer::new(provider, 256).with_timeout(Duration::from_millis(50));
        let text = s.summarize("a/b/1", &[], "").await;
        assert!(text.contains("timed out"));
    }
}
