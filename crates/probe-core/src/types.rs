use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ScenarioDescriptor
// ---------------------------------------------------------------------------

/// One independently executable test case, as produced by the scenario
/// parser. The harness only ever reads it.
///
/// Ids follow `category/file/scenarioN`; the first two segments select the
/// asset directory the scenario's directives resolve against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioDescriptor {
    pub id: String,
    pub task_description: String,
    #[serde(default)]
    pub expected_behavior: Vec<String>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form scenario kind (`happy-path`, `edge-case`, ...).
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub scenario_type: Option<String>,
    /// Short human title; falls back to the first line of the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ScenarioDescriptor {
    pub fn new(id: impl Into<String>, task_description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_description: task_description.into(),
            expected_behavior: Vec::new(),
            success_criteria: Vec::new(),
            tags: Vec::new(),
            scenario_type: None,
            description: None,
        }
    }

    /// First id segment, e.g. `suite` for `suite/login/1`.
    pub fn category(&self) -> &str {
        self.id.split('/').next().unwrap_or(&self.id)
    }

    /// Second id segment, e.g. `login` for `suite/login/1`.
    pub fn file_key(&self) -> Option<&str> {
        let mut parts = self.id.split('/');
        parts.next();
        let file = parts.next()?;
        // A two-segment id has no file component, only a scenario number.
        parts.next().map(|_| file)
    }

    pub fn kind(&self) -> &str {
        self.scenario_type
            .as_deref()
            .or_else(|| self.tags.first().map(String::as_str))
            .unwrap_or("scenario")
    }

    pub fn title(&self) -> String {
        match &self.description {
            Some(d) => d.clone(),
            None => self
                .task_description
                .lines()
                .find(|l| !l.trim().is_empty())
                .unwrap_or_default()
                .trim()
                .to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Pass,
    Fail,
}

impl Outcome {
    /// Interpret the `status` field of a model's final answer.
    pub fn from_status(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "pass" | "passed" | "success" | "succeeded" | "ok" => Outcome::Pass,
            _ => Outcome::Fail,
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Outcome::Pass)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Pass => write!(f, "PASS"),
            Outcome::Fail => write!(f, "FAIL"),
        }
    }
}

// ---------------------------------------------------------------------------
// ToolExecution
// ---------------------------------------------------------------------------

/// Log entry for one tool dispatch inside a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolExecution {
    pub tool_use_id: String,
    pub name: String,
    pub args: serde_json::Value,
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Served from the per-conversation cache without re-executing.
    #[serde(default)]
    pub cached: bool,
}

// ---------------------------------------------------------------------------
// FinalAnswer
// ---------------------------------------------------------------------------

/// Structured verdict the model is asked to emit as its last message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalAnswer {
    pub id: String,
    pub status: String,
    pub summary: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub execution_time: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub error: Option<String>,
}

impl FinalAnswer {
    pub fn outcome(&self) -> Outcome {
        Outcome::from_status(&self.status)
    }
}

/// Models report times as `12`, `"12s"` or `null`; keep whatever they say.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

// ---------------------------------------------------------------------------
// ScenarioResult
// ---------------------------------------------------------------------------

/// Final classification of one scenario's attempt sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioResult {
    pub id: String,
    pub result: Outcome,
    pub attempts: u32,
    /// Wall-clock seconds across all attempts, backoff included.
    pub execution_time: f64,
    pub approach_summary: String,
    pub tool_executions: Vec<ToolExecution>,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_answer: Option<FinalAnswer>,
}

impl ScenarioResult {
    pub fn execution_duration(&self) -> Duration {
        Duration::from_secs_f64(self.execution_time.max(0.0))
    }
}

// ---------------------------------------------------------------------------
// ScenarioReport
// ---------------------------------------------------------------------------

/// Row handed to the external Markdown/JSON report writers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReport {
    pub id: String,
    #[serde(rename = "type")]
    pub scenario_type: String,
    pub description: String,
    pub task_description: String,
    pub approach_taken: String,
    pub tool_executions: Vec<ToolExecution>,
    pub result: Outcome,
    pub execution_time: f64,
    pub attempts: u32,
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScenarioReport {
    pub fn new(descriptor: &ScenarioDescriptor, result: ScenarioResult) -> Self {
        Self {
            id: result.id,
            scenario_type: descriptor.kind().to_string(),
            description: descriptor.title(),
            task_description: descriptor.task_description.clone(),
            approach_taken: result.approach_summary,
            tool_executions: result.tool_executions,
            result: result.result,
            execution_time: result.execution_time,
            attempts: result.attempts,
            explanation: result.explanation,
            error: result.error,
        }
    }
}

/// Pass/fail tally over a whole run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub total_attempts: u32,
}

impl RunSummary {
    pub fn from_reports(reports: &[ScenarioReport]) -> Self {
        let passed = reports.iter().filter(|r| r.result.is_pass()).count();
        Self {
            total: reports.len(),
            passed,
            failed: reports.len() - passed,
            total_attempts: reports.iter().map(|r| r.attempts).sum(),
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Everything one `probe run` writes to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub generated_at: DateTime<Utc>,
    pub summary: RunSummary,
    pub scenarios: Vec<ScenarioReport>,
}

impl RunReport {
    pub fn new(scenarios: Vec<ScenarioReport>) -> Self {
        Self {
            generated_at: Utc::now(),
            summary: RunSummary::from_reports(&scenarios),
            scenarios,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
