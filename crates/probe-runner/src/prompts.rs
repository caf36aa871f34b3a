//! Prompt text for scenario conversations and approach summaries.
//!
//! Templates use `{placeholder}` variables expanded by [`render`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use probe_core::types::{ScenarioDescriptor, ToolExecution};
use regex::{Captures, Regex};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{(\w+)\}").expect("static regex"));

pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are a meticulous QA engineer exercising a software product through its \
command line. You work inside a disposable directory created for this one \
scenario and may only use the tools you are given.

Work step by step: inspect the environment, run the commands the task needs, \
read their output carefully and compare what happened with the expected \
behavior. Do not guess results you have not observed. Tool errors are normal \
feedback; adapt and continue.

When you are done, reply with a final message containing a single JSON object \
in a ```json fenced block with exactly these fields:
  \"id\": the scenario id,
  \"status\": \"PASS\" or \"FAIL\",
  \"summary\": one or two sentences on what you observed,
  \"executionTime\": how long the task took, as you estimate it,
  \"error\": the failure reason, or null when the scenario passed.";

const TASK_TEMPLATE: &str = "\
Scenario: {id}
Working directory: {workdir}

Task:
{task}

Expected behavior:
{expected}

Success criteria:
{criteria}

Finish with the JSON verdict for scenario {id}.";

const SUMMARY_TEMPLATE: &str = "\
Summarize in at most five sentences how the agent approached scenario {id}: \
which commands and tools it used, in what order, and what the outcome was. \
Write plain prose for a test report.

Tool executions:
{tools}

Final message:
{final}";

/// Excerpts handed to the summarizer are cut to this many characters.
pub const SUMMARY_EXCERPT_CHARS: usize = 6_000;

/// Replace `{name}` placeholders with values from `vars` in one pass.
///
/// Substituted values are never rescanned, and unknown placeholders are
/// left as written.
pub fn render(template: &str, vars: &HashMap<&str, String>) -> String {
    PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| match vars.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

pub fn task_prompt(descriptor: &ScenarioDescriptor, task: &str, workdir: &Path) -> String {
    let vars = HashMap::from([
        ("id", descriptor.id.clone()),
        ("workdir", workdir.display().to_string()),
        ("task", task.to_string()),
        ("expected", bullets(&descriptor.expected_behavior)),
        ("criteria", bullets(&descriptor.success_criteria)),
    ]);
    render(TASK_TEMPLATE, &vars)
}

pub fn summary_prompt(scenario_id: &str, executions: &[ToolExecution], final_text: &str) -> String {
    let tools = if executions.is_empty() {
        "(none)".to_string()
    } else {
        executions
            .iter()
            .enumerate()
            .map(|(i, e)| {
                let status = if e.success { "ok" } else { "failed" };
                let cached = if e.cached { ", cached" } else { "" };
                format!("{}. {} {} -> {status}{cached}", i + 1, e.name, e.args)
            })
            .collect::<Vec<_>>()
            .join("\n")
    };
    let vars = HashMap::from([
        ("id", scenario_id.to_string()),
        ("tools", truncate_chars(&tools, SUMMARY_EXCERPT_CHARS)),
        ("final", truncate_chars(final_text, SUMMARY_EXCERPT_CHARS / 3)),
    ]);
    render(SUMMARY_TEMPLATE, &vars)
}

fn bullets(items: &[String]) -> String {
    if items.is_empty() {
        return "- (not specified)".into();
    }
    items
        .iter()
        .map(|i| format!("- {i}"))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}\n[... truncated]", &text[..cut]),
        None => text.to_string(),
    }
}
