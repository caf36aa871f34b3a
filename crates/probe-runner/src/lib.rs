//! Scenario runner: isolated environments, prompts, the retrying scenario
//! harness and the nested file/scenario scheduler.

pub mod answer;
pub mod assets;
pub mod environment;
pub mod harness;
pub mod prompts;
pub mod retry;
pub mod scheduler;
pub mod summarizer;
