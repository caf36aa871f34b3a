//! Core: shared data model and configuration for the probe scenario runner.
//!
//! - Scenario descriptors, results and the report shape handed to writers
//! - TOML configuration with per-section defaults
//! - Environment-variable credential resolution

pub mod config;
pub mod types;
