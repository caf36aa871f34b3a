//! Logging setup for the probe binaries.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`,
//!   filtered by `RUST_LOG` with a configurable fallback level
//! - **Run correlation**: a per-run id and the root span every scenario log
//!   line is nested under

pub mod logging;
pub mod run_span;
