pub mod list;
pub mod run;

use std::path::{Path, PathBuf};

use anyhow::Context;
use probe_core::types::ScenarioDescriptor;
use probe_runner::scheduler::ScenarioFile;

/// Read one scenario file: a JSON array of descriptors.
///
/// The file stem names the outer-pool item in logs and progress.
pub fn load_scenario_file(path: &Path) -> anyhow::Result<ScenarioFile> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading scenario file {}", path.display()))?;
    let scenarios: Vec<ScenarioDescriptor> = serde_json::from_str(&text)
        .with_context(|| format!("parsing scenario file {}", path.display()))?;
    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(ScenarioFile { name, scenarios })
}

pub fn load_scenario_files(paths: &[PathBuf]) -> anyhow::Result<Vec<ScenarioFile>> {
    let files = paths
        .iter()
        .map(|p| load_scenario_file(p))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let empty: Vec<_> = files
        .iter()
        .filter(|f| f.scenarios.is_empty())
        .map(|f| f.name.as_str())
        .collect();
    if !empty.is_empty() {
        tracing::warn!(files = ?empty, "scenario files without scenarios");
    }
    Ok(files)
}

/// Write `value` as pretty JSON, creating parent directories.
pub fn write_json_artifact<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
