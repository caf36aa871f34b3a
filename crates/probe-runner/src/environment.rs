use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Setup failures. These are not retried: a scenario that cannot get a
/// working directory fails immediately.
#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    #[error("failed to create environment directory {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to copy {file} into environment: {source}")]
    Copy {
        file: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// IsolatedEnvironment
// ---------------------------------------------------------------------------

/// Disposable working directory owned by one scenario's attempt sequence.
///
/// Removed by [`IsolatedEnvironment::destroy`], or on drop if the owner
/// never got that far (panic, cancellation, timeout).
#[derive(Debug)]
pub struct IsolatedEnvironment {
    scenario_id: String,
    path: PathBuf,
    removed: bool,
}

impl IsolatedEnvironment {
    /// Create `<root>/<sanitized-id>-<timestamp>-<uuid8>`.
    pub async fn create(root: &Path, scenario_id: &str) -> Result<Self, EnvironmentError> {
        let path = root.join(dir_name(scenario_id));
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|source| EnvironmentError::Create {
                path: path.clone(),
                source,
            })?;
        let path = std::path::absolute(&path).unwrap_or(path);
        debug!(scenario = scenario_id, path = %path.display(), "created isolated environment");
        Ok(Self {
            scenario_id: scenario_id.to_string(),
            path,
            removed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn scenario_id(&self) -> &str {
        &self.scenario_id
    }

    /// Copy the named project files that exist. Returns how many were copied.
    pub async fn copy_metadata(
        &self,
        project_root: &Path,
        files: &[String],
    ) -> Result<usize, EnvironmentError> {
        let mut copied = 0;
        for name in files {
            let src = project_root.join(name);
            if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
                debug!(file = %src.display(), "metadata file not present, skipping");
                continue;
            }
            let dst = self.path.join(name);
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| EnvironmentError::Copy {
                        file: src.clone(),
                        source,
                    })?;
            }
            tokio::fs::copy(&src, &dst)
                .await
                .map_err(|source| EnvironmentError::Copy { file: src, source })?;
            copied += 1;
        }
        Ok(copied)
    }

    /// Remove the directory. Failures are logged and swallowed.
    pub async fn destroy(mut self) {
        self.removed = true;
        match tokio::fs::remove_dir_all(&self.path).await {
            Ok(()) => info!(scenario = %self.scenario_id, "environment cleaned up"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                scenario = %self.scenario_id,
                path = %self.path.display(),
                error = %e,
                "failed to remove environment"
            ),
        }
    }
}

impl Drop for IsolatedEnvironment {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove environment on drop");
            }
        }
    }
}

fn dir_name(scenario_id: &str) -> String {
    let stamp = Utc::now().format("%Y%m%d%H%M%S");
    let unique = Uuid::new_v4().simple().to_string();
    format!("{}-{stamp}-{}", sanitize(scenario_id), &unique[..8])
}

/// Lowercase alphanumerics; every other run of characters becomes one `-`.
fn sanitize(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "scenario".into()
    } else {
        trimmed.chars().take(64).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
