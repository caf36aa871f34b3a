//! Task-description directives.
//!
//! - `{{path:name}}` copies asset `name` into the environment and is replaced
//!   by the copy's absolute path.
//! - `[[asset:name]]` is replaced by the asset's text.
//! - `[[env:set:KEY=value]]` / `[[env:unset:KEY]]` are removed from the text
//!   and collected into the command tool's environment overrides, in order.
//!
//! Assets are looked up in `<assets>/<category>/<file>/`, then
//! `<assets>/<category>/`, then `<assets>/`, where category and file come
//! from the scenario id.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use probe_core::types::ScenarioDescriptor;
use probe_harness::command_tool::EnvOverrides;
use regex::{Captures, Regex};
use tracing::debug;

static PATH_DIRECTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{path:([^}]+)\}\}").expect("static regex"));

static ASSET_DIRECTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[asset:([^\]]+)\]\]").expect("static regex"));

static ENV_DIRECTIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\[env:(set|unset):([^\]]*)\]\]").expect("static regex"));

static ENV_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));

#[derive(Debug, thiserror::Error)]
pub enum AssetError {
    #[error("asset `{name}` not found (searched {})", display_paths(.searched))]
    NotFound { name: String, searched: Vec<PathBuf> },
    #[error("invalid asset name `{0}`")]
    InvalidName(String),
    #[error("invalid env directive `{0}`")]
    InvalidEnvDirective(String),
    #[error("asset io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Task text after directive processing.
#[derive(Debug, Clone, Default)]
pub struct PreparedTask {
    pub description: String,
    pub env: EnvOverrides,
    /// Absolute paths of assets copied into the environment.
    pub materialized: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AssetResolver {
    assets_dir: PathBuf,
}

impl AssetResolver {
    pub fn new(assets_dir: impl Into<PathBuf>) -> Self {
        Self {
            assets_dir: assets_dir.into(),
        }
    }

    /// Candidate directories for `descriptor`, most specific first.
    pub fn search_dirs(&self, descriptor: &ScenarioDescriptor) -> Vec<PathBuf> {
        let category = self.assets_dir.join(descriptor.category());
        let mut dirs = Vec::with_capacity(3);
        if let Some(file) = descriptor.file_key() {
            dirs.push(category.join(file));
        }
        dirs.push(category);
        dirs.push(self.assets_dir.clone());
        dirs
    }

    pub async fn locate(
        &self,
        descriptor: &ScenarioDescriptor,
        name: &str,
    ) -> Result<PathBuf, AssetError> {
        let relative = checked_name(name)?;
        let searched: Vec<PathBuf> = self
            .search_dirs(descriptor)
            .into_iter()
            .map(|dir| dir.join(relative))
            .collect();
        for candidate in &searched {
            if tokio::fs::metadata(candidate)
                .await
                .is_ok_and(|m| m.is_file())
            {
                return Ok(candidate.clone());
            }
        }
        Err(AssetError::NotFound {
            name: name.to_string(),
            searched,
        })
    }

    /// Rewrite the task description for an environment rooted at `env_dir`.
    pub async fn prepare(
        &self,
        descriptor: &ScenarioDescriptor,
        env_dir: &Path,
    ) -> Result<PreparedTask, AssetError> {
        let mut env = EnvOverrides::new();
        for caps in ENV_DIRECTIVE.captures_iter(&descriptor.task_description) {
            apply_env_directive(&mut env, &caps[1], &caps[2])?;
        }
        let text = ENV_DIRECTIVE.replace_all(&descriptor.task_description, "");

        let mut inline = HashMap::new();
        for name in unique_names(&ASSET_DIRECTIVE, &text) {
            let src = self.locate(descriptor, &name).await?;
            let content = tokio::fs::read_to_string(&src)
                .await
                .map_err(|source| AssetError::Io { path: src, source })?;
            inline.insert(name, content);
        }
        let text = ASSET_DIRECTIVE.replace_all(&text, |caps: &Captures| {
            inline.get(caps[1].trim()).cloned().unwrap_or_default()
        });

        let mut paths = HashMap::new();
        let mut materialized = Vec::new();
        for name in unique_names(&PATH_DIRECTIVE, &text) {
            let src = self.locate(descriptor, &name).await?;
            let dst = env_dir.join(checked_name(&name)?);
            if let Some(parent) = dst.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| AssetError::Io {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
            tokio::fs::copy(&src, &dst)
                .await
                .map_err(|source| AssetError::Io {
                    path: src.clone(),
                    source,
                })?;
            let dst = std::path::absolute(&dst).unwrap_or(dst);
            debug!(asset = %name, path = %dst.display(), "materialized asset");
            paths.insert(name, dst.display().to_string());
            materialized.push(dst);
        }
        let text = PATH_DIRECTIVE.replace_all(&text, |caps: &Captures| {
            paths.get(caps[1].trim()).cloned().unwrap_or_default()
        });

        Ok(PreparedTask {
            description: text.trim().to_string(),
            env,
            materialized,
        })
    }
}

fn unique_names(re: &Regex, text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for caps in re.captures_iter(text) {
        let name = caps[1].trim().to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

/// Asset names are relative paths that stay inside their directory.
fn checked_name(name: &str) -> Result<&Path, AssetError> {
    let path = Path::new(name);
    let valid = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if valid {
        Ok(path)
    } else {
        Err(AssetError::InvalidName(name.to_string()))
    }
}

fn apply_env_directive(env: &mut EnvOverrides, action: &str, body: &str) -> Result<(), AssetError> {
    let directive = || format!("env:{action}:{body}");
    match action {
        "set" => {
            let (key, value) = body
                .split_once('=')
                .ok_or_else(|| AssetError::InvalidEnvDirective(directive()))?;
            let key = key.trim();
            if !ENV_KEY.is_match(key) {
                return Err(AssetError::InvalidEnvDirective(directive()));
            }
            env.set(key, value);
        }
        _ => {
            let key = body.trim();
            if !ENV_KEY.is_match(key) {
                return Err(AssetError::InvalidEnvDirective(directive()));
            }
            env.unset(key);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
