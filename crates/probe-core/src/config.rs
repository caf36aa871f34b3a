use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from `~/.probe/config.toml`.
///
/// API keys are never stored here. The provider section names the
/// environment variable to read; see [`CredentialProvider`].
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub remote_tools: RemoteToolsConfig,
}

impl Config {
    /// Load config from `~/.probe/config.toml`, falling back to defaults
    /// when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        tracing::debug!(path = %path.display(), "loaded config");
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.conversation.validate()?;
        self.retry.validate()?;
        self.scheduler.validate()?;
        self.runner.validate()?;
        self.remote_tools.validate()?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".probe")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("missing credential: environment variable {0} is not set")]
    MissingCredential(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
        }
    }
}

fn default_project_name() -> String {
    "probe".into()
}
fn default_log_level() -> String {
    "info".into()
}

/// Which streaming wire protocol the model endpoint speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Anthropic Messages API (`message_start` / `content_block_*` events).
    #[default]
    Anthropic,
    /// OpenAI Chat Completions API (`choices[].delta` chunks).
    Openai,
}

impl ProviderKind {
    pub fn default_model(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "claude-sonnet-4-5",
            ProviderKind::Openai => "gpt-4o",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "https://api.anthropic.com",
            ProviderKind::Openai => "https://api.openai.com",
        }
    }

    pub fn default_api_key_env(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
            ProviderKind::Openai => "OPENAI_API_KEY",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::Openai => write!(f, "openai"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "openai" | "gpt" => Ok(ProviderKind::Openai),
            other => Err(ConfigError::Validation(format!(
                "unknown provider `{other}` (expected anthropic or openai)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub kind: ProviderKind,
    /// Model id; the kind's default when unset.
    #[serde(default)]
    pub model: Option<String>,
    /// Endpoint override, e.g. a local OpenAI-compatible server.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Env var holding the API key; the kind's default when unset.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Longest silence while reading a response. A stream that keeps
    /// producing chunks may run past it.
    #[serde(default = "default_read_timeout_secs", alias = "request_timeout_secs")]
    pub read_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            model: None,
            base_url: None,
            api_key_env: None,
            max_tokens: default_max_tokens(),
            temperature: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl ProviderConfig {
    pub fn model(&self) -> &str {
        self.model
            .as_deref()
            .unwrap_or_else(|| self.kind.default_model())
    }

    pub fn base_url(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.kind.default_base_url())
    }

    pub fn api_key_env(&self) -> &str {
        self.api_key_env
            .as_deref()
            .unwrap_or_else(|| self.kind.default_api_key_env())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

fn default_max_tokens() -> u32 {
    4096
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_read_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Maximum model requests per conversation.
    #[serde(default = "default_api_call_budget")]
    pub api_call_budget: u32,
    /// Number of trailing messages marked cache-eligible before each request.
    #[serde(default = "default_cache_window")]
    pub cache_window: usize,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            api_call_budget: default_api_call_budget(),
            cache_window: default_cache_window(),
            system_prompt: None,
            summary_max_tokens: default_summary_max_tokens(),
        }
    }
}

impl ConversationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_call_budget == 0 {
            return Err(ConfigError::Validation(
                "conversation.api_call_budget must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_api_call_budget() -> u32 {
    30
}
fn default_cache_window() -> usize {
    3
}
fn default_summary_max_tokens() -> u32 {
    512
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Parent of the per-scenario isolated directories.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// Project whose metadata files are copied into each environment.
    #[serde(default = "default_project_root")]
    pub project_root: PathBuf,
    #[serde(default = "default_metadata_files")]
    pub metadata_files: Vec<String>,
    /// Root of `<category>/<file>/` asset directories.
    #[serde(default = "default_assets_dir")]
    pub assets_dir: PathBuf,
    /// The product's own CLI binary, always allowed in the command tool.
    #[serde(default)]
    pub product_cli: Option<String>,
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_scenario_timeout_secs")]
    pub scenario_timeout_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            workspace_root: None,
            project_root: default_project_root(),
            metadata_files: default_metadata_files(),
            assets_dir: default_assets_dir(),
            product_cli: None,
            allowed_commands: default_allowed_commands(),
            command_timeout_secs: default_command_timeout_secs(),
            scenario_timeout_secs: default_scenario_timeout_secs(),
        }
    }
}

impl RunnerConfig {
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("probe-runs"))
    }

    pub fn scenario_timeout(&self) -> Duration {
        Duration::from_secs(self.scenario_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scenario_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "runner.scenario_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "runner.command_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_metadata_files() -> Vec<String> {
    vec![
        "package.json".into(),
        "Cargo.toml".into(),
        "README.md".into(),
    ]
}
fn default_assets_dir() -> PathBuf {
    PathBuf::from("scenarios/assets")
}
fn default_allowed_commands() -> Vec<String> {
    [
        "ls", "cat", "head", "tail", "grep", "find", "echo", "pwd", "wc", "sort", "uniq", "diff",
        "mkdir", "touch", "cp", "sed", "awk", "jq", "cd", "test", "true", "false", "env",
        "which", "git", "node", "npm", "npx", "python3", "cargo",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_command_timeout_secs() -> u64 {
    120
}
fn default_scenario_timeout_secs() -> u64 {
    600
}

/// Exponential backoff between attempts of one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    /// Total attempts per scenario, the first one included.
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
            retries: default_retries(),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retries == 0 {
            return Err(ConfigError::Validation(
                "retry.retries must be at least 1".into(),
            ));
        }
        if self.factor.is_nan() || self.factor < 1.0 {
            return Err(ConfigError::Validation(format!(
                "retry.factor must be >= 1.0, got {}",
                self.factor
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Validation(format!(
                "retry.initial_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

fn default_initial_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_factor() -> f64 {
    2.0
}
fn default_retries() -> u32 {
    3
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scenario files processed at once.
    #[serde(default = "default_file_concurrency")]
    pub file_concurrency: usize,
    /// Scenarios per file run at once; available parallelism - 1 when unset.
    #[serde(default)]
    pub scenario_concurrency: Option<usize>,
    #[serde(default = "default_progress_interval_secs")]
    pub progress_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            file_concurrency: default_file_concurrency(),
            scenario_concurrency: None,
            progress_interval_secs: default_progress_interval_secs(),
        }
    }
}

impl SchedulerConfig {
    pub fn scenario_concurrency(&self) -> usize {
        self.scenario_concurrency
            .unwrap_or_else(default_scenario_concurrency)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.file_concurrency == 0 {
            return Err(ConfigError::Validation(
                "scheduler.file_concurrency must be at least 1".into(),
            ));
        }
        if self.scenario_concurrency == Some(0) {
            return Err(ConfigError::Validation(
                "scheduler.scenario_concurrency must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Available parallelism minus one, never below one.
pub fn default_scenario_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
        .max(1)
}

fn default_file_concurrency() -> usize {
    3
}
fn default_progress_interval_secs() -> u64 {
    5
}

/// Optional stdio tool server launched per scenario attempt.
///
/// `{workdir}` in `args` is replaced by the scenario's isolated directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteToolsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_remote_name")]
    pub name: String,
    #[serde(default = "default_remote_command")]
    pub command: String,
    #[serde(default = "default_remote_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_remote_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for RemoteToolsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name: default_remote_name(),
            command: default_remote_command(),
            args: default_remote_args(),
            env: HashMap::new(),
            request_timeout_secs: default_remote_timeout_secs(),
        }
    }
}

impl RemoteToolsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.enabled && self.command.trim().is_empty() {
            return Err(ConfigError::Validation(
                "remote_tools.command is required when remote_tools.enabled = true".into(),
            ));
        }
        Ok(())
    }
}

fn default_remote_name() -> String {
    "filesystem".into()
}
fn default_remote_command() -> String {
    "npx".into()
}
fn default_remote_args() -> Vec<String> {
    vec![
        "-y".into(),
        "@modelcontextprotocol/server-filesystem".into(),
        "{workdir}".into(),
    ]
}
fn default_remote_timeout_secs() -> u64 {
    30
}

// ---------------------------------------------------------------------------
// CredentialProvider
// ---------------------------------------------------------------------------

/// Reads secrets from environment variables at the moment they are needed.
pub struct CredentialProvider;

impl CredentialProvider {
    /// Read a credential from a named env var; empty values count as unset.
    pub fn from_env(var_name: &str) -> Option<String> {
        std::env::var(var_name)
            .ok()
            .filter(|v| !v.trim().is_empty())
    }

    /// Resolve the API key for the configured provider.
    pub fn api_key(provider: &ProviderConfig) -> Result<String, ConfigError> {
        let var = provider.api_key_env();
        Self::from_env(var).ok_or_else(|| ConfigError::MissingCredential(var.to_string()))
    }

    /// Providers whose default key variable is present.
    pub fn available_providers() -> Vec<ProviderKind> {
        [ProviderKind::Anthropic, ProviderKind::Openai]
            .into_iter()
            .filter(|k| Self::from_env(k.default_api_key_env()).is_some())
            .collect()
    }
}
