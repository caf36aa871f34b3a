use probe_core::config::{
    Config, ConfigError, CredentialProvider, ProviderConfig, ProviderKind,
};
use std::io::Write;

#[test]
fn default_config() {
    let cfg = Config::default();
    assert_eq!(cfg.general.project_name, "probe");
    assert_eq!(cfg.general.log_level, "info");
    assert_eq!(cfg.provider.kind, ProviderKind::Anthropic);
    assert_eq!(cfg.provider.api_key_env(), "ANTHROPIC_API_KEY");
    assert_eq!(cfg.conversation.api_call_budget, 30);
    assert_eq!(cfg.conversation.cache_window, 3);
    assert_eq!(cfg.retry.retries, 3);
    assert!(cfg.retry.jitter);
    assert_eq!(cfg.scheduler.file_concurrency, 3);
    assert!(cfg.scheduler.scenario_concurrency() >= 1);
    assert!(!cfg.remote_tools.enabled);
    assert!(cfg.runner.allowed_commands.iter().any(|c| c == "ls"));
    cfg.validate().expect("defaults validate");
}

#[test]
fn config_roundtrip() {
    let cfg = Config::default();
    let toml_str = cfg.to_toml().expect("serialize to toml");
    assert!(toml_str.contains("probe"));

    let parsed: Config = toml::from_str(&toml_str).expect("parse toml back");
    assert_eq!(parsed.general.project_name, cfg.general.project_name);
    assert_eq!(parsed.retry, cfg.retry);
    assert_eq!(
        parsed.scheduler.file_concurrency,
        cfg.scheduler.file_concurrency
    );
    parsed.validate().expect("config validates");
}

#[test]
fn config_partial_toml() {
    let partial = r#"
[provider]
kind = "openai"
model = "gpt-4o-mini"

[scheduler]
file_concurrency = 2
scenario_concurrency = 4
"#;
    let cfg: Config = toml::from_str(partial).expect("parse partial");
    assert_eq!(cfg.provider.kind, ProviderKind::Openai);
    assert_eq!(cfg.provider.model(), "gpt-4o-mini");
    assert_eq!(cfg.provider.base_url(), "https://api.openai.com");
    assert_eq!(cfg.scheduler.file_concurrency, 2);
    assert_eq!(cfg.scheduler.scenario_concurrency(), 4);
    // defaults fill in the rest
    assert_eq!(cfg.conversation.api_call_budget, 30);
    assert_eq!(cfg.runner.scenario_timeout_secs, 600);
    cfg.validate().expect("config validates");
}

#[test]
fn provider_timeouts() {
    let cfg = Config::default();
    assert_eq!(cfg.provider.connect_timeout().as_secs(), 10);
    assert_eq!(cfg.provider.read_timeout().as_secs(), 120);

    let legacy: Config = toml::from_str("[provider]\nrequest_timeout_secs = 45\n").expect("parse");
    assert_eq!(legacy.provider.read_timeout_secs, 45);
    assert_eq!(legacy.provider.connect_timeout_secs, 10);
}

#[test]
fn load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[retry]\nretries = 5\ninitial_delay_ms = 10\nmax_delay_ms = 100").unwrap();

    let cfg = Config::load_from(file.path()).expect("load");
    assert_eq!(cfg.retry.retries, 5);
    assert_eq!(cfg.retry.initial_delay().as_millis(), 10);
}

#[test]
fn load_from_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load_from(dir.path().join("nope.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
}

#[test]
fn zero_retries_fails_validation() {
    let mut cfg = Config::default();
    cfg.retry.retries = 0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("retry.retries"));
}

#[test]
fn inverted_delays_fail_validation() {
    let mut cfg = Config::default();
    cfg.retry.initial_delay_ms = 5_000;
    cfg.retry.max_delay_ms = 100;
    assert!(cfg.validate().is_err());
}

#[test]
fn zero_file_concurrency_fails_validation() {
    let mut cfg = Config::default();
    cfg.scheduler.file_concurrency = 0;
    let err = cfg.validate().expect_err("validation should fail");
    assert!(err.to_string().contains("file_concurrency"));
}

#[test]
fn enabled_remote_tools_need_a_command() {
    let mut cfg = Config::default();
    cfg.remote_tools.enabled = true;
    cfg.remote_tools.command = "  ".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn provider_kind_parses() {
    assert_eq!("Anthropic".parse::<ProviderKind>().unwrap(), ProviderKind::Anthropic);
    assert_eq!("openai".parse::<ProviderKind>().unwrap(), ProviderKind::Openai);
    assert!("gemini".parse::<ProviderKind>().is_err());
}

#[test]
fn missing_credential_is_reported_by_name() {
    let provider = ProviderConfig {
        api_key_env: Some("PROBE_TEST_KEY_THAT_IS_NEVER_SET".into()),
        ..ProviderConfig::default()
    };
    let err = CredentialProvider::api_key(&provider).unwrap_err();
    assert!(matches!(err, ConfigError::MissingCredential(ref v) if v == "PROBE_TEST_KEY_THAT_IS_NEVER_SET"));
}
