use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Args;
use probe_core::config::{Config, ProviderKind};
use probe_core::types::{RunReport, ScenarioReport};
use probe_harness::cancel::CancelSignal;
use probe_harness::provider::build_provider;
use probe_runner::harness::{HarnessSettings, ScenarioHarness};
use probe_runner::scheduler::Scheduler;
use probe_telemetry::run_span::{new_run_id, run_span};
use tracing::{info, warn, Instrument};

use super::{load_scenario_files, write_json_artifact};

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Scenario files (JSON arrays of descriptors).
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Model provider: anthropic or openai.
    #[arg(long)]
    pub provider: Option<String>,

    /// Model id.
    #[arg(long)]
    pub model: Option<String>,

    /// Total attempts per scenario.
    #[arg(long)]
    pub retries: Option<u32>,

    /// Per-attempt timeout in seconds.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Scenario files run at once.
    #[arg(long)]
    pub file_concurrency: Option<usize>,

    /// Scenarios run at once within one file.
    #[arg(long)]
    pub scenario_concurrency: Option<usize>,

    /// Where to write the JSON report.
    #[arg(short, long, default_value = "probe-report.json")]
    pub output: PathBuf,
}

impl RunArgs {
    /// Apply command-line overrides on top of the loaded config.
    pub fn apply(&self, config: &mut Config) -> anyhow::Result<()> {
        if let Some(provider) = &self.provider {
            let kind: ProviderKind = provider.parse()?;
            if kind != config.provider.kind {
                // Endpoint and key settings belong to the previous kind.
                config.provider.base_url = None;
                config.provider.api_key_env = None;
                config.provider.model = None;
            }
            config.provider.kind = kind;
        }
        if let Some(model) = &self.model {
            config.provider.model = Some(model.clone());
        }
        if let Some(retries) = self.retries {
            config.retry.retries = retries;
        }
        if let Some(timeout) = self.timeout {
            config.runner.scenario_timeout_secs = timeout;
        }
        if let Some(n) = self.file_concurrency {
            config.scheduler.file_concurrency = n;
        }
        if let Some(n) = self.scenario_concurrency {
            config.scheduler.scenario_concurrency = Some(n);
        }
        config.validate().context("invalid options")?;
        Ok(())
    }
}

pub async fn run(mut config: Config, args: RunArgs) -> anyhow::Result<ExitCode> {
    args.apply(&mut config)?;
    let files = load_scenario_files(&args.files)?;
    let provider = build_provider(&config.provider).context("model provider")?;

    let cancel = CancelSignal::new();
    let harness = ScenarioHarness::new(provider, HarnessSettings::from_config(&config))
        .with_cancel(cancel.clone());
    let scheduler = Scheduler::from_config(&config.scheduler);

    let run_id = new_run_id();
    let span = run_span(&run_id, files.len());
    let run = scheduler.run_harness(&harness, files).instrument(span);

    let outcomes = tokio::select! {
        outcomes = run => outcomes,
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id = %run_id, "interrupted, abandoning in-flight scenarios");
            cancel.cancel();
            return Ok(ExitCode::from(130));
        }
    };

    let reports: Vec<ScenarioReport> = outcomes.into_iter().flat_map(|f| f.reports).collect();
    print_tally(&reports);
    let report = RunReport::new(reports);
    write_json_artifact(&args.output, &report)?;
    info!(
        run_id = %run_id,
        path = %args.output.display(),
        passed = report.summary.passed,
        failed = report.summary.failed,
        "report written"
    );

    Ok(if report.summary.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_tally(reports: &[ScenarioReport]) {
    for report in reports {
        println!(
            "{:<4} {}  ({} attempt(s), {:.1}s)",
            report.result.to_string(), report.id, report.attempts, report.execution_time
        );
        if let Some(error) = &report.error {
            println!("       {error}");
        }
    }
    let passed = reports.iter().filter(|r| r.result.is_pass()).count();
    println!("\n{passed} passed, {} failed, {} total", reports.len() - passed, reports.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> RunArgs {
        RunArgs {
            files: vec!["a.json".into()],
            provider: None,
            model: None,
            retries: None,
            timeout: None,
            file_concurrency: None,
            scenario_concurrency: None,
            output: "out.json".into(),
        }
    }

    #[test]
    fn overrides_replace_config_values() {
        let mut config = Config::default();
        let mut a = args();
        a.retries = Some(5);
        a.timeout = Some(42);
        a.file_concurrency = Some(1);
        a.scenario_concurrency = Some(4);
        a.model = Some("custom-model".into());
        a.apply(&mut config).unwrap();

        assert_eq!(config.retry.retries, 5);
        assert_eq!(config.runner.scenario_timeout_secs, 42);
        assert_eq!(config.scheduler.file_concurrency, 1);
        assert_eq!(config.scheduler.scenario_concurrency(), 4);
        assert_eq!(config.provider.model(), "custom-model");
    }

    #[test]
    fn switching_provider_resets_its_endpoint() {
        let mut config = Config::default();
        config.provider.base_url = Some("http://localhost:9999".into());
        let mut a = args();
        a.provider = Some("openai".into());
        a.apply(&mut config).unwrap();

        assert_eq!(config.provider.kind, ProviderKind::Openai);
        assert_eq!(config.provider.base_url(), "https://api.openai.com");
        assert_eq!(config.provider.api_key_env(), "OPENAI_API_KEY");
    }

    #[test]
    fn bad_provider_is_rejected() {
        let mut a = args();
        a.provider = Some("llama".into());
        assert!(a.apply(&mut Config::default()).is_err());
    }
}
