mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::{Parser, Subcommand};
use probe_core::config::Config;
use probe_telemetry::logging::{self, LogFormat};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// probe -- drive a model through CLI test scenarios and report PASS/FAIL.
#[derive(Parser)]
#[command(name = "probe", version, about)]
struct Cli {
    /// Config file (defaults to ~/.probe/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every scenario in the given scenario files.
    Run(commands::run::RunArgs),

    /// List the scenarios in the given files without running them.
    List {
        /// Scenario files (JSON arrays of descriptors).
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Print the effective configuration as TOML.
    Config,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Config::load().context("loading default config"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    let format = if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Human
    };
    logging::init(format, "probe", &config.general.log_level);

    match cli.command {
        Commands::Run(args) => commands::run::run(config, args).await,
        Commands::List { files } => {
            commands::list::run(&files)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
    }
}
