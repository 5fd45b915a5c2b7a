//! apkforge CLI

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use apkforge::core::config::Config;
use apkforge::run::orchestrator::{self, Orchestrator};
use apkforge::ui::CliReporter;

#[derive(Parser)]
#[command(name = "apkforge")]
#[command(author, version, about = "Unattended APK patch builder")]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    /// Path to the build configuration
    #[arg(env = "APKFORGE_CONFIG", default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Remove generated temp/build/log artifacts and exit
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Clean) => {
            orchestrator::clean_artifacts().context("clean failed")?;
            tracing::info!("removed generated artifacts");
            Ok(())
        }
        None => build(&cli.config).await,
    }
}

async fn build(config_path: &std::path::Path) -> Result<()> {
    // Configuration errors are fatal before any job is scheduled.
    let config = Config::load(config_path)
        .with_context(|| format!("invalid configuration: {}", config_path.display()))?;

    let reporter = Arc::new(CliReporter);
    let orchestrator = Orchestrator::new(config, reporter)?;

    let summary = tokio::select! {
        summary = orchestrator.run() => summary,
        _ = tokio::signal::ctrl_c() => {
            tracing::error!("interrupted, sweeping partial files");
            orchestrator::sweep_temp_litter();
            bail!("interrupted");
        }
    };

    if !summary.produced_output() {
        bail!("no artifacts were produced");
    }
    Ok(())
}
