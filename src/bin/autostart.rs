use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use dbautostart::config::Config;
use dbautostart::memory::MemoryBroker;
use dbautostart::{ParameterMap, ScriptOutcome, XQueryStartupTrigger, logging};
use tracing::info;

/// Run the startup query scripts of a database tree loaded from disk
#[derive(Debug, Parser)]
#[command(name = "autostart", version)]
struct Cli {
    /// Directory loaded as the `/db` collection
    #[arg(long)]
    root: PathBuf,

    /// TOML or YAML configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Err(e) = logging::init_tracing(&config.logging) {
        eprintln!("tracing already initialised: {}", e);
    }

    let broker = MemoryBroker::new();
    let loaded = broker
        .load_directory(&cli.root)
        .with_context(|| format!("Failed to load {}", cli.root.display()))?;
    info!("Loaded {} documents from {}", loaded, cli.root.display());

    let mut parameter_sets: Vec<ParameterMap> = config
        .xquery_triggers()
        .map(|trigger| trigger.parameter_map())
        .collect();
    if parameter_sets.is_empty() {
        parameter_sets.push(ParameterMap::new());
    }

    let trigger = XQueryStartupTrigger::new();
    for params in &parameter_sets {
        let report = trigger.run(&broker, params).await;

        for run in &report.runs {
            let status = match &run.outcome {
                ScriptOutcome::Completed { result } => format!("ok: {}", result),
                ScriptOutcome::NotFound => "not found".to_string(),
                ScriptOutcome::Failed { stage, message } => {
                    format!("failed ({}): {}", stage.as_str(), message)
                }
                ScriptOutcome::Panicked { message } => format!("aborted: {}", message),
            };
            println!("{} {}", run.locator, status);
        }
        println!(
            "{} completed, {} not found, {} failed",
            report.completed(),
            report.not_found(),
            report.failed()
        );
    }

    Ok(())
}
