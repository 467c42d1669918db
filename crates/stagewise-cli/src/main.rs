//! Stagewise CLI - adaptive routing and caching for multi-stage pipelines

mod simulate;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use stagewise_core::config::{Config, ConfigHandle};
use stagewise_core::pipeline::Orchestrator;
use stagewise_core::storage::SqliteStore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::simulate::SimulationOptions;

#[derive(Parser)]
#[command(name = "stagewise")]
#[command(author, version, about = "Adaptive routing and caching for multi-stage pipelines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to config.toml in the stagewise config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a synthetic extract/classify/summarize pipeline and print a JSON report
    Simulate {
        /// Number of pipeline runs
        #[arg(long, default_value_t = 100, value_parser = clap::value_parser!(u64).range(1..))]
        runs: u64,
        /// Tenant the runs are billed to
        #[arg(long, default_value = "demo")]
        tenant: String,
        /// Task type the bandit learns for
        #[arg(long, default_value = "triage")]
        task: String,
        /// Seed for the workload and the sampler
        #[arg(long, default_value_t = 7)]
        seed: u64,
        /// Runs in flight at once
        #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u64).range(1..=256))]
        concurrency: u64,
        /// Distinct inputs to draw from (defaults to half the runs)
        #[arg(long)]
        distinct: Option<u64>,
        /// SQLite file for posteriors and the durable cache tier
        #[arg(long)]
        db: Option<PathBuf>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
    /// List all config values
    List,
    /// Reset to defaults
    Reset,
    /// Print the config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so JSON on stdout stays machine readable
    let directive = if cli.quiet { "stagewise=warn" } else { "stagewise=info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => Config::config_path()?,
    };

    match cli.command {
        Commands::Simulate {
            runs,
            tenant,
            task,
            seed,
            concurrency,
            distinct,
            db,
        } => {
            let options = SimulationOptions {
                runs,
                tenant,
                task,
                seed,
                concurrency: concurrency as usize,
                distinct_inputs: distinct.unwrap_or((runs / 2).max(1)),
            };
            cmd_simulate(&config_path, options, db.as_deref()).await
        }
        Commands::Config { action } => cmd_config(&config_path, action, cli.quiet),
    }
}

async fn cmd_simulate(
    config_path: &Path,
    options: SimulationOptions,
    db: Option<&Path>,
) -> anyhow::Result<()> {
    let config = ConfigHandle::from_file(config_path)?;
    let mut builder = Orchestrator::builder()
        .with_config(config)
        .with_seed(options.seed);

    if let Some(path) = db {
        let store = SqliteStore::connect(path)
            .await
            .with_context(|| format!("Failed to open database: {}", path.display()))?;
        builder = builder.with_store(Arc::new(store));
    }

    let orchestrator = Arc::new(builder.build());
    if db.is_some() {
        match orchestrator.warm_start().await {
            Ok(loaded) => info!(loaded, "Warm-started posteriors"),
            Err(e) => warn!(error = %e, "Warm start failed, starting cold"),
        }
    }

    let cancel = CancellationToken::new();
    let flusher = orchestrator.spawn_flusher(cancel.clone());

    let report = simulate::run(&orchestrator, &options).await;

    cancel.cancel();
    if let Err(e) = flusher.await {
        warn!(error = %e, "Ledger flusher did not shut down cleanly");
    }

    println!("{}", serde_json::to_string_pretty(&report?)?);
    Ok(())
}

fn cmd_config(path: &Path, action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load_from(path)?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load_from(path)?;
            config.set(&key, &value)?;
            config.save_to(path)?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load_from(path)?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset_at(path)?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            println!("{}", path.display());
        }
    }
    Ok(())
}
