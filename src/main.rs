//! Paced Pipeline CLI
//!
//! Runs the demo workload through the ordered, paced pipeline.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use paced_pipeline::{build_runtime, run_pipeline, Config};

const DEFAULT_CONFIG: &str = "config.yaml";

#[derive(Parser)]
#[command(name = "paced-pipeline")]
#[command(about = "Run items through concurrent stages into an ordered, paced sink", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG, global = true)]
    config: PathBuf,

    /// Override pipeline depth
    #[arg(long, global = true)]
    depth: Option<usize>,

    /// Override number of items
    #[arg(long, global = true)]
    items: Option<u64>,

    /// Override pace interval in milliseconds
    #[arg(long, global = true)]
    pace_ms: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline (default if no command specified)
    Run,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        None | Some(Commands::Run) => {
            let config = load_config(&cli)?;
            run_command(config)?;
        }

        Some(Commands::Validate) => {
            let config = load_config(&cli)?;
            config.validate()?;
            println!("Configuration is valid");
        }

        Some(Commands::GenerateConfig { output }) => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

/// Load the config file and apply command-line overrides.
///
/// A missing default config file falls back to built-in defaults; an
/// explicitly named file must exist.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?
    } else if cli.config == PathBuf::from(DEFAULT_CONFIG) {
        tracing::info!("No {} found, using defaults", DEFAULT_CONFIG);
        Config::default()
    } else {
        anyhow::bail!("Config file not found: {}", cli.config.display());
    };

    if let Some(depth) = cli.depth {
        config.pipeline.depth = depth;
    }
    if let Some(items) = cli.items {
        config.workload.items = items;
    }
    if let Some(pace_ms) = cli.pace_ms {
        config.pipeline.pace_interval_ms = pace_ms;
    }

    Ok(config)
}

fn run_command(config: Config) -> Result<()> {
    config.validate()?;

    let runtime = build_runtime(
        config.runtime.worker_threads,
        config.runtime.max_blocking_threads,
    )?;
    let stats = runtime.block_on(async { run_pipeline(config).await })?;

    if stats.failed > 0 || stats.stalled > 0 {
        anyhow::bail!("Pipeline finished with lost items: {}", stats);
    }
    println!("Finished!");
    Ok(())
}

fn generate_config_command(output: &PathBuf) -> Result<()> {
    let yaml = r#"# Paced Pipeline Configuration

# === PIPELINE: shape and cadence ===
pipeline:
  # Item pipelines kept in flight beyond the newest one.
  # 0 runs fully serial; at most depth + 1 items are active at once.
  depth: 2

  # Time each sink holds its turn after emitting (milliseconds).
  # Keep this above the summed stage latency for an even cadence.
  pace_interval_ms: 1000

  # Warn when the sequencer has not moved for this long; items queued
  # behind a failed one give up after it. Must exceed pace_interval_ms and
  # should exceed pace plus stage latency. null waits forever.
  stall_timeout_ms: 30000

  # How sinks wait for their turn: notify (default) or poll
  sequencer:
    strategy: notify
    # strategy: poll
    # interval_us: 1

# === WORKLOAD: demo items and stages ===
workload:
  items: 100
  input_prefix: "Input String "

  # Applied in order; each sleeps latency_ms then appends its name
  stages:
    - name: func1
      latency_ms: 900
    - name: func2
      latency_ms: 950

# === RUNTIME: Tokio sizing ===
runtime:
  # Async worker threads (null = num CPUs)
  worker_threads: null

  # Blocking pool size for stage functions (null = tokio default)
  max_blocking_threads: null

# === METRICS: progress reporting ===
metrics:
  enabled: true
  interval_secs: 10
  # output_path: "metrics.json"
"#;

    std::fs::write(output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
