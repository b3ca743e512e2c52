use clap::{Parser, Subcommand};
use hive_coordinator::{Coordinator, CoordinatorConfig};
use hive_core::{HiveError, TaskOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hive", about = "Hive: multi-worker task coordinator")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "hive.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a single task, wait for it, and print the outcome as JSON
    Run {
        /// Task prompt
        prompt: String,
        /// Task type used to match worker specialties
        #[arg(short = 't', long, default_value = "general")]
        task_type: String,
        /// Require a consensus among several workers
        #[arg(long)]
        consensus: bool,
        /// Extra context as key=value (value parsed as JSON when possible)
        #[arg(long = "context", value_parser = parse_context)]
        context: Vec<(String, serde_json::Value)>,
        /// How long to wait for the outcome (overrides config)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// List registered workers and their health
    Workers,
}

fn parse_context(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty context key in '{raw}'"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Load the coordinator config, falling back to defaults when the file is absent.
fn load_config(path: &Path) -> anyhow::Result<CoordinatorConfig> {
    if !path.exists() {
        info!(path = %path.display(), "No config file, using defaults");
        return Ok(CoordinatorConfig::default());
    }
    CoordinatorConfig::from_file(path)
        .map_err(|e| anyhow::anyhow!("Failed to load config '{}': {}", path.display(), e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run {
            prompt,
            task_type,
            consensus,
            context,
            timeout_ms,
        } => {
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.default_timeout());
            let coordinator = Coordinator::new(config)?;
            coordinator.start().await?;

            let mut options = TaskOptions::new().with_type(task_type);
            if consensus {
                options = options.with_consensus(true);
            }
            for (key, value) in context {
                options = options.with_context(key, value);
            }

            let id = coordinator.submit(prompt, options).await?;
            let outcome = coordinator.await_result(&id, timeout).await;
            coordinator.stop().await;

            match outcome {
                Ok(outcome) => {
                    println!("{}", serde_json::to_string_pretty(&outcome)?);
                }
                Err(HiveError::TaskFailed(failure)) => {
                    eprintln!("{}", serde_json::to_string_pretty(&failure)?);
                    anyhow::bail!("Task {} failed: {}", failure.task_id, failure.reason);
                }
                Err(e) => {
                    warn!(task_id = %id, error = %e, "Task did not complete");
                    return Err(e.into());
                }
            }
        }
        Commands::Workers => {
            let coordinator = Coordinator::new(config)?;
            coordinator.start().await?;
            coordinator.check_health().await;
            let workers = coordinator.workers().await;
            coordinator.stop().await;

            if workers.is_empty() {
                println!("No workers registered.");
                println!("Enable register_builtin_workers in hive.toml to use the built-in specialists");
            } else {
                println!("Registered workers:");
                for worker in &workers {
                    let health = if worker.healthy { "healthy" } else { "unhealthy" };
                    println!(
                        "  {} [{}] {}, workload {:.2}",
                        worker.name, worker.specialty, health, worker.workload
                    );
                }
                println!("\nTotal: {} worker(s)", workers.len());
            }
        }
    }

    Ok(())
}
