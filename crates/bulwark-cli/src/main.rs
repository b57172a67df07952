//! Bulwark CLI
//!
//! Commands:
//! - `validate`: check a policy file and print the resolved configuration
//! - `simulate`: drive synthetic traffic through one instance and report metrics

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

use bulwark_core::{PolicyConfig, PolicyFile, TracingSink};
use bulwark_runtime::{
    HealthStatus, InstanceMetrics, PolicyRegistry, ResilienceError, ResilienceManager,
};

#[derive(Parser)]
#[command(name = "bulwark")]
#[command(about = "Resilience policies for calls to unreliable dependencies")]
#[command(version)]
struct Cli {
    /// Log filter used when RUST_LOG is unset
    #[arg(long, global = true, default_value = "bulwark=info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a policy file and print the resolved configuration
    Validate {
        /// Path to the policy file (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Output format (yaml, json)
        #[arg(short, long, default_value = "yaml")]
        format: String,
    },

    /// Run synthetic calls through one instance and print its metrics
    Simulate {
        /// Policy file (YAML); built-in defaults when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Instance name
        #[arg(short, long, default_value = "downstream")]
        name: String,

        /// Number of calls
        #[arg(long, default_value = "100")]
        calls: usize,

        /// Percentage of calls that fail, spread evenly
        #[arg(long, default_value = "0")]
        failure_rate: u32,

        /// Calls in flight at once
        #[arg(long, default_value = "1")]
        concurrency: usize,

        /// Simulated downstream latency in milliseconds
        #[arg(long, default_value = "10")]
        latency_ms: u64,
    },
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    outcomes: BTreeMap<&'static str, usize>,
    metrics: BTreeMap<String, InstanceMetrics>,
    health: BTreeMap<String, HealthStatus>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Validate { config, format } => validate(&config, &format),
        Commands::Simulate {
            config,
            name,
            calls,
            failure_rate,
            concurrency,
            latency_ms,
        } => {
            let options = SimulationOptions {
                calls,
                failure_rate: failure_rate.min(100),
                concurrency: concurrency.max(1),
                latency: Duration::from_millis(latency_ms),
            };
            simulate(config.as_deref(), name, options).await
        }
    }
}

fn validate(path: &Path, format: &str) -> Result<()> {
    let file = PolicyFile::from_yaml_file(path)
        .with_context(|| format!("Invalid policy file: {}", path.display()))?;

    let mut resolved: BTreeMap<String, PolicyConfig> = BTreeMap::new();
    let base = file.base_config()?;
    for (name, overrides) in &file.instances {
        resolved.insert(name.clone(), overrides.apply_to(&base)?);
    }
    resolved.insert("(defaults)".to_string(), base);

    let output = match format {
        "json" => serde_json::to_string_pretty(&resolved)?,
        _ => serde_yaml::to_string(&resolved)?,
    };
    println!("{}", output);

    tracing::info!(
        path = %path.display(),
        instances = file.instances.len(),
        "Policy file is valid"
    );
    Ok(())
}

struct SimulationOptions {
    calls: usize,
    failure_rate: u32,
    concurrency: usize,
    latency: Duration,
}

/// Call `index` fails when it crosses the next multiple of the failure rate.
fn should_fail(index: usize, failure_rate: u32) -> bool {
    let rate = failure_rate as usize;
    (index + 1) * rate / 100 > index * rate / 100
}

async fn simulate(config: Option<&Path>, name: String, options: SimulationOptions) -> Result<()> {
    let registry = match config {
        Some(path) => {
            let file = PolicyFile::from_yaml_file(path)
                .with_context(|| format!("Invalid policy file: {}", path.display()))?;
            PolicyRegistry::from_policy_file(&file, Arc::new(TracingSink))?
        }
        None => PolicyRegistry::with_defaults(),
    };
    let manager = ResilienceManager::new(registry);

    tracing::info!(
        name = %name,
        calls = options.calls,
        concurrency = options.concurrency,
        failure_rate = options.failure_rate,
        "Starting simulation"
    );

    let next = Arc::new(AtomicUsize::new(0));
    let mut workers = JoinSet::new();
    for _ in 0..options.concurrency {
        let manager = manager.clone();
        let name = name.clone();
        let next = next.clone();
        let (calls, failure_rate, latency) = (options.calls, options.failure_rate, options.latency);

        workers.spawn(async move {
            let mut outcomes: BTreeMap<&'static str, usize> = BTreeMap::new();
            loop {
                let index = next.fetch_add(1, Ordering::SeqCst);
                if index >= calls {
                    break;
                }
                let fail = should_fail(index, failure_rate);
                let result: Result<(), ResilienceError<String>> = manager
                    .execute(&name, move || async move {
                        tokio::time::sleep(latency).await;
                        if fail {
                            Err(format!("simulated failure on call {index}"))
                        } else {
                            Ok(())
                        }
                    })
                    .await;

                let label = match result {
                    Ok(()) => "success",
                    Err(err) => outcome_label(&err),
                };
                *outcomes.entry(label).or_default() += 1;
            }
            outcomes
        });
    }

    let mut outcomes: BTreeMap<&'static str, usize> = BTreeMap::new();
    while let Some(joined) = workers.join_next().await {
        for (label, count) in joined.context("Simulation worker panicked")? {
            *outcomes.entry(label).or_default() += count;
        }
    }

    let report = SimulationReport {
        outcomes,
        metrics: manager.get_all_metrics(),
        health: manager.health_check(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !manager.is_healthy() {
        tracing::warn!(name = %name, "Simulation ended with an open circuit");
    }
    Ok(())
}

fn outcome_label<E>(err: &ResilienceError<E>) -> &'static str {
    match err {
        ResilienceError::Operation(_) => "operation_failure",
        ResilienceError::CircuitOpen { .. } => "circuit_open",
        ResilienceError::BulkheadFull { .. } => "bulkhead_full",
        ResilienceError::RateLimited { .. } => "rate_limited",
        ResilienceError::Timeout { .. } => "timeout",
    }
}
