//! Long-context generation benchmark CLI
//!
//! Evaluates language models on long-context generation tasks with
//! checkpointed, resumable phases.
//!
//! ## Quick Start
//!
//! ```bash
//! # Write a starter config, then edit backends/tasks
//! longeval init-config
//!
//! # Full run: generate -> infer -> judge -> report
//! longeval run --config longeval.toml
//!
//! # Phases can also be run (and resumed) individually
//! longeval infer --config longeval.toml
//! longeval judge --config longeval.toml
//! longeval report --config longeval.toml
//! ```
//!
//! Interrupting a run with ctrl-c is safe: in-flight samples are reverted
//! and the next invocation picks up exactly where the run stopped.

mod aggregate;
mod backends;
mod checkpoint;
mod config;
mod judge;
mod sample;
mod scheduler;
mod store;
mod tasks;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use aggregate::aggregate;
use backends::BackendPool;
use checkpoint::{atomic_write_bytes, CheckpointManager};
use config::EvalConfig;
use sample::RunManifest;
use tasks::TaskRegistry;

#[derive(Parser)]
#[command(name = "longeval")]
#[command(about = "Long-context generation benchmark for language models")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration
    #[arg(short, long, default_value = "longeval.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all phases: generate, infer, judge, report
    Run,

    /// Generate the task set and populate the sample snapshot
    Generate,

    /// Run (or resume) the inference pass
    Infer,

    /// Run (or resume) the judging pass
    Judge {
        /// Re-judge samples that already have a score record
        #[arg(long)]
        force: bool,
    },

    /// Aggregate results into report.json
    Report,

    /// Write an example configuration file
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    if matches!(cli.command, Commands::InitConfig) {
        return init_config(&cli.config);
    }

    let config = EvalConfig::load(&cli.config)?;
    let manager = Arc::new(CheckpointManager::new(&config.run_dir()));
    let cancel = cancellation_on_ctrl_c();

    match cli.command {
        Commands::Run => {
            generate(&config, &manager)?;
            infer(&config, Arc::clone(&manager), &cancel).await?;
            if cancel.is_cancelled() {
                eprintln!("Interrupted; re-run to resume.");
                return Ok(());
            }
            judge_phase(&config, Arc::clone(&manager), &cancel, false).await?;
            if cancel.is_cancelled() {
                eprintln!("Interrupted; re-run to resume.");
                return Ok(());
            }
            report(&config, &manager)?;
        }
        Commands::Generate => generate(&config, &manager)?,
        Commands::Infer => infer(&config, manager, &cancel).await?,
        Commands::Judge { force } => judge_phase(&config, manager, &cancel, force).await?,
        Commands::Report => report(&config, &manager)?,
        Commands::InitConfig => unreachable!("handled above"),
    }

    Ok(())
}

/// Wire ctrl-c to a cancellation token observed by every worker.
fn cancellation_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStop requested; letting in-flight calls settle...");
            trigger.cancel();
        }
    });
    cancel
}

fn init_config(path: &PathBuf) -> Result<()> {
    if path.exists() {
        anyhow::bail!("{:?} already exists; not overwriting", path);
    }
    EvalConfig::example().save(path)?;
    println!("Wrote example configuration to {:?}", path);
    Ok(())
}

/// Populate the sample snapshot for this run. A run directory that already
/// holds samples is left alone so resumed runs keep their task set.
fn generate(config: &EvalConfig, manager: &CheckpointManager) -> Result<()> {
    if manager.samples().exists() {
        println!(
            "Sample snapshot already present in {:?}; skipping generation.",
            manager.run_dir()
        );
        return Ok(());
    }

    let registry = TaskRegistry::builtin();
    let records = tasks::generate_records(config, &registry)?;
    manager.samples().merge(&records)?;
    manager.write_manifest(&RunManifest {
        model: config.run.model.clone(),
        task_set: config.run.task_set.clone(),
        worker_count: config.run.worker_count,
        judge_worker_count: config.run.judge_worker_count,
        output_dir: config.run.output_dir.clone(),
        created_at: Utc::now(),
    })?;
    println!(
        "Generated {} samples into {:?}",
        records.len(),
        manager.run_dir()
    );
    Ok(())
}

async fn infer(
    config: &EvalConfig,
    manager: Arc<CheckpointManager>,
    cancel: &CancellationToken,
) -> Result<()> {
    println!("--- Inference: {} ---", config.run.model);
    let pool = BackendPool::from_config(config)?;
    let counts = scheduler::run_inference(config, manager, &pool, cancel).await?;
    println!(
        "Inference done: {} completed, {} failed, {} pending",
        counts.completed, counts.failed, counts.pending
    );
    // Per-sample failures do not fail the run; they are reported and the
    // process still exits 0.
    Ok(())
}

async fn judge_phase(
    config: &EvalConfig,
    manager: Arc<CheckpointManager>,
    cancel: &CancellationToken,
    force: bool,
) -> Result<()> {
    println!("--- Judging ---");
    let pool = BackendPool::from_config(config)?;
    let registry = Arc::new(TaskRegistry::builtin());
    let counts = judge::run_judging(config, manager, &pool, registry, cancel, force).await?;
    println!(
        "Judging done: {} scored, {} errored, {} already scored",
        counts.scored, counts.errored, counts.skipped
    );
    Ok(())
}

fn report(config: &EvalConfig, manager: &CheckpointManager) -> Result<()> {
    let samples = manager.samples().load()?;
    if samples.is_empty() {
        anyhow::bail!("No samples found in {:?}; nothing to report", manager.run_dir());
    }
    let scores = manager.load_scores(false)?;
    let report = aggregate(&config.run.model, &config.run.task_set, &samples, &scores);

    let path = manager.run_dir().join("report.json");
    let bytes = serde_json::to_vec_pretty(&report)?;
    atomic_write_bytes(&path, &bytes).context("Failed to write report")?;

    println!("--- Report: {} ---", report.model);
    for summary in &report.task_types {
        let mean = summary
            .mean_score
            .map(|s| format!("{:.4}", s))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<24} total {:>4} | completed {:>4} | failed {:>3} | stuck {:>3} | scored {:>4} | mean {}",
            summary.task_type,
            summary.total,
            summary.completed,
            summary.failed,
            summary.stuck,
            summary.scored,
            mean,
        );
    }
    let overall_mean = report
        .overall
        .mean_score
        .map(|s| format!("{:.4}", s))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  overall: {}/{} completed, {} failed, {} stuck, mean score {}",
        report.overall.completed,
        report.overall.total,
        report.overall.failed,
        report.overall.stuck,
        overall_mean,
    );
    println!("Report written to {:?}", path);
    Ok(())
}
