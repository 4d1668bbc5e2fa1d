use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use rowforge::config::ProjectConfig;
use rowforge::ProjectEngine;

#[derive(Parser)]
#[command(
    name = "rowforge",
    about = "Per-row task engine — runs plugin tasks over dataset rows",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Project file (TOML)
    #[arg(
        long,
        short = 'c',
        env = "ROWFORGE_CONFIG",
        default_value = "rowforge.toml",
        global = true
    )]
    config: PathBuf,

    /// Log level filter string, e.g. "debug", "info,rowforge=trace"
    #[arg(long, env = "ROWFORGE_LOG", default_value = "info", global = true)]
    log: String,

    /// Log output format: "pretty" (human-readable) | "json" (structured)
    #[arg(long, env = "ROWFORGE_LOG_FORMAT", default_value = "pretty", global = true)]
    log_format: String,
}

#[derive(Subcommand)]
enum Command {
    /// Provision the schema, then run every task's pass once (default).
    ///
    /// Eligibility is a snapshot per task: rows unblocked by a dependency
    /// during this run are picked up by the next `rowforge run`.
    Run,
    /// Create or extend the project table without dispatching anything.
    Provision,
    /// Print per-task eligible-row counts without dispatching anything.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log, &args.log_format);

    let config = ProjectConfig::load(&args.config)
        .with_context(|| format!("failed to load project file {}", args.config.display()))?;

    match args.command.unwrap_or(Command::Run) {
        Command::Run => {
            let engine = ProjectEngine::connect(config).await?;
            let summary = engine.run().await?;
            println!("run {}", summary.run_id);
            for report in &summary.reports {
                println!(
                    "  {:<24} {:<10} eligible={} ok={} err={}",
                    report.task,
                    report.status.as_str(),
                    report.eligible,
                    report.succeeded,
                    report.failed
                );
            }
        }
        Command::Provision => {
            let project = config.id.clone();
            ProjectEngine::connect(config).await?;
            println!("provisioned table {project:?}");
        }
        Command::Status => {
            let engine = ProjectEngine::connect(config).await?;
            for pending in engine.status().await? {
                match pending.eligible {
                    Some(eligible) => println!("  {:<24} eligible={eligible}", pending.task),
                    None => println!("  {:<24} skipped", pending.task),
                }
            }
        }
    }

    Ok(())
}

fn init_tracing(filter: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
