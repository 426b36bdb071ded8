use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mfc_pipeline::{
    build_scheduler, load_task_registry, run_once, IngestionEngine, PipelineConfig,
};
use mfc_storage::MatchStore;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mfc")]
#[command(about = "Magny FC 78 match sync pipeline")]
struct Cli {
    /// Parse and resolve without writing anything.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Extra diagnostics, including raw page dumps.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start the cron scheduler and run until interrupted.
    Run,
    /// Run tasks once, outside the schedule.
    RunOnce {
        /// Task name; all enabled tasks when omitted.
        #[arg(long)]
        task: Option<String>,
    },
    /// Execute one ingestion pass in-process (the unit the scheduler spawns).
    Ingest,
    /// Apply pending database migrations.
    Migrate,
}

fn init_logging(verbose: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let log_dir = std::env::var("MFC_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./logs"));
    let file_appender = tracing_appender::rolling::daily(log_dir, "mfc.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose);
    let config = PipelineConfig::from_env();

    // Host flags travel with every spawned child so dry-run/verbose hold
    // across the process boundary.
    let mut passthrough: Vec<String> = Vec::new();
    if cli.dry_run {
        passthrough.push("--dry-run".to_string());
    }
    if cli.verbose {
        passthrough.push("--verbose".to_string());
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let registry = load_task_registry(&config.tasks_file).await?;
            let (mut sched, added) = build_scheduler(&registry.tasks, &passthrough).await?;
            if added == 0 {
                warn!("no tasks scheduled, the process will idle");
            }
            sched.start().await.context("starting scheduler")?;
            info!(tasks = added, "scheduler running, Ctrl-C to stop");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::RunOnce { task } => {
            let registry = load_task_registry(&config.tasks_file).await?;
            let reports = run_once(&registry.tasks, task.as_deref(), &passthrough).await?;
            let mut failed = false;
            for report in &reports {
                if report.success {
                    println!("task {}: ok ({} attempt(s))", report.task, report.attempts);
                } else {
                    failed = true;
                    println!(
                        "task {}: FAILED after {} attempt(s): {}",
                        report.task,
                        report.attempts,
                        report.last_error.as_deref().unwrap_or("unknown error")
                    );
                    for line in &report.stderr_tail {
                        println!("  stderr| {line}");
                    }
                }
            }
            if failed {
                std::process::exit(1);
            }
        }
        Commands::Ingest => {
            let engine = IngestionEngine::new(config);
            let report = engine.run(cli.dry_run, cli.verbose).await?;
            println!(
                "ingest complete: run_id={} found={} inserted={} updated={} unchanged={} via_api={}{}",
                report
                    .run_id
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                report.stats.matches_found,
                report.stats.matches_inserted,
                report.stats.matches_updated,
                report.stats.matches_unchanged,
                report.via_api,
                if report.dry_run { " (dry-run)" } else { "" }
            );
        }
        Commands::Migrate => {
            let store = MatchStore::connect(&config.database_url).await?;
            store.migrate().await?;
            store.close().await;
            println!("migrations applied");
        }
    }

    Ok(())
}
