//! TransferQ CLI - resumable, prioritized bulk copy
//!
//! Runs a tree copy through the persisted work queue, compares trees, lists
//! saved task states, and cleans up old ones.

use anyhow::Context;
use clap::Parser;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use transferq::config::{CliArgs, Commands, EngineConfig, LogFormat, OperationClass};
use transferq::core::TaskDriver;
use transferq::progress::ProgressReporter;
use transferq::sync::{StateStore, TaskIdentity};
use transferq::transfer::{CompareOptions, LocalCopy, LocalCopyOptions, TreeCompare};

#[tokio::main]
async fn main() {
    // Parse CLI arguments
    let args = CliArgs::parse();

    if let Err(e) = init_logging(&args) {
        eprintln!("Error: {:#}", e);
        std::process::exit(2);
    }

    match run(args).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn init_logging(args: &CliArgs) -> anyhow::Result<()> {
    let level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,transferq={}", level)));

    let log_file = match &args.log_file {
        Some(path) => Some(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?,
        ),
        None => None,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match (args.log_format, log_file) {
        (LogFormat::Json, Some(file)) => builder.json().with_ansi(false).with_writer(Mutex::new(file)).init(),
        (LogFormat::Json, None) => builder.json().with_writer(std::io::stderr).init(),
        (LogFormat::Text, Some(file)) => builder.with_ansi(false).with_writer(Mutex::new(file)).init(),
        (LogFormat::Text, None) => builder.with_writer(std::io::stderr).init(),
    }

    Ok(())
}

async fn run(args: CliArgs) -> anyhow::Result<bool> {
    let config = EngineConfig::from_cli(&args)?;

    match &args.command {
        Commands::Copy {
            source,
            destination,
            only_children,
            restart,
            ..
        } => cmd_copy(&args, &config, source, destination, *only_children, *restart).await,
        Commands::Compare { source, destination, .. } => cmd_compare(&args, &config, source, destination).await,
        Commands::Status => cmd_status(&config),
        Commands::Clean { max_age, task } => cmd_clean(&config, *max_age, task.as_deref()),
    }
}

async fn cmd_copy(
    args: &CliArgs,
    config: &EngineConfig,
    source: &Path,
    destination: &Path,
    only_children: bool,
    restart: bool,
) -> anyhow::Result<bool> {
    let options = LocalCopyOptions {
        collision: config.collision,
        hash: config.hash,
        excludes: config.exclude_list()?,
        only_children,
    };
    let excludes = options.excludes.describe();
    let engine = Arc::new(LocalCopy::new(options));

    let (source, destination, seeds) = engine.plan(source, destination).await?;
    let identity = engine.identity(&source, &destination);
    let store = StateStore::new(&config.state_dir)
        .with_context(|| format!("Failed to open state directory {}", config.state_dir.display()))?;
    let class = OperationClass::Copy;
    let workers = config.workers.workers_for(class);

    info!(
        task = %identity,
        class = class.as_str(),
        workers,
        hash = config.hash.name(),
        on_collision = ?config.collision,
        excludes = %excludes,
        "Copying {} to {}",
        source.display(),
        destination.display()
    );

    let cancel = cancel_on_ctrl_c("Interrupted, saving queue state");

    let progress = if args.progress && !args.quiet {
        ProgressReporter::new()
    } else {
        ProgressReporter::disabled()
    };
    let driver = TaskDriver::new(identity, store, engine.registry())
        .workers(workers)
        .retry(config.retry)
        .snapshot(config.snapshot)
        .restart(restart)
        .with_cancellation(cancel)
        .with_progress(Arc::new(progress));

    let summary = driver.run(seeds).await?;

    if !args.quiet {
        summary.print_summary();
    }

    Ok(summary.is_success())
}

async fn cmd_compare(
    args: &CliArgs,
    config: &EngineConfig,
    source: &Path,
    destination: &Path,
) -> anyhow::Result<bool> {
    let options = CompareOptions {
        hash: config.hash,
        excludes: config.exclude_list()?,
    };
    let class = OperationClass::List;
    let workers = config.workers.workers_for(class);
    info!(class = class.as_str(), workers, hash = config.hash.name(), "Gathering compare items");

    let cancel = cancel_on_ctrl_c("Interrupted, stopping comparison");
    let summary = Arc::new(TreeCompare::new(options))
        .run(source, destination, workers, config.retry, cancel)
        .await?;

    if !args.quiet {
        summary.print_summary();
    }

    Ok(summary.is_success())
}

/// Token cancelled on the first Ctrl+C
fn cancel_on_ctrl_c(message: &'static str) -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("{}", message);
            token.cancel();
        }
    });
    cancel
}

fn cmd_status(config: &EngineConfig) -> anyhow::Result<bool> {
    let store = StateStore::new(&config.state_dir)?;
    let states = store.list()?;

    if states.is_empty() {
        println!("No saved tasks in {}", store.state_dir().display());
        return Ok(true);
    }

    println!("{:<24} {:<10} {:>8}  {}", "TASK", "STATUS", "QUEUED", "UPDATED");
    for state in states {
        println!(
            "{:<24} {:<10} {:>8}  {}",
            state.id,
            format!("{:?}", state.status).to_lowercase(),
            state.queued,
            state.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(true)
}

fn cmd_clean(config: &EngineConfig, max_age: std::time::Duration, task: Option<&str>) -> anyhow::Result<bool> {
    let store = StateStore::new(&config.state_dir)?;

    if let Some(task) = task {
        let id = TaskIdentity::from_raw(task);
        if !id.is_valid() {
            anyhow::bail!("Invalid task id '{}'", task);
        }
        if store.delete(&id)? {
            println!("Removed {}", id);
        } else {
            println!("No saved state for {}", id);
        }
        return Ok(true);
    }

    let cleaned = store.cleanup(max_age)?;
    println!(
        "Removed {} state(s) finished or idle for more than {}",
        cleaned,
        humantime::format_duration(max_age)
    );
    Ok(true)
}
