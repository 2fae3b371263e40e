// Copyright (c) 2025 Nikolay Denev <ndenev@gmail.com>
// SPDX-License-Identifier: BSD-3-Clause

mod cli;
mod config;
mod controller;
mod evaluator;
mod kubernetes;
mod output;
mod pipeline;
mod policy;
mod progress;
mod scheduler;

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use cli::{Args, Command, OutputFormat};
use config::Config;
use controller::Controller;
use kubernetes::KubeCluster;
use output::MatchTable;
use pipeline::SelectionPipeline;
use policy::{Cleaner, Policy};
use progress::{ProgressUpdate, create_progress_handle, create_spinner};
use scheduler::{Scheduler, TaskOutcome, TaskReport, TaskStatus};

/// Initialize logging to stderr and, when `log_dir` is set, a rolling file
fn init_logging(default_filter: &str, log_dir: Option<&Path>) {
    use tracing_rolling_file::{RollingConditionBase, RollingFileAppenderBase};
    use tracing_subscriber::fmt::format::FmtSpan;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let file_writer = log_dir.and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Warning: Could not create log directory: {}", e);
            return None;
        }

        // Rotate daily or at 10MB, keep 5 files
        let condition = RollingConditionBase::new()
            .daily()
            .max_size(10 * 1024 * 1024);
        match RollingFileAppenderBase::new(dir.join("cleany.log"), condition, 5) {
            Ok(appender) => {
                let (non_blocking, guard) = appender.get_non_blocking_appender();
                // Keep the background writer alive for the process lifetime
                std::mem::forget(guard);
                Some(non_blocking)
            }
            Err(e) => {
                eprintln!("Warning: Could not create log file: {}", e);
                None
            }
        }
    });

    let file_layer = file_writer.map(|writer| {
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_span_events(FmtSpan::NONE)
    });
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(FmtSpan::NONE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (aws-lc-rs)
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        bail!("Failed to install rustls crypto provider");
    }

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    // The scan command prints its results on stdout, keep stderr quiet
    let default_filter = match (&args.command, args.verbose) {
        (_, true) => "cleany=debug",
        (Command::Run { .. }, false) => "cleany=info",
        (Command::Scan { .. } | Command::Config { .. }, false) => "cleany=warn",
    };
    init_logging(default_filter, config.log_dir.as_deref());

    match args.command {
        Command::Run {
            workers,
            timeout,
            resync,
        } => {
            let mut config = config;
            if let Some(workers) = workers {
                config.workers = workers;
            }
            if let Some(timeout) = timeout {
                config.task_timeout_secs = timeout;
            }
            if let Some(resync) = resync {
                config.resync_interval_secs = resync;
            }
            run_controller(args.context.as_deref(), config).await
        }
        Command::Scan {
            file,
            output,
            no_headers,
            timeout,
        } => {
            let mut config = config;
            if let Some(timeout) = timeout {
                config.task_timeout_secs = timeout;
            }
            run_scan(args.context.as_deref(), config, &file, output, no_headers).await
        }
        Command::Config { write } => {
            let path = match args.config {
                Some(path) => path,
                None => Config::config_path()?,
            };
            println!(
                "{}",
                serde_json::to_string_pretty(&config).context("Failed to serialize config")?
            );
            if write {
                config.save_to(&path)?;
                eprintln!("Wrote {}", path.display());
            }
            Ok(())
        }
    }
}

async fn run_controller(context: Option<&str>, config: Config) -> Result<()> {
    let cluster = Arc::new(KubeCluster::connect(context).await?);
    let pipeline = SelectionPipeline::new(Arc::clone(&cluster), config.evaluator())
        .with_evaluation_concurrency(config.evaluation_concurrency);
    let scheduler = Scheduler::new(Arc::new(pipeline), config.scheduler_config());
    let controller = Controller::new(cluster, scheduler.clone(), config.resync_interval());

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Interrupt received, shutting down"),
                Err(e) => warn!(error = %e, "Could not listen for interrupt, shutting down"),
            }
            shutdown.cancel();
        }
    });

    tokio::try_join!(scheduler.run(shutdown.clone()), controller.run(shutdown))?;
    Ok(())
}

async fn run_scan(
    context: Option<&str>,
    config: Config,
    file: &Path,
    format: OutputFormat,
    no_headers: bool,
) -> Result<()> {
    let cleaner = Cleaner::from_file(file)?;
    let policy = Policy::from_spec(&cleaner.spec)
        .with_context(|| format!("Invalid cleaner: {}", cleaner.name()))?;

    let spinner = create_spinner("Connecting to Kubernetes...");
    let cluster = Arc::new(KubeCluster::connect(context).await?);

    let progress = create_progress_handle();
    let mut progress_rx = progress.subscribe();
    let pipeline = SelectionPipeline::new(cluster, config.evaluator())
        .with_evaluation_concurrency(config.evaluation_concurrency)
        .with_progress(Arc::clone(&progress));
    let mut scheduler_config = config.scheduler_config();
    scheduler_config.workers = 1;
    let scheduler = Scheduler::new(Arc::new(pipeline), scheduler_config);

    let name = cleaner.name().to_string();
    if !scheduler.submit(&name, policy).await {
        bail!("Could not queue cleaner {}", name);
    }

    let shutdown = CancellationToken::new();
    let serving = tokio::spawn({
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        async move { scheduler.run(shutdown).await }
    });

    spinner.set_message(format!("Selecting resources for {}...", name));
    let mut poll = tokio::time::interval(Duration::from_millis(100));
    let report = loop {
        tokio::select! {
            update = progress_rx.recv() => {
                if let Ok(update) = update {
                    show_progress(&spinner, &update, progress.progress());
                }
            }
            _ = poll.tick() => {
                if let Some(task) = scheduler.status_of(&name).await
                    && task.status == TaskStatus::Done
                {
                    break task.report;
                }
            }
        }
    };
    spinner.finish_and_clear();

    shutdown.cancel();
    serving.await.context("Scheduler task failed")??;

    let report: TaskReport = report.context("Finished task has no report")?;
    for error in &report.errors {
        eprintln!("Warning: {}", error);
    }
    match report.outcome {
        TaskOutcome::Completed => {}
        TaskOutcome::TimedOut => eprintln!(
            "Warning: timed out after {}s, results may be incomplete",
            report.elapsed.as_secs()
        ),
        TaskOutcome::Failed => bail!("Selection failed for cleaner {}", name),
    }

    println!(
        "{}",
        MatchTable::from_matches(&report.matches).format(format, no_headers)
    );
    Ok(())
}

fn show_progress(spinner: &indicatif::ProgressBar, update: &ProgressUpdate, (done, total): (usize, usize)) {
    match update {
        ProgressUpdate::SelectionStarted { task, selectors } => spinner.set_message(format!(
            "Selecting resources for {} ({} selectors)...",
            task, selectors
        )),
        ProgressUpdate::SelectorComplete {
            task,
            kind,
            candidates,
            matches,
            elapsed_ms,
        } => spinner.set_message(format!(
            "[{}/{}] {}/{}: {} of {} matched in {}ms",
            done, total, task, kind, matches, candidates, elapsed_ms
        )),
        ProgressUpdate::SelectorFailed { task, kind, error } => spinner.set_message(format!(
            "[{}/{}] {}/{} failed: {}",
            done, total, task, kind, error
        )),
        ProgressUpdate::SelectionComplete {
            task,
            matches,
            elapsed_ms,
        } => spinner.set_message(format!(
            "{}: {} matches in {}ms",
            task, matches, elapsed_ms
        )),
    }
}
