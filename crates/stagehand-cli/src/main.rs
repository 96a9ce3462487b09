//! Stagehand CLI
//!
//! Reads a task manifest and runs its tasks in three phases: `setup`
//! (one at a time), `parallel` (bounded by `--jobs`), then `serial`
//! (one at a time). Each phase gets its own task pool; a failure stops
//! the run unless `--continue-on-error` is set.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{error, info};

use stagehand_core::config::{clamp_status_interval, load_settings, Settings};
use stagehand_core::{LogFormat, init_tracing};
use stagehand_pool::{JoinError, TaskPool};

mod manifest;

use manifest::{Manifest, Phase};

#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(version, about = "Run a manifest of build tasks in bounded parallel", long_about = None)]
struct Cli {
    /// Task manifest to run
    #[arg(default_value = "tasks.toml")]
    manifest: PathBuf,

    /// Concurrency ceiling for the parallel phase
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Seconds between "task is running" notices
    #[arg(long)]
    status_interval: Option<u64>,

    /// Keep running the remaining tasks after one fails
    #[arg(long)]
    continue_on_error: bool,

    /// Directory for per-task log files
    #[arg(long)]
    log_root: Option<PathBuf>,

    /// Tracing filter, e.g. "stagehand=debug"
    #[arg(long, default_value = "stagehand=info")]
    log_level: String,

    /// Log output format: "text" or "json"
    #[arg(long, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_format);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting stagehand");

    let project_dir = cli.manifest.parent().map(std::path::Path::to_path_buf);
    let mut settings = load_settings(project_dir.as_deref())?;
    apply_cli_overrides(&mut settings, &cli);

    let manifest = Manifest::load(&cli.manifest)?;
    if manifest.tasks.is_empty() {
        info!(manifest = %cli.manifest.display(), "Manifest has no tasks");
        return Ok(());
    }

    let mut total_failures = 0usize;
    for phase in [Phase::Setup, Phase::Parallel, Phase::Serial] {
        let tasks = manifest.phase_tasks(phase);
        if tasks.is_empty() {
            continue;
        }
        let jobs = match phase {
            Phase::Parallel => settings.runner.jobs,
            Phase::Setup | Phase::Serial => 1,
        };
        let failures = run_phase(&settings, phase, &tasks, jobs).await?;
        total_failures += failures;
        if failures > 0 && !settings.runner.continue_on_error {
            bail!("{} phase failed ({failures} task(s))", phase.label());
        }
    }

    if total_failures > 0 {
        bail!("{total_failures} task(s) failed");
    }
    Ok(())
}

fn apply_cli_overrides(settings: &mut Settings, cli: &Cli) {
    if let Some(jobs) = cli.jobs {
        settings.runner.jobs = jobs.max(1);
    }
    if let Some(secs) = cli.status_interval {
        settings.runner.status_interval_secs = clamp_status_interval(secs);
    }
    if cli.continue_on_error {
        settings.runner.continue_on_error = true;
    }
    if let Some(root) = &cli.log_root {
        settings.runner.log_root = root.clone();
    }
}

/// Run one phase to completion and print its summary.
///
/// Returns the number of failed tasks. Fail-fast teardown and deadlocks
/// come back as errors after the summary is printed.
async fn run_phase(
    settings: &Settings,
    phase: Phase,
    tasks: &[&manifest::TaskDef],
    jobs: usize,
) -> anyhow::Result<usize> {
    info!(
        phase = phase.label(),
        tasks = tasks.len(),
        jobs,
        "Phase starting"
    );

    let mut pool = TaskPool::new(phase.label(), &settings.runner.log_root)
        .with_context(|| format!("Failed to create {} pool", phase.label()))?
        .with_status_interval(Duration::from_secs(settings.runner.status_interval_secs));

    for task in tasks {
        let workdir = task.workdir.clone().unwrap_or_default();
        pool.submit(&task.name, workdir, &task.script)
            .with_context(|| format!("Failed to queue task {}", task.name))?;
    }

    let fail_fast = !settings.runner.continue_on_error;
    match pool.join(jobs, fail_fast).await {
        Ok(failures) => {
            pool.summary();
            info!(phase = phase.label(), failures, "Phase finished");
            Ok(failures)
        }
        Err(err @ (JoinError::FailFast { .. } | JoinError::Deadlock { .. })) => {
            pool.summary();
            error!(phase = phase.label(), %err, "Phase aborted");
            Err(err.into())
        }
        Err(err) => {
            pool.summary();
            error!(phase = phase.label(), %err, "Phase failed to run");
            Err(err.into())
        }
    }
}
