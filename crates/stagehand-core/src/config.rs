//! Runner settings resolution for Stagehand.
//!
//! Implements hierarchical resolution:
//! 1. Built-in defaults
//! 2. Project config (`stagehand.toml`)
//! 3. Environment variables (`STAGEHAND_*`, highest priority)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Lower bound for the "task is running" notice interval, in seconds.
pub const STATUS_INTERVAL_MIN: u64 = 1;

/// Upper bound for the "task is running" notice interval, in seconds.
pub const STATUS_INTERVAL_MAX: u64 = 60 * 10;

/// Complete Stagehand configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub runner: RunnerConfig,
}

/// Task-runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Concurrency ceiling for the parallel phase.
    pub jobs: usize,
    /// Seconds between "task is running" notices for long tasks.
    pub status_interval_secs: u64,
    /// Keep joining the remaining tasks after one fails.
    pub continue_on_error: bool,
    /// Directory for per-task log files.
    pub log_root: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            jobs: default_jobs(),
            status_interval_secs: 30,
            continue_on_error: false,
            log_root: PathBuf::from("stagehand-logs"),
        }
    }
}

/// Number of jobs to run when the caller does not choose one.
pub fn default_jobs() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Clamp a status interval into the supported range.
pub const fn clamp_status_interval(secs: u64) -> u64 {
    if secs < STATUS_INTERVAL_MIN {
        STATUS_INTERVAL_MIN
    } else if secs > STATUS_INTERVAL_MAX {
        STATUS_INTERVAL_MAX
    } else {
        secs
    }
}

/// Load settings with hierarchical resolution.
///
/// `project_dir` points at the directory that may contain `stagehand.toml`;
/// pass `None` to skip the file layer.
pub fn load_settings(project_dir: Option<&Path>) -> Result<Settings> {
    let mut settings = Settings::default();

    if let Some(dir) = project_dir {
        let path = dir.join("stagehand.toml");
        if path.exists() {
            let file = load_settings_file(&path)?;
            merge_settings(&mut settings, file);
        }
    }

    apply_env_overrides(&mut settings);
    if settings.runner.jobs == 0 {
        return Err(Error::Config("runner.jobs must be at least 1".to_string()));
    }
    settings.runner.status_interval_secs =
        clamp_status_interval(settings.runner.status_interval_secs);

    Ok(settings)
}

fn load_settings_file(path: &Path) -> Result<Settings> {
    debug!(config = %path.display(), "Loading settings file");
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

fn merge_settings(base: &mut Settings, overlay: Settings) {
    base.runner = overlay.runner;
}

fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(val) = std::env::var("STAGEHAND_JOBS") {
        if let Ok(n) = val.parse() {
            settings.runner.jobs = n;
        }
    }
    if let Ok(val) = std::env::var("STAGEHAND_STATUS_INTERVAL") {
        if let Ok(n) = val.parse() {
            settings.runner.status_interval_secs = n;
        }
    }
    if let Ok(val) = std::env::var("STAGEHAND_CONTINUE_ON_ERROR") {
        settings.runner.continue_on_error = matches!(val.as_str(), "1" | "true" | "yes");
    }
    if let Ok(val) = std::env::var("STAGEHAND_LOG_ROOT") {
        settings.runner.log_root = PathBuf::from(val);
    }
}
