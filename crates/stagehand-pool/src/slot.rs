//! A single unit of work inside a task pool.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Lifecycle of a slot. Each slot moves through these states exactly once
/// and is never reused within the same pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Submitted, process not spawned yet.
    Unstarted,
    /// Child process is alive.
    Running,
    /// Child was reaped (or the slot was cancelled).
    Finished,
}

/// One task's identity, command, and result record.
#[derive(Debug)]
pub struct TaskSlot {
    pub(crate) ident: String,
    pub(crate) working_dir: PathBuf,
    pub(crate) script: String,
    pub(crate) script_file: PathBuf,
    pub(crate) log_file: Option<PathBuf>,
    /// Live child pid; `None` means not running or already reaped.
    pub(crate) pid: Option<u32>,
    /// Pid at launch time, retained for the summary table.
    pub(crate) recorded_pid: u32,
    pub(crate) exit_status: Option<i32>,
    pub(crate) signaled_by: Option<i32>,
    pub(crate) state: TaskState,
    pub(crate) started_at: Option<Instant>,
    pub(crate) elapsed: Duration,
    pub(crate) last_report: Option<Instant>,
}

impl TaskSlot {
    pub(crate) fn new(ident: String, working_dir: PathBuf, script: String, script_file: PathBuf) -> Self {
        Self {
            ident,
            working_dir,
            script,
            script_file,
            log_file: None,
            pid: None,
            recorded_pid: 0,
            exit_status: None,
            signaled_by: None,
            state: TaskState::Unstarted,
            started_at: None,
            elapsed: Duration::ZERO,
            last_report: None,
        }
    }

    /// Task label, unique within its pool for reporting purposes.
    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// Directory the task's process runs in.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// The exact script text the spawned process executes.
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Path of the generated runner file.
    pub fn script_file(&self) -> &Path {
        &self.script_file
    }

    /// Path of the task's log file, once launched.
    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    /// Live child pid, if the task is currently running.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Pid recorded at launch; `0` if the task never started.
    pub const fn recorded_pid(&self) -> u32 {
        self.recorded_pid
    }

    /// Exit code reported by the child, once reaped.
    pub const fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// Signal that terminated the child, if any.
    pub const fn signaled_by(&self) -> Option<i32> {
        self.signaled_by
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> TaskState {
        self.state
    }

    /// Wall-clock runtime, final once the task is reaped.
    pub const fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Summary label for this slot.
    ///
    /// `HOLD` only appears when the pool was torn down (fail-fast or kill)
    /// while this task was still queued.
    pub fn status_label(&self) -> &'static str {
        if self.state == TaskState::Unstarted {
            "HOLD"
        } else if self.signaled_by.is_some() {
            "TERM"
        } else if self.exit_status == Some(0) {
            "DONE"
        } else {
            "FAIL"
        }
    }

    /// Whether the task completed without success: non-zero exit or a signal.
    pub fn failed(&self) -> bool {
        self.signaled_by.is_some() || self.exit_status != Some(0)
    }
}
