//! Task pool construction, submission, cancellation, and teardown.
//!
//! A [`TaskPool`] owns an ordered list of [`TaskSlot`]s, a [`SpawnGate`], and
//! the completion channel its per-child reaper tasks report on. The pool is
//! the single writer of every slot's result fields; children only execute
//! their runner script and write their own log file.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::gate::{DEFAULT_GATE_PERMITS, SpawnGate};
use crate::slot::{TaskSlot, TaskState};

/// Hard upper bound on tasks per pool.
pub const MAX_TASKS: usize = 1000;

/// Default seconds between "task is running" notices.
const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// Completion report sent by a reaper task once its child exits.
#[derive(Debug)]
pub(crate) struct TaskEvent {
    pub(crate) index: usize,
    pub(crate) status: std::io::Result<ExitStatus>,
}

/// A bounded collection of schedulable tasks plus the machinery to run them
/// with limited concurrency.
pub struct TaskPool {
    pub(crate) ident: String,
    pub(crate) log_root: PathBuf,
    pub(crate) slots: Vec<TaskSlot>,
    pub(crate) capacity: usize,
    pub(crate) gate: SpawnGate,
    pub(crate) status_interval: Duration,
    /// Monotonic counter for unique log file names within this pool.
    pub(crate) task_seq: u64,
    /// Orchestrator pid, part of every log file name and header.
    pub(crate) parent_pid: u32,
    pub(crate) events_tx: mpsc::UnboundedSender<TaskEvent>,
    pub(crate) events_rx: mpsc::UnboundedReceiver<TaskEvent>,
    /// Sink for progress lines, task log dumps, and the summary table.
    pub(crate) output: Box<dyn Write + Send>,
}

impl TaskPool {
    /// Create a pool identified by `ident`, logging under `log_root`.
    ///
    /// Creates `log_root` (mode `0700`) if it does not exist. Fails without
    /// partial initialisation when either argument is empty or the directory
    /// cannot be created.
    pub fn new(ident: impl Into<String>, log_root: impl Into<PathBuf>) -> Result<Self, PoolError> {
        let ident = ident.into();
        if ident.is_empty() {
            return Err(PoolError::EmptyIdent);
        }
        let log_root = log_root.into();
        if log_root.as_os_str().is_empty() {
            return Err(PoolError::EmptyLogRoot);
        }

        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder.create(&log_root).map_err(|source| PoolError::LogRoot {
            path: log_root.clone(),
            source,
        })?;

        let gate = SpawnGate::new(&ident, DEFAULT_GATE_PERMITS);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        debug!(target: "stagehand.pool", pool = %ident, log_root = %log_root.display(), "TaskPool created");

        Ok(Self {
            ident,
            log_root,
            slots: Vec::new(),
            capacity: MAX_TASKS,
            gate,
            status_interval: DEFAULT_STATUS_INTERVAL,
            task_seq: 0,
            parent_pid: std::process::id(),
            events_tx,
            events_rx,
            output: Box::new(std::io::stdout()),
        })
    }

    /// Lower the task capacity. Values above [`MAX_TASKS`] are clamped.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.min(MAX_TASKS);
        self
    }

    /// Change the interval between "task is running" notices.
    #[must_use]
    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// Redirect progress lines, log dumps, and summaries to `output`.
    #[must_use]
    pub fn with_output(mut self, output: Box<dyn Write + Send>) -> Self {
        self.output = output;
        self
    }

    /// Queue a task. The process is not started until [`Self::join`] runs.
    ///
    /// Writes the script into a freshly created, owner-only runner file and
    /// records its text verbatim. An empty `working_dir` means the current
    /// directory. Fails when the pool is at capacity; already-submitted
    /// slots are unaffected.
    pub fn submit(
        &mut self,
        ident: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        script: &str,
    ) -> Result<usize, PoolError> {
        if self.slots.len() >= self.capacity {
            return Err(PoolError::Full {
                ident: self.ident.clone(),
                max: self.capacity,
            });
        }

        let ident = ident.into();
        let mut working_dir = working_dir.into();
        if working_dir.as_os_str().is_empty() {
            working_dir = PathBuf::from(".");
        }

        let script_file = write_runner_script(script).map_err(PoolError::Script)?;
        debug!(
            target: "stagehand.pool",
            pool = %self.ident,
            task = %ident,
            runner = %script_file.display(),
            "Runner script created"
        );

        self.slots
            .push(TaskSlot::new(ident, working_dir, script.to_string(), script_file));
        Ok(self.slots.len() - 1)
    }

    /// Send `signal` to every task with a live pid and wait for each to die.
    ///
    /// Terminating signals and stop times are recorded, pids are marked
    /// reaped, and every slot's log and runner files are removed
    /// best-effort. Idempotent: slots with no live pid are skipped.
    #[allow(clippy::cast_possible_wrap)]
    pub async fn kill(&mut self, signal: Signal) {
        self.emit_line(&format!(
            "Sending signal {} to pool '{}'",
            signal.as_str(),
            self.ident
        ));

        let mut pending: Vec<usize> = Vec::new();
        let lines: Vec<String> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.pid.map(|pid| {
                    pending.push(index);
                    format!(
                        "Sending signal {} to task '{}' (pid: {pid})",
                        signal.as_str(),
                        slot.ident
                    )
                })
            })
            .collect();
        for line in lines {
            self.emit_line(&line);
        }

        pending.retain(|&index| {
            let Some(pid) = self.slots[index].pid else {
                return false;
            };
            match kill(Pid::from_raw(pid as i32), signal) {
                // ESRCH: already dead, the reaper will still report it
                Ok(()) | Err(Errno::ESRCH) => true,
                Err(errno) => {
                    warn!(
                        target: "stagehand.pool",
                        pool = %self.ident,
                        task = %self.slots[index].ident,
                        pid,
                        %errno,
                        "Task did not respond to signal"
                    );
                    false
                }
            }
        });

        // Kill-and-confirm: wait for every signalled child to be reaped
        // before returning.
        while !pending.is_empty() {
            let Some(event) = self.events_rx.recv().await else {
                break;
            };
            pending.retain(|&index| index != event.index);
            self.record_reaped(event.index, event.status.ok());
            self.cleanup_task_files(event.index);
        }

        // Runner scripts of HOLD tasks must not outlive the pool's run
        for index in 0..self.slots.len() {
            self.cleanup_task_files(index);
        }
    }

    /// Print one line per slot: status label, pid, elapsed seconds, identity.
    ///
    /// Safe to call when some slots never started (fail-fast path).
    pub fn summary(&mut self) {
        let banner = "=".repeat(79);
        let mut lines = vec![
            banner.clone(),
            format!("Pool execution summary for \"{}\"", self.ident),
            banner,
            "STATUS     PID     DURATION     IDENT".to_string(),
        ];
        for slot in &self.slots {
            lines.push(format!(
                "{:<4}   {:>10}  {:>7}s     {:<10}",
                slot.status_label(),
                slot.recorded_pid,
                slot.elapsed.as_secs(),
                slot.ident
            ));
        }
        lines.push(String::new());
        for line in lines {
            self.emit_line(&line);
        }
    }

    /// Pool identity, as given at construction.
    pub fn ident(&self) -> &str {
        &self.ident
    }

    /// Directory holding per-task log files.
    pub fn log_root(&self) -> &Path {
        &self.log_root
    }

    /// Number of submitted tasks.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether any task has been submitted.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Task capacity of this pool.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Access a submitted task by the handle `submit` returned.
    pub fn task(&self, index: usize) -> Option<&TaskSlot> {
        self.slots.get(index)
    }

    /// All submitted tasks, in submission order.
    pub fn tasks(&self) -> &[TaskSlot] {
        &self.slots
    }

    /// The spawn-throttling gate owned by this pool.
    pub const fn gate(&self) -> &SpawnGate {
        &self.gate
    }

    /// Record a reaped child on a slot. `status` is `None` when the wait
    /// itself failed; the slot is still marked finished so teardown can
    /// proceed.
    pub(crate) fn record_reaped(&mut self, index: usize, status: Option<ExitStatus>) {
        #[cfg(unix)]
        use std::os::unix::process::ExitStatusExt;

        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if let Some(status) = status {
            slot.exit_status = status.code();
            #[cfg(unix)]
            {
                slot.signaled_by = status.signal();
            }
        }
        slot.elapsed = slot.started_at.map_or(Duration::ZERO, |t| t.elapsed());
        slot.pid = None;
        slot.state = TaskState::Finished;
    }

    /// Copy a finished task's log to the output sink.
    pub(crate) fn dump_log(&mut self, index: usize) {
        let Some(path) = self.slots.get(index).and_then(|s| s.log_file.clone()) else {
            return;
        };
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                let _ = self.output.write_all(contents.as_bytes());
                let _ = self.output.write_all(b"\n");
                let _ = self.output.flush();
            }
            Err(error) => {
                warn!(
                    target: "stagehand.pool",
                    log = %path.display(),
                    %error,
                    "Unable to read task log"
                );
            }
        }
    }

    /// Remove a task's log and runner files, best-effort.
    pub(crate) fn cleanup_task_files(&self, index: usize) {
        let Some(slot) = self.slots.get(index) else {
            return;
        };
        if let Some(log_file) = &slot.log_file {
            remove_if_present(log_file, "log file");
        }
        remove_if_present(&slot.script_file, "runner script");
    }

    pub(crate) fn emit_line(&mut self, line: &str) {
        let _ = writeln!(self.output, "{line}");
        let _ = self.output.flush();
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        for index in 0..self.slots.len() {
            self.cleanup_task_files(index);
        }
        debug!(target: "stagehand.pool", pool = %self.ident, "TaskPool released");
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("ident", &self.ident)
            .field("log_root", &self.log_root)
            .field("used", &self.slots.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// Write `script` into a fresh owner-only runner file and keep it on disk.
///
/// The restrictive mode prevents eavesdropping when credentials are
/// interpolated into task scripts in plain text.
fn write_runner_script(script: &str) -> std::io::Result<PathBuf> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("stagehand-task-").suffix(".sh");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        builder.permissions(std::fs::Permissions::from_mode(0o700));
    }
    let mut file = builder.tempfile()?;
    write!(file, "#!/bin/bash\n{script}\n")?;
    file.flush()?;
    let (_file, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}

fn remove_if_present(path: &Path, what: &str) {
    if !path.exists() {
        return;
    }
    if let Err(error) = std::fs::remove_file(path) {
        warn!(target: "stagehand.pool", path = %path.display(), %error, "Unable to remove {what}");
    } else {
        debug!(target: "stagehand.pool", path = %path.display(), "Removed {what}");
    }
}

/// Errors from pool construction and task submission.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Pools must be identifiable in reports and gate names.
    #[error("Pool identity must not be empty")]
    EmptyIdent,

    /// A pool cannot run without somewhere to put task logs.
    #[error("Pool log root must not be empty")]
    EmptyLogRoot,

    /// The log directory could not be created.
    #[error("Unable to create log root '{path}': {source}")]
    LogRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The pool is at capacity; the submission was rejected.
    #[error("Pool '{ident}' is full ({max} tasks)")]
    Full { ident: String, max: usize },

    /// The runner script could not be created.
    #[error("Unable to create runner script: {0}")]
    Script(#[source] std::io::Error),
}
