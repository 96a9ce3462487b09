//! The scheduling / join loop.
//!
//! [`TaskPool::join`] walks a sliding window over the slot array, launches
//! unstarted tasks up to the concurrency ceiling, and blocks on completion
//! events from the per-child reaper tasks (with a coarse tick for "task is
//! running" notices). Within one pool, tasks become eligible to start
//! strictly in submission order; completion order is unconstrained inside
//! the window.

use std::process::Stdio;
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc2822;
use tokio::process::Command;
use tracing::debug;

use crate::gate::GateError;
use crate::pool::{TaskEvent, TaskPool};
use crate::slot::TaskState;

/// Interval of the coarse wakeup tick inside the join loop.
const POLL_TICK: Duration = Duration::from_secs(1);

/// Command line the child runs: park on stdin until the parent has flushed
/// the log header, then replace the shell with the runner script. `exec`
/// keeps the pid, so the header's pid line stays accurate.
const LAUNCH_WRAPPER: &str = "read -r _\nexec bash --norc \"$0\"";

/// Fatal outcomes of [`TaskPool::join`].
///
/// Ordinary task failures are not errors; they are aggregated into the
/// `Ok(failures)` count and policy belongs to the caller.
#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// A task failed while fail-fast was enabled; every other in-flight task
    /// was terminated and the pool will not resume.
    #[error("Pool '{ident}' terminated early: {failures} task(s) failed with fail-fast enabled")]
    FailFast { ident: String, failures: usize },

    /// The join loop could make no further progress: the window holds only
    /// already-reaped slots, yet not every completion was observed by this
    /// join. Typically the pool was joined twice.
    #[error("Pool '{ident}' is deadlocked: no runnable tasks remain")]
    Deadlock { ident: String },

    /// A child process could not be spawned. The rest of the pool was
    /// terminated; this pool is done.
    #[error("Task '{task}' failed to spawn: {source}")]
    Spawn {
        task: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting on a child failed. The pool was terminated.
    #[error("Waiting on task '{task}' failed: {source}")]
    Wait {
        task: String,
        #[source]
        source: std::io::Error,
    },

    /// The spawn gate was closed underneath the pool.
    #[error(transparent)]
    Gate(#[from] GateError),
}

enum Wake {
    Event(Option<TaskEvent>),
    Tick,
}

impl TaskPool {
    /// Run every submitted task, at most `jobs` concurrently.
    ///
    /// Returns the number of failed tasks on normal completion; `Ok(0)` is
    /// full success. `fail_fast` turns the first failure into immediate
    /// SIGTERM for every other in-flight task and an early
    /// [`JoinError::FailFast`] return. A `jobs` of zero is treated as one.
    pub async fn join(&mut self, jobs: usize, fail_fast: bool) -> Result<usize, JoinError> {
        let jobs = jobs.max(1);
        let used = self.slots.len();
        if used == 0 {
            return Ok(0);
        }

        let mut failures = 0usize;
        let mut complete = 0usize;
        let mut lower = 0usize;
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + POLL_TICK,
            POLL_TICK,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let upper = (lower + jobs).min(used);

            for index in lower..upper {
                if self.slots[index].state == TaskState::Unstarted {
                    if let Err(error) = self.launch(index).await {
                        let task = self.slots[index].ident.clone();
                        self.emit_line(&format!(
                            "[{}:{task}] Unable to spawn task, terminating pool",
                            self.ident
                        ));
                        self.kill(Signal::SIGTERM).await;
                        return Err(into_spawn_error(task, error));
                    }
                }
            }

            // Nothing running and nothing left to launch in the window means
            // no completion event can ever arrive: joining a pool whose tasks
            // were already reaped would otherwise spin forever.
            let running_in_window = (lower..upper)
                .any(|index| self.slots[index].state == TaskState::Running);
            if !running_in_window {
                self.emit_line(&format!("{} is deadlocked", self.ident));
                return Err(JoinError::Deadlock {
                    ident: self.ident.clone(),
                });
            }

            let wake = tokio::select! {
                event = self.events_rx.recv() => Wake::Event(event),
                _ = ticker.tick() => Wake::Tick,
            };

            match wake {
                Wake::Tick => {
                    self.report_running(lower, upper);
                    continue;
                }
                // Both halves of the channel live in the pool; recv cannot
                // observe a closed channel while `self` is alive.
                Wake::Event(None) => continue,
                Wake::Event(Some(event)) => {
                    let status = match event.status {
                        Ok(status) => status,
                        Err(source) => {
                            let task = self.slots[event.index].ident.clone();
                            self.record_reaped(event.index, None);
                            self.cleanup_task_files(event.index);
                            self.kill(Signal::SIGTERM).await;
                            return Err(JoinError::Wait { task, source });
                        }
                    };

                    let failed = self.finish_task(event.index, status, complete);
                    complete += 1;

                    if failed {
                        failures += 1;
                        if fail_fast && used > 1 {
                            self.kill(Signal::SIGTERM).await;
                            return Err(JoinError::FailFast {
                                ident: self.ident.clone(),
                                failures,
                            });
                        }
                    }
                }
            }

            if complete == used {
                break;
            }
            // The window slides once everything below it has completed
            if complete >= upper {
                lower += jobs;
            }
        }

        Ok(failures)
    }

    /// Spawn the child for one slot: log file + header, `bash --norc` on the
    /// runner script, pid bookkeeping, and a reaper task that reports the
    /// exit status on the pool's event channel.
    async fn launch(&mut self, index: usize) -> Result<(), LaunchError> {
        let permit = self.gate.acquire().await?;

        let seq = self.task_seq;
        self.task_seq += 1;
        let log_path = self
            .log_root
            .join(format!("task-{seq}-{}.log", self.parent_pid));

        let (task_ident, working_dir, script_file, script) = {
            let slot = &self.slots[index];
            (
                slot.ident.clone(),
                slot.working_dir.clone(),
                slot.script_file.clone(),
                slot.script.clone(),
            )
        };
        let started = OffsetDateTime::now_utc()
            .format(&Rfc2822)
            .unwrap_or_else(|_| "unknown".to_string());

        let mut log = std::fs::File::create(&log_path).map_err(LaunchError::Io)?;
        let clones = log
            .try_clone()
            .and_then(|out| log.try_clone().map(|err| (out, err)));
        let (log_out, log_err) = match clones {
            Ok(pair) => pair,
            Err(source) => {
                let _ = std::fs::remove_file(&log_path);
                return Err(LaunchError::Io(source));
            }
        };

        debug!(
            target: "stagehand.pool",
            pool = %self.ident,
            task = %task_ident,
            runner = %script_file.display(),
            "Spawning task"
        );

        let spawned = Command::new("bash")
            .arg("--norc")
            .arg("-c")
            .arg(LAUNCH_WRAPPER)
            .arg(&script_file)
            .current_dir(&working_dir)
            .stdin(Stdio::piped())
            .stdout(log_out)
            .stderr(log_err)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                // The empty log would never be reaped; drop it now
                let _ = std::fs::remove_file(&log_path);
                return Err(LaunchError::Io(source));
            }
        };

        let pid = child.id().unwrap_or(0);
        // The child is still parked on stdin, so the header always lands
        // ahead of its output and can name the child's own pid.
        let header = format!(
            "# STARTED: {started}\n# PID: {pid}\n# WORKDIR: {}\n# COMMAND:\n{script}\n# OUTPUT:\n",
            working_dir.display(),
        );
        let written = {
            use std::io::Write as _;
            log.write_all(header.as_bytes()).and_then(|()| log.flush())
        };
        if let Err(source) = written {
            let _ = child.start_kill();
            let _ = std::fs::remove_file(&log_path);
            return Err(LaunchError::Io(source));
        }
        drop(log);
        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt as _;
            let _ = stdin.write_all(b"\n").await;
        }
        let now = Instant::now();
        {
            let slot = &mut self.slots[index];
            slot.log_file = Some(log_path);
            slot.pid = Some(pid);
            slot.recorded_pid = pid;
            slot.state = TaskState::Running;
            slot.started_at = Some(now);
            slot.last_report = Some(now);
        }
        self.emit_line(&format!(
            "[{}:{task_ident}] Task started (pid: {pid})",
            self.ident
        ));

        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = events_tx.send(TaskEvent { index, status });
        });

        drop(permit);
        Ok(())
    }

    /// Record one reaped child, echo its log, and clean up its files.
    /// Returns whether the task failed.
    #[allow(clippy::cast_precision_loss)]
    fn finish_task(&mut self, index: usize, status: std::process::ExitStatus, complete: usize) -> bool {
        let used = self.slots.len();
        self.record_reaped(index, Some(status));

        let (task_ident, exit_status, signaled_by, elapsed) = {
            let slot = &self.slots[index];
            (
                slot.ident.clone(),
                slot.exit_status,
                slot.signaled_by,
                slot.elapsed,
            )
        };

        let percent = ((complete + 1) as f64 / used as f64) * 100.0;
        let progress = format!("[{}:{task_ident}] [{percent:.1}%]", self.ident);

        if let Some(signal) = signaled_by {
            self.emit_line(&format!("{progress} Task ended by signal {signal}"));
        } else {
            self.emit_line(&format!(
                "{progress} Task ended (status: {})",
                exit_status.unwrap_or(-1)
            ));
        }

        // Show the log (always)
        self.dump_log(index);
        self.cleanup_task_files(index);

        let failed = signaled_by.is_some() || exit_status != Some(0);
        if failed {
            self.emit_line(&format!(
                "{progress} Task failed after {}s",
                elapsed.as_secs()
            ));
        } else {
            self.emit_line(&format!(
                "{progress} Task finished after {}s",
                elapsed.as_secs()
            ));
        }
        failed
    }

    /// Emit a "task is running" notice for every running slot in the window
    /// whose previous notice is older than the pool's status interval.
    fn report_running(&mut self, lower: usize, upper: usize) {
        let now = Instant::now();
        let pool_ident = self.ident.clone();
        let status_interval = self.status_interval;

        let mut lines = Vec::new();
        for slot in &mut self.slots[lower..upper] {
            if slot.state != TaskState::Running {
                continue;
            }
            slot.elapsed = slot.started_at.map_or(Duration::ZERO, |t| now - t);
            let due = slot
                .last_report
                .is_none_or(|t| now.duration_since(t) >= status_interval);
            if due {
                slot.last_report = Some(now);
                lines.push(format!(
                    "[{pool_ident}:{}] Task is running (pid: {}, elapsed: {}s)",
                    slot.ident,
                    slot.recorded_pid,
                    slot.elapsed.as_secs()
                ));
            }
        }
        for line in lines {
            self.emit_line(&line);
        }
    }
}

/// Internal launch failure, split into the public [`JoinError`] variants.
#[derive(Debug)]
enum LaunchError {
    Gate(GateError),
    Io(std::io::Error),
}

impl From<GateError> for LaunchError {
    fn from(error: GateError) -> Self {
        Self::Gate(error)
    }
}

fn into_spawn_error(task: String, error: LaunchError) -> JoinError {
    match error {
        LaunchError::Gate(error) => JoinError::Gate(error),
        LaunchError::Io(source) => JoinError::Spawn { task, source },
    }
}
