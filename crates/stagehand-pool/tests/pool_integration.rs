//! End-to-end pool runs against real `bash` processes.
#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stagehand_pool::{JoinError, TaskPool, TaskState};

/// Capture sink shared between the pool and the test body.
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn quiet_pool(ident: &str, dir: &tempfile::TempDir) -> TaskPool {
    TaskPool::new(ident, dir.path().join("mplogs"))
        .unwrap()
        .with_output(Box::new(std::io::sink()))
}

const SIGTERM: i32 = 15;

#[tokio::test]
async fn exit_codes_are_reported_faithfully() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = quiet_pool("fidelity", &dir);
    pool.submit("ok", ".", "exit 0").unwrap();
    pool.submit("bad", ".", "exit 7").unwrap();

    let failures = pool.join(2, false).await.unwrap();
    assert_eq!(failures, 1);

    let ok = pool.task(0).unwrap();
    assert_eq!(ok.state(), TaskState::Finished);
    assert_eq!(ok.exit_status(), Some(0));
    assert_eq!(ok.status_label(), "DONE");

    let bad = pool.task(1).unwrap();
    assert_eq!(bad.exit_status(), Some(7));
    assert_eq!(bad.status_label(), "FAIL");
}

#[tokio::test]
async fn self_signalled_task_is_term_with_signal_number() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = quiet_pool("signals", &dir);
    pool.submit("selfkill", ".", "kill -TERM $$").unwrap();

    let failures = pool.join(1, false).await.unwrap();
    assert_eq!(failures, 1);

    let task = pool.task(0).unwrap();
    assert_eq!(task.signaled_by(), Some(SIGTERM));
    assert_eq!(task.status_label(), "TERM");
}

#[tokio::test]
async fn all_slots_are_reaped_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = quiet_pool("reap", &dir);
    for (i, cmd) in ["true", "uname -a", "/bin/echo hello world"].iter().enumerate() {
        pool.submit(format!("mytask{i}"), ".", cmd).unwrap();
    }

    let failures = pool.join(4, false).await.unwrap();
    assert_eq!(failures, 0);

    for task in pool.tasks() {
        assert_eq!(task.state(), TaskState::Finished);
        assert!(task.pid().is_none(), "pid must be marked reaped");
        assert_ne!(task.recorded_pid(), 0);
        assert_eq!(task.exit_status(), Some(0));
    }
}

#[tokio::test]
async fn submitted_script_reaches_the_child_byte_for_byte() {
    let token = "tok-3f62c1d9e4";
    let dir = tempfile::tempdir().unwrap();
    let sink = SharedBuf::default();
    let mut pool = TaskPool::new("roundtrip", dir.path().join("mplogs"))
        .unwrap()
        .with_output(Box::new(sink.clone()));
    pool.submit("echoer", ".", &format!("echo {token}")).unwrap();

    pool.join(1, false).await.unwrap();

    let output = sink.contents();
    // Header carries the command, the dumped log carries the output
    assert!(output.contains("# COMMAND:"), "missing log header: {output}");
    let pid_line = format!("# PID: {}", pool.task(0).unwrap().recorded_pid());
    assert!(output.contains(&pid_line), "header must name the child: {output}");
    let body = output
        .split_once("# OUTPUT:")
        .map(|(_, after)| after)
        .unwrap();
    assert!(body.contains(token), "token not echoed back: {output}");
}

#[tokio::test]
async fn window_admits_at_most_jobs_tasks_at_once() {
    let dir = tempfile::tempdir().unwrap();
    let trace = dir.path().join("order.txt");
    let mut pool = quiet_pool("window", &dir);
    for i in 0..4 {
        let script = format!(
            "echo start {i} >> {path}\nsleep 0.3\necho end {i} >> {path}",
            path = trace.display()
        );
        pool.submit(format!("mytask{i}"), dir.path(), &script).unwrap();
    }

    let failures = pool.join(2, false).await.unwrap();
    assert_eq!(failures, 0);

    let log = std::fs::read_to_string(&trace).unwrap();
    let mut in_flight = 0usize;
    let mut peak = 0usize;
    for line in log.lines() {
        if line.starts_with("start") {
            in_flight += 1;
            peak = peak.max(in_flight);
        } else if line.starts_with("end") {
            in_flight -= 1;
        }
    }
    assert!(peak <= 2, "more than two tasks overlapped:\n{log}");

    // The window slides in submission order: task 2 may only start after
    // both first-window tasks have ended.
    let start_2 = log.lines().position(|l| l == "start 2").unwrap();
    let end_0 = log.lines().position(|l| l == "end 0").unwrap();
    let end_1 = log.lines().position(|l| l == "end 1").unwrap();
    assert!(start_2 > end_0 && start_2 > end_1, "window advanced early:\n{log}");
}

#[tokio::test]
async fn fail_fast_terminates_running_and_holds_queued_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let sink = SharedBuf::default();
    let mut pool = TaskPool::new("failfast", dir.path().join("mplogs"))
        .unwrap()
        .with_output(Box::new(sink.clone()));
    pool.submit("sleeper", ".", "sleep 30").unwrap();
    pool.submit("breaker", ".", "exit 1").unwrap();
    for i in 2..6 {
        pool.submit(format!("queued{i}"), ".", "sleep 30").unwrap();
    }

    let result = pool.join(2, true).await;
    assert!(
        matches!(result, Err(JoinError::FailFast { failures: 1, .. })),
        "expected fail-fast, got {result:?}"
    );

    let sleeper = pool.task(0).unwrap();
    assert_eq!(sleeper.state(), TaskState::Finished);
    assert_eq!(sleeper.signaled_by(), Some(SIGTERM));
    assert_eq!(sleeper.status_label(), "TERM");

    let breaker = pool.task(1).unwrap();
    assert_eq!(breaker.exit_status(), Some(1));
    assert_eq!(breaker.status_label(), "FAIL");

    for index in 2..6 {
        let held = pool.task(index).unwrap();
        assert_eq!(held.state(), TaskState::Unstarted, "task {index} must stay queued");
        assert_eq!(held.status_label(), "HOLD");
        assert!(!held.script_file().exists(), "runner script must be removed");
    }

    pool.summary();
    let output = sink.contents();
    assert!(output.contains("HOLD"), "summary must show held tasks:\n{output}");
    assert!(output.contains("TERM"), "summary must show the killed task:\n{output}");
}

#[tokio::test]
async fn rejoining_a_finished_pool_reports_deadlock() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = quiet_pool("twice", &dir);
    pool.submit("one", ".", "true").unwrap();
    pool.submit("two", ".", "true").unwrap();

    assert_eq!(pool.join(2, false).await.unwrap(), 0);

    let rejoin = pool.join(2, false).await;
    assert!(
        matches!(rejoin, Err(JoinError::Deadlock { .. })),
        "expected deadlock, got {rejoin:?}"
    );
}

#[tokio::test]
async fn joining_an_empty_pool_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = quiet_pool("empty", &dir);
    assert_eq!(pool.join(4, true).await.unwrap(), 0);
}

#[tokio::test]
async fn logs_and_runner_scripts_are_gone_after_join() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = quiet_pool("cleanup", &dir);
    pool.submit("one", ".", "echo done").unwrap();
    let script = pool.task(0).unwrap().script_file().to_path_buf();

    pool.join(1, false).await.unwrap();

    assert!(!script.exists());
    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("mplogs"))
        .unwrap()
        .collect();
    assert!(leftovers.is_empty(), "log root must be empty: {leftovers:?}");
}

#[tokio::test]
async fn long_tasks_emit_still_running_notices() {
    let dir = tempfile::tempdir().unwrap();
    let sink = SharedBuf::default();
    let mut pool = TaskPool::new("notices", dir.path().join("mplogs"))
        .unwrap()
        .with_status_interval(Duration::from_millis(500))
        .with_output(Box::new(sink.clone()));
    pool.submit("slow", ".", "sleep 2").unwrap();

    pool.join(1, false).await.unwrap();

    let output = sink.contents();
    assert!(
        output.contains("Task is running"),
        "expected a status notice:\n{output}"
    );
}

#[tokio::test]
async fn caller_timeout_pattern_kills_the_pool() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = quiet_pool("timeout", &dir);
    pool.submit("stuck", ".", "sleep 30").unwrap();

    let joined = tokio::time::timeout(Duration::from_millis(200), pool.join(1, false)).await;
    assert!(joined.is_err(), "join must still be in flight");

    pool.kill(stagehand_pool::Signal::SIGTERM).await;

    let task = pool.task(0).unwrap();
    assert_eq!(task.state(), TaskState::Finished);
    assert_eq!(task.signaled_by(), Some(SIGTERM));
    assert_eq!(task.status_label(), "TERM");
}

#[tokio::test]
async fn teardown_after_fail_fast_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let script;
    {
        let mut pool = quiet_pool("teardown", &dir);
        pool.submit("breaker", ".", "exit 1").unwrap();
        pool.submit("held", ".", "sleep 30").unwrap();
        pool.submit("held2", ".", "sleep 30").unwrap();
        script = pool.task(2).unwrap().script_file().to_path_buf();

        let result = pool.join(1, true).await;
        assert!(matches!(result, Err(JoinError::FailFast { .. })));
    }
    assert!(!script.exists(), "drop must remove held runner scripts");
}
