//! External command execution.
//!
//! Every external tool goes through [`CommandRunner`], so steps never depend
//! on a concrete tool and tests can substitute a recording double.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::types::{FailureReason, StepResult};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to wait for a pipe to hit EOF once its writers were killed.
const DRAIN_WAIT: Duration = Duration::from_millis(100);

/// Runs one external program per call.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, killing it if it outlives `timeout`.
    ///
    /// The limit covers the whole process group: a helper the tool leaves
    /// behind holding its output open counts against it too.
    ///
    /// Never fails: spawn errors, timeouts and non-zero exits are reported
    /// through the returned outcome, with the exit code kept for callers.
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> StepResult;
}

/// Shared cancellation flag for an operator interrupt.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Runs real subprocesses.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    working_dir: PathBuf,
    grace_period: Duration,
    cancel: CancelToken,
}

impl SystemRunner {
    pub fn new(working_dir: impl Into<PathBuf>, grace_period: Duration, cancel: CancelToken) -> Self {
        Self {
            working_dir: working_dir.into(),
            grace_period,
            cancel,
        }
    }
}

enum Stop {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    Lost(String),
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String], timeout: Duration) -> StepResult {
        let start = Instant::now();

        if self.cancel.is_cancelled() {
            return StepResult::failure(FailureReason::Cancelled);
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so stopping the tool also stops whatever it forked.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return StepResult {
                    duration_ms: start.elapsed().as_millis() as u64,
                    ..StepResult::failure(FailureReason::Spawn {
                        message: format!("{program}: {e}"),
                    })
                };
            }
        };

        let mut output = Output::capture(&mut child);
        let deadline = start.checked_add(timeout);
        let mut exited = None;
        let stop = loop {
            if exited.is_none() {
                match child.try_wait() {
                    Ok(status) => exited = status,
                    Err(e) => {
                        terminate(&mut child, &mut output, self.grace_period);
                        break Stop::Lost(format!("failed to poll {program}: {e}"));
                    }
                }
            }
            // Helpers that inherited the pipes keep them open after the child exits.
            if let Some(status) = exited
                && output.poll()
            {
                break Stop::Exited(status);
            }
            if self.cancel.is_cancelled() {
                terminate(&mut child, &mut output, self.grace_period);
                break Stop::Cancelled;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                terminate(&mut child, &mut output, self.grace_period);
                break Stop::TimedOut;
            }
            thread::sleep(POLL_INTERVAL);
        };

        let (stdout, mut stderr) = output.finish(DRAIN_WAIT);

        let (outcome, exit_code) = match stop {
            Stop::Exited(status) if status.success() => (None, status.code()),
            Stop::Exited(status) => {
                let code = status.code().unwrap_or(-1);
                (Some(FailureReason::NonZeroExit { code }), Some(code))
            }
            Stop::TimedOut => {
                stderr.push_str(&format!(
                    "\ncommand timed out after {}",
                    humantime::format_duration(timeout)
                ));
                (Some(FailureReason::timeout(timeout)), None)
            }
            Stop::Cancelled => (Some(FailureReason::Cancelled), None),
            Stop::Lost(message) => (Some(FailureReason::Spawn { message }), None),
        };

        let base = match outcome {
            None => StepResult::success(),
            Some(reason) => StepResult::failure(reason),
        };
        StepResult {
            stdout,
            stderr,
            exit_code,
            duration_ms: start.elapsed().as_millis() as u64,
            ..base
        }
    }
}

/// Child output, read to EOF on one thread per pipe.
struct Output {
    stdout_rx: mpsc::Receiver<String>,
    stderr_rx: mpsc::Receiver<String>,
    stdout: Option<String>,
    stderr: Option<String>,
}

impl Output {
    fn capture(child: &mut Child) -> Self {
        Self {
            stdout_rx: spawn_reader(child.stdout.take()),
            stderr_rx: spawn_reader(child.stderr.take()),
            stdout: None,
            stderr: None,
        }
    }

    /// True once both pipes have closed.
    fn poll(&mut self) -> bool {
        if self.stdout.is_none() {
            self.stdout = self.stdout_rx.try_recv().ok();
        }
        if self.stderr.is_none() {
            self.stderr = self.stderr_rx.try_recv().ok();
        }
        self.stdout.is_some() && self.stderr.is_some()
    }

    /// Whatever was read, waiting at most `wait` per pipe still open.
    fn finish(self, wait: Duration) -> (String, String) {
        let stdout = self
            .stdout
            .or_else(|| self.stdout_rx.recv_timeout(wait).ok())
            .unwrap_or_default();
        let stderr = self
            .stderr
            .or_else(|| self.stderr_rx.recv_timeout(wait).ok())
            .unwrap_or_default();
        (stdout, stderr)
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut bytes = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut bytes);
        }
        let _ = tx.send(String::from_utf8_lossy(&bytes).to_string());
    });
    rx
}

/// Stop the child's process group: SIGTERM, up to `grace` for the child to
/// exit and the pipes to close, then SIGKILL for anything left.
fn terminate(child: &mut Child, output: &mut Output, grace: Duration) {
    if signal_group(child, "TERM") {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            let reaped = matches!(child.try_wait(), Ok(Some(_)));
            if reaped && output.poll() {
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
    signal_group(child, "KILL");
    let _ = child.kill();
    let _ = child.wait();
}

/// Signal every process in the child's group. The group outlives the child
/// while any member is alive, so this also reaches orphaned helpers.
#[cfg(unix)]
fn signal_group(child: &Child, signal: &str) -> bool {
    Command::new("kill")
        .arg(format!("-{signal}"))
        .arg("--")
        .arg(format!("-{}", child.id()))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: &str) -> bool {
    false
}

/// Resolve `program` on `PATH`.
pub fn which(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepOutcome;

    fn runner() -> SystemRunner {
        SystemRunner::new(".", Duration::from_millis(500), CancelToken::new())
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[cfg(unix)]
    #[test]
    fn captures_stdout_and_stderr() {
        let result = runner().run(
            "sh",
            &args(&["-c", "echo out; echo err 1>&2"]),
            Duration::from_secs(10),
        );
        assert!(result.is_success());
        assert_eq!(result.exit_code, Some(0));
        assert_eq!(result.stdout.trim(), "out");
        assert_eq!(result.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_is_reported_not_raised() {
        let result = runner().run("sh", &args(&["-c", "exit 7"]), Duration::from_secs(10));
        assert_eq!(
            result.outcome,
            StepOutcome::Failure(FailureReason::NonZeroExit { code: 7 })
        );
        assert_eq!(result.exit_code, Some(7));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_kills_process_within_grace() {
        let started = Instant::now();
        let result = runner().run("sleep", &args(&["30"]), Duration::from_millis(200));

        assert_eq!(
            result.outcome,
            StepOutcome::Failure(FailureReason::timeout(Duration::from_millis(200)))
        );
        assert!(result.stderr.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn cancel_token_stops_running_process() {
        let cancel = CancelToken::new();
        let runner = SystemRunner::new(".", Duration::from_millis(500), cancel.clone());

        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });

        let started = Instant::now();
        let result = runner.run("sleep", &args(&["30"]), Duration::from_secs(60));
        handle.join().expect("join");

        assert_eq!(result.outcome, StepOutcome::Failure(FailureReason::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn backgrounded_helper_cannot_hold_run_past_timeout() {
        let runner = SystemRunner::new(".", Duration::from_millis(300), CancelToken::new());
        let started = Instant::now();
        let result = runner.run(
            "sh",
            &args(&["-c", "sleep 6 & echo spawned"]),
            Duration::from_millis(500),
        );

        assert_eq!(
            result.outcome,
            StepOutcome::Failure(FailureReason::timeout(Duration::from_millis(500)))
        );
        assert_eq!(result.stdout.trim(), "spawned");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[test]
    fn detached_helper_does_not_delay_success() {
        let started = Instant::now();
        let result = runner().run(
            "sh",
            &args(&["-c", "sleep 3 >/dev/null 2>&1 & echo done"]),
            Duration::from_secs(10),
        );

        assert!(result.is_success());
        assert_eq!(result.stdout.trim(), "done");
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_stops_forked_children() {
        let td = tempfile::tempdir().expect("tempdir");
        let runner = SystemRunner::new(td.path(), Duration::from_millis(300), CancelToken::new());

        let started = Instant::now();
        let result = runner.run(
            "sh",
            &args(&["-c", "(sleep 1; touch finished) & sleep 30 & wait"]),
            Duration::from_millis(300),
        );
        assert_eq!(
            result.outcome,
            StepOutcome::Failure(FailureReason::timeout(Duration::from_millis(300)))
        );
        assert!(started.elapsed() < Duration::from_secs(2));

        thread::sleep(Duration::from_secs(2));
        assert!(!td.path().join("finished").exists());
    }

    #[cfg(unix)]
    #[test]
    fn cancel_stops_forked_children() {
        let td = tempfile::tempdir().expect("tempdir");
        let cancel = CancelToken::new();
        let runner = SystemRunner::new(td.path(), Duration::from_millis(300), cancel.clone());

        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            trigger.cancel();
        });

        let started = Instant::now();
        let result = runner.run(
            "sh",
            &args(&["-c", "(sleep 1; touch finished) & sleep 30 & wait"]),
            Duration::from_secs(60),
        );
        handle.join().expect("join");

        assert_eq!(result.outcome, StepOutcome::Failure(FailureReason::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(2));

        thread::sleep(Duration::from_secs(2));
        assert!(!td.path().join("finished").exists());
    }

    #[cfg(unix)]
    #[test]
    fn helper_ignoring_sigterm_is_killed_after_grace() {
        let td = tempfile::tempdir().expect("tempdir");
        let runner = SystemRunner::new(td.path(), Duration::from_millis(300), CancelToken::new());

        let started = Instant::now();
        let result = runner.run(
            "sh",
            &args(&["-c", "(trap '' TERM; sleep 1; touch finished) & wait"]),
            Duration::from_millis(200),
        );
        assert!(matches!(
            result.outcome,
            StepOutcome::Failure(FailureReason::Timeout { .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(2));

        thread::sleep(Duration::from_secs(2));
        assert!(!td.path().join("finished").exists());
    }

    #[test]
    fn cancelled_token_prevents_spawn() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let runner = SystemRunner::new(".", Duration::from_millis(100), cancel);
        let result = runner.run("definitely-not-run", &[], Duration::from_secs(1));
        assert_eq!(result.outcome, StepOutcome::Failure(FailureReason::Cancelled));
    }

    #[test]
    fn missing_program_is_spawn_failure() {
        let result = runner().run(
            "this-command-does-not-exist-xyz123",
            &[],
            Duration::from_secs(1),
        );
        assert!(matches!(
            result.outcome,
            StepOutcome::Failure(FailureReason::Spawn { .. })
        ));
        assert_eq!(result.exit_code, None);
    }

    #[test]
    fn which_misses_unknown_program() {
        assert!(which("this-command-does-not-exist-xyz123").is_none());
    }
}
