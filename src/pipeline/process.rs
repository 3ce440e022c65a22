//! Subprocess execution with a hard timeout and kill escalation.
//!
//! Every external program (AI CLI, office renderer, OCR script) goes through
//! [`run`]. One call is one await point and yields a tagged
//! [`ProcessOutcome`]; callers map the variant they care about to an
//! [`ExamError`] with [`ProcessOutcome::into_stdout`].
//!
//! ## Termination ladder
//!
//! Children are started in their own process group. When the time budget
//! expires the whole group receives `SIGTERM`; if the leader has not exited
//! after the grace window the group receives `SIGKILL`. Signalling the group
//! rather than the pid matters for CLIs that are themselves wrappers
//! (`node` launching workers, `soffice` launching `soffice.bin`).
//!
//! A child that outlives its budget is reported as
//! [`ProcessOutcome::TimedOut`] no matter how it exits afterwards, including
//! a clean exit 0 from a `SIGTERM` handler.

use crate::error::ExamError;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// How a subprocess settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Exit status 0.
    Completed { stdout: String, stderr: String },
    /// The time budget expired; the process group was terminated.
    TimedOut { after: Duration },
    /// Died from a signal we did not send.
    Killed { signal: i32, stderr: String },
    /// Non-zero exit status.
    Exited {
        code: i32,
        stdout: String,
        stderr: String,
    },
}

impl ProcessOutcome {
    /// Standard output of a successful run, or the matching error kind.
    pub fn into_stdout(self, program: &str) -> Result<String, ExamError> {
        match self {
            ProcessOutcome::Completed { stdout, .. } => Ok(stdout),
            ProcessOutcome::TimedOut { after } => Err(ExamError::SubprocessTimeout {
                program: program.to_string(),
                secs: after.as_secs(),
            }),
            ProcessOutcome::Killed { signal, .. } => Err(ExamError::SubprocessKilled {
                program: program.to_string(),
                signal,
            }),
            ProcessOutcome::Exited { code, stderr, .. } => Err(ExamError::SubprocessFailed {
                program: program.to_string(),
                code,
                stderr: truncate(&stderr, 500),
            }),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessOutcome::Completed { .. })
    }
}

/// Knobs for one [`run`] call.
#[derive(Default)]
pub struct RunOptions<'a> {
    /// Time budget; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Wait between `SIGTERM` and `SIGKILL`.
    pub grace: Duration,
    /// File connected to the child's stdin; `/dev/null` when absent.
    pub stdin_file: Option<PathBuf>,
    /// Invoked for each stderr line as it arrives.
    pub on_stderr_line: Option<&'a (dyn Fn(&str) + Sync)>,
}

/// Spawn `command`, collect its output and classify how it ended.
///
/// Returns `Err` only when the program cannot be started.
pub async fn run(mut command: Command, opts: RunOptions<'_>) -> Result<ProcessOutcome, ExamError> {
    let program = command
        .as_std()
        .get_program()
        .to_string_lossy()
        .into_owned();

    match &opts.stdin_file {
        Some(path) => {
            let file = std::fs::File::open(path).map_err(|e| ExamError::io(path, e))?;
            command.stdin(Stdio::from(file));
        }
        None => {
            command.stdin(Stdio::null());
        }
    }
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn().map_err(|source| ExamError::SpawnFailed {
        program: program.clone(),
        source,
    })?;
    let pid = child.id();
    debug!("Spawned '{}' (pid {:?})", program, pid);

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| ExamError::Internal("child stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExamError::Internal("child stderr not captured".into()))?;
    let on_line = opts.on_stderr_line;

    let stdout_fut = async move {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf).await;
        String::from_utf8_lossy(&buf).into_owned()
    };
    let stderr_fut = async move {
        let mut lines = BufReader::new(stderr).lines();
        let mut all = String::new();
        while let Ok(Some(line)) = lines.next_line().await {
            if let Some(cb) = on_line {
                cb(&line);
            }
            all.push_str(&line);
            all.push('\n');
        }
        all
    };
    let settle = async { tokio::join!(child.wait(), stdout_fut, stderr_fut) };

    let settled = match opts.timeout {
        Some(limit) => tokio::time::timeout(limit, settle).await.ok(),
        None => Some(settle.await),
    };

    match settled {
        Some((status, stdout, stderr)) => {
            let status = status.map_err(|e| ExamError::io(&program, e))?;
            Ok(classify(status, stdout, stderr))
        }
        None => {
            let after = opts.timeout.unwrap_or_default();
            warn!("'{}' exceeded {:?}; terminating process group", program, after);
            terminate(&mut child, pid, opts.grace).await;
            Ok(ProcessOutcome::TimedOut { after })
        }
    }
}

fn classify(status: ExitStatus, stdout: String, stderr: String) -> ProcessOutcome {
    match status.code() {
        Some(0) => ProcessOutcome::Completed { stdout, stderr },
        Some(code) => ProcessOutcome::Exited {
            code,
            stdout,
            stderr,
        },
        None => ProcessOutcome::Killed {
            signal: exit_signal(&status),
            stderr,
        },
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> i32 {
    -1
}

/// `SIGTERM` the group, wait `grace`, then `SIGKILL` the group.
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_group(pid, libc::SIGTERM);
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        let _ = child.start_kill();
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => debug!("Terminated child settled: {:?}", status),
        Err(_) => {
            warn!("Child ignored SIGTERM for {:?}; sending SIGKILL", grace);
            #[cfg(unix)]
            if let Some(pid) = pid {
                signal_group(pid, libc::SIGKILL);
            }
            let _ = child.kill().await;
        }
    }
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: libc::c_int) {
    let pid = pid as libc::pid_t;
    // SAFETY: plain syscalls on a pid we spawned; failures are reported via errno only.
    let rc = unsafe { libc::killpg(pid, signal) };
    if rc != 0 {
        unsafe { libc::kill(pid, signal) };
    }
}

/// Clip `s` to at most `max` characters, marking the cut.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    let trimmed = s.trim();
    match trimmed.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Instant;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn opts(timeout_ms: u64, grace_ms: u64) -> RunOptions<'static> {
        RunOptions {
            timeout: Some(Duration::from_millis(timeout_ms)),
            grace: Duration::from_millis(grace_ms),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn completed_captures_stdout() {
        let out = run(sh("echo hello"), opts(5_000, 500)).await.unwrap();
        assert_eq!(out.clone().into_stdout("sh").unwrap(), "hello\n");
        assert!(out.is_success());
    }

    #[tokio::test]
    async fn nonzero_exit_is_exited() {
        let out = run(sh("echo oops >&2; exit 3"), opts(5_000, 500))
            .await
            .unwrap();
        match &out {
            ProcessOutcome::Exited { code, stderr, .. } => {
                assert_eq!(*code, 3);
                assert!(stderr.contains("oops"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(matches!(
            out.into_stdout("sh"),
            Err(ExamError::SubprocessFailed { code: 3, .. })
        ));
    }

    #[tokio::test]
    async fn self_signal_is_killed() {
        let out = run(sh("kill -9 $$"), opts(5_000, 500)).await.unwrap();
        assert!(
            matches!(out, ProcessOutcome::Killed { signal: 9, .. }),
            "got {out:?}"
        );
        assert!(matches!(
            out.into_stdout("sh"),
            Err(ExamError::SubprocessKilled { signal: 9, .. })
        ));
    }

    #[tokio::test]
    async fn slow_process_times_out() {
        let start = Instant::now();
        let out = run(sh("sleep 30"), opts(200, 2_000)).await.unwrap();
        assert!(matches!(out, ProcessOutcome::TimedOut { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert!(matches!(
            out.into_stdout("sleep"),
            Err(ExamError::SubprocessTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn clean_exit_after_sigterm_is_still_timeout() {
        let out = run(
            sh("trap 'exit 0' TERM; sleep 30 & wait"),
            opts(300, 2_000),
        )
        .await
        .unwrap();
        assert!(
            matches!(out, ProcessOutcome::TimedOut { .. }),
            "got {out:?}"
        );
    }

    #[tokio::test]
    async fn ignored_sigterm_escalates_to_sigkill() {
        let start = Instant::now();
        let out = run(sh("trap '' TERM; sleep 30"), opts(200, 300))
            .await
            .unwrap();
        assert!(matches!(out, ProcessOutcome::TimedOut { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn stdin_comes_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let prompt = dir.path().join("prompt.txt");
        std::fs::write(&prompt, "xin chào\n").unwrap();

        let out = run(
            Command::new("cat"),
            RunOptions {
                timeout: Some(Duration::from_secs(5)),
                stdin_file: Some(prompt),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(out.into_stdout("cat").unwrap(), "xin chào\n");
    }

    #[tokio::test]
    async fn stderr_lines_are_streamed() {
        let seen = Mutex::new(Vec::new());
        let record = |line: &str| seen.lock().unwrap().push(line.to_string());
        let out = run(
            sh("echo 'Processing 1/2: a.png' >&2; echo 'Processing 2/2: b.png' >&2; echo '{}'"),
            RunOptions {
                timeout: Some(Duration::from_secs(5)),
                on_stderr_line: Some(&record),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(out.is_success());
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["Processing 1/2: a.png", "Processing 2/2: b.png"]
        );
    }

    #[tokio::test]
    async fn missing_program_is_spawn_failure() {
        let err = run(
            Command::new("/definitely/not/a/program"),
            RunOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ExamError::SpawnFailed { .. }));
    }

    #[test]
    fn truncate_marks_cut() {
        assert_eq!(truncate("abcdef", 3), "abc…");
        assert_eq!(truncate("  ab  ", 3), "ab");
    }
}
