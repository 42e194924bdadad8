//! One-shot command execution.
//!
//! Each request runs the command through the platform shell in its own process
//! group, captures stdout and stderr up to a bound, and kills the whole group
//! if the timeout elapses.

use crate::config::ExecConfig;
use crate::protocol::Envelope;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit code reported when the process gave no normal exit status.
pub const NO_EXIT_CODE: i32 = -1;

/// How long to keep reading pipes after the process itself is gone.
const PIPE_DRAIN: Duration = Duration::from_secs(2);

/// Errors that stop a command from producing an exit status.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("shell command is empty")]
    EmptyShell,

    #[error("failed to spawn command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to wait for command: {0}")]
    Wait(#[source] std::io::Error),
}

/// Result of one command, ready to be sent as `exec_result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecReport {
    pub request_id: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub truncated: bool,
}

impl ExecReport {
    #[must_use]
    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }
}

impl From<ExecReport> for Envelope {
    fn from(report: ExecReport) -> Self {
        Self::ExecResult {
            success: report.success(),
            request_id: report.request_id,
            exit_code: report.exit_code,
            stdout: report.stdout,
            stderr: report.stderr,
            duration_ms: u64::try_from(report.duration.as_millis()).unwrap_or(u64::MAX),
            truncated: report.truncated,
        }
    }
}

/// Bytes read from one pipe.
#[derive(Debug, Default)]
struct Capture {
    data: Vec<u8>,
    truncated: bool,
}

/// What the process left behind.
struct Finished {
    exit_code: i32,
    stdout: Capture,
    stderr: Capture,
}

/// Runs commands through the platform shell.
#[derive(Debug, Clone)]
pub struct ExecRunner {
    config: ExecConfig,
    shell: Vec<String>,
}

impl ExecRunner {
    /// Create a runner using the platform shell.
    #[must_use]
    pub fn new(config: ExecConfig) -> Self {
        Self {
            config,
            shell: default_shell(),
        }
    }

    /// Use a different shell invocation; the command is appended as the last argument.
    #[must_use]
    pub fn with_shell(mut self, shell: Vec<String>) -> Self {
        self.shell = shell;
        self
    }

    /// Effective timeout for a request. Absent, zero, negative or unrepresentable
    /// values fall back to the configured default.
    #[must_use]
    pub fn timeout_for(&self, requested_secs: Option<f64>) -> Duration {
        requested_secs
            .filter(|secs| *secs > 0.0)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .unwrap_or(self.config.default_timeout)
    }

    /// Run a command to completion. Never fails: spawn errors and timeouts are
    /// reported through the exit code.
    pub async fn run(
        &self,
        request_id: String,
        command: &str,
        timeout_secs: Option<f64>,
    ) -> ExecReport {
        let timeout = self.timeout_for(timeout_secs);
        info!(%request_id, %command, ?timeout, "Executing command");

        let started = Instant::now();
        let outcome = self.execute(command, timeout).await;
        let duration = started.elapsed();

        let report = match outcome {
            Ok(finished) => ExecReport {
                request_id,
                exit_code: finished.exit_code,
                stdout: String::from_utf8_lossy(&finished.stdout.data).into_owned(),
                stderr: String::from_utf8_lossy(&finished.stderr.data).into_owned(),
                duration,
                truncated: finished.stdout.truncated || finished.stderr.truncated,
            },
            Err(e) => {
                warn!(%request_id, "Command failed to run: {e}");
                ExecReport {
                    request_id,
                    exit_code: NO_EXIT_CODE,
                    stdout: String::new(),
                    stderr: e.to_string(),
                    duration,
                    truncated: false,
                }
            }
        };

        info!(
            request_id = %report.request_id,
            exit_code = report.exit_code,
            duration_ms = report.duration.as_millis(),
            truncated = report.truncated,
            "Command completed"
        );
        report
    }

    async fn execute(&self, command: &str, timeout: Duration) -> Result<Finished, ExecError> {
        let (program, args) = self.shell.split_first().ok_or(ExecError::EmptyShell)?;

        let mut child = Command::new(program)
            .args(args)
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(ExecError::Spawn)?;

        let limit = self.config.max_output_bytes;
        let stop = CancellationToken::new();
        let stdout = child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(capture(pipe, limit, stop.clone())));
        let stderr = child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(capture(pipe, limit, stop.clone())));

        let exit_code = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => status
                .map_err(ExecError::Wait)?
                .code()
                .unwrap_or(NO_EXIT_CODE),
            Err(_) => {
                warn!(?timeout, "Command timed out, killing process group");
                kill_group(&mut child);
                child.wait().await.map_err(ExecError::Wait)?;
                NO_EXIT_CODE
            }
        };

        // Descendants that escaped the group may still hold the pipes open.
        let drain = async { (collect(stdout).await, collect(stderr).await) };
        let (stdout, stderr) = match tokio::time::timeout(PIPE_DRAIN, drain).await {
            Ok(captured) => captured,
            Err(_) => {
                stop.cancel();
                (Capture::default(), Capture::default())
            }
        };

        Ok(Finished {
            exit_code,
            stdout,
            stderr,
        })
    }
}

#[cfg(unix)]
fn default_shell() -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string()]
}

/// SIGKILL the child's process group, falling back to the child alone.
pub(crate) fn kill_group(child: &mut Child) {
    let group = child.id().and_then(|pid| i32::try_from(pid).ok());
    if let Some(pgid) = group
        && killpg(Pid::from_raw(pgid), Signal::SIGKILL).is_ok()
    {
        return;
    }
    if let Err(e) = child.start_kill() {
        warn!("Failed to kill command: {e}");
    }
}

/// Read a pipe to the end, keeping at most `limit` bytes.
async fn capture<R>(mut pipe: R, limit: usize, stop: CancellationToken) -> Capture
where
    R: AsyncRead + Unpin,
{
    let mut captured = Capture::default();
    let mut chunk = [0u8; 8192];
    loop {
        let n = tokio::select! {
            () = stop.cancelled() => break,
            result = pipe.read(&mut chunk) => match result {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            },
        };
        let room = limit.saturating_sub(captured.data.len());
        if n > room {
            captured.truncated = true;
        }
        captured.data.extend_from_slice(&chunk[..n.min(room)]);
    }
    captured
}

async fn collect(handle: Option<JoinHandle<Capture>>) -> Capture {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Capture::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ExecRunner {
        ExecRunner::new(ExecConfig::default())
    }

    #[test]
    fn test_timeout_defaults() {
        let runner = runner();
        assert_eq!(runner.timeout_for(None), Duration::from_secs(30));
        assert_eq!(runner.timeout_for(Some(0.0)), Duration::from_secs(30));
        assert_eq!(runner.timeout_for(Some(-4.0)), Duration::from_secs(30));
        assert_eq!(runner.timeout_for(Some(f64::NAN)), Duration::from_secs(30));
        assert_eq!(runner.timeout_for(Some(2.5)), Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn test_captures_stdout_and_success() {
        let report = runner().run("r1".into(), "echo hello", None).await;
        assert_eq!(report.request_id, "r1");
        assert_eq!(report.exit_code, 0);
        assert!(report.success());
        assert_eq!(report.stdout, "hello\n");
        assert!(report.stderr.is_empty());
        assert!(!report.truncated);
    }

    #[tokio::test]
    async fn test_reports_exit_code_and_stderr() {
        let report = runner().run("r2".into(), "echo oops >&2; exit 42", None).await;
        assert_eq!(report.exit_code, 42);
        assert!(!report.success());
        assert_eq!(report.stderr, "oops\n");
    }

    #[tokio::test]
    async fn test_timeout_kills_and_reports_sentinel() {
        let report = runner().run("r3".into(), "sleep 10", Some(1.0)).await;
        assert_eq!(report.exit_code, NO_EXIT_CODE);
        assert!(!report.success());
        assert!(report.duration >= Duration::from_secs(1));
        assert!(report.duration < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        // The backgrounded sleep holds stdout open; only a group kill frees it.
        let started = Instant::now();
        let report = runner()
            .run("r4".into(), "sleep 30 & echo started; wait", Some(1.0))
            .await;
        assert_eq!(report.exit_code, NO_EXIT_CODE);
        assert_eq!(report.stdout, "started\n");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let runner = ExecRunner::new(ExecConfig {
            max_output_bytes: 1000,
            ..ExecConfig::default()
        });
        let report = runner.run("r5".into(), "yes | head -n 5000", None).await;
        assert_eq!(report.exit_code, 0);
        assert_eq!(report.stdout.len(), 1000);
        assert!(report.truncated);
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_sentinel() {
        let runner = runner().with_shell(vec!["/nonexistent/shell".into(), "-c".into()]);
        let report = runner.run("r6".into(), "true", None).await;
        assert_eq!(report.exit_code, NO_EXIT_CODE);
        assert!(report.stderr.contains("failed to spawn"));

        let envelope = Envelope::from(report);
        assert!(matches!(
            envelope,
            Envelope::ExecResult { success: false, exit_code: -1, ref request_id, .. } if request_id == "r6"
        ));
    }
}
