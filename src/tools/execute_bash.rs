use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

// `cd` runs inside the shell so a missing directory shows up as stderr and a
// non-zero exit instead of a spawn error.
const SHELL_WRAPPER: &str = "cd -- \"$1\" || exit 125\neval \"$2\"";

/// Bytes kept per stream; the rest is read and discarded.
const MAX_CAPTURE_BYTES: usize = 4 * 1024 * 1024;
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: String,
    pub cwd: PathBuf,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecError {
    #[error("command timed out after {}s", .timeout.as_secs())]
    Timeout { timeout: Duration, elapsed: Duration },
    #[error("failed to spawn shell: {0}")]
    Spawn(String),
}

/// Runs one command. Implementations never retry.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, request: &ExecRequest) -> Result<ExecOutput, ExecError>;
}

/// Executes commands with `sh` in a fresh process group. The whole group is
/// killed once the call returns, whether it finished, timed out or was
/// dropped mid-flight.
#[derive(Debug, Default, Clone)]
pub struct ShellExecutor;

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(&self, request: &ExecRequest) -> Result<ExecOutput, ExecError> {
        let mut command = tokio::process::Command::new("sh");
        command
            .arg("-c")
            .arg(SHELL_WRAPPER)
            .arg("baton-exec")
            .arg(&request.cwd)
            .arg(&request.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let started = Instant::now();
        let mut child = command
            .spawn()
            .map_err(|err| ExecError::Spawn(err.to_string()))?;
        let group = ProcessGroupGuard { pgid: child.id() };
        let stdout = tokio::spawn(read_capped(child.stdout.take()));
        let stderr = tokio::spawn(read_capped(child.stderr.take()));

        // Completion is the shell exiting, not pipe EOF: a backgrounded child
        // can hold the pipes open long after the command itself is done.
        let status = match tokio::time::timeout(request.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => return Err(ExecError::Spawn(err.to_string())),
            Err(_) => {
                tracing::debug!(
                    command = request.command.as_str(),
                    timeout_secs = request.timeout.as_secs(),
                    "command timed out; killing process group"
                );
                stdout.abort();
                stderr.abort();
                return Err(ExecError::Timeout {
                    timeout: request.timeout,
                    elapsed: started.elapsed(),
                });
            }
        };
        let duration = started.elapsed();

        // Leftover descendants are killed, which closes their ends of the pipes.
        drop(group);
        Ok(ExecOutput {
            stdout: drain(stdout).await,
            stderr: drain(stderr).await,
            exit_code: status.code(),
            duration,
        })
    }
}

async fn read_capped<R>(pipe: Option<R>) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut captured = Vec::new();
    let Some(mut pipe) = pipe else {
        return captured;
    };
    let mut buf = [0u8; 8192];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = MAX_CAPTURE_BYTES.saturating_sub(captured.len());
                captured.extend_from_slice(&buf[..n.min(room)]);
            }
        }
    }
    captured
}

async fn drain(mut reader: JoinHandle<Vec<u8>>) -> String {
    match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut reader).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(err)) => {
            tracing::debug!(error = %err, "pipe reader task failed");
            String::new()
        }
        Err(_) => {
            tracing::debug!("pipe still open after the shell exited; output dropped");
            reader.abort();
            String::new()
        }
    }
}

struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            // `kill` is a blocking spawn; keep it off the async workers.
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn_blocking(move || kill_process_group(pgid));
                }
                Err(_) => kill_process_group(pgid),
            }
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    // The group usually has exited already; a failed kill is expected then.
    let _ = std::process::Command::new("kill")
        .arg("-KILL")
        .arg("--")
        .arg(format!("-{pgid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

/// Deterministic executor for offline runs and tests. Commands matching a
/// registered prefix return the canned stdout; anything else is echoed back.
#[derive(Debug, Default, Clone)]
pub struct EchoExecutor {
    responses: Vec<(String, String)>,
}

impl EchoExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(mut self, prefix: impl Into<String>, stdout: impl Into<String>) -> Self {
        self.responses.push((prefix.into(), stdout.into()));
        self
    }
}

#[async_trait]
impl CommandExecutor for EchoExecutor {
    async fn execute(&self, request: &ExecRequest) -> Result<ExecOutput, ExecError> {
        let trimmed = request.command.trim();
        let stdout = self
            .responses
            .iter()
            .find(|(prefix, _)| trimmed.starts_with(prefix.as_str()))
            .map(|(_, stdout)| stdout.clone())
            .unwrap_or_else(|| format!("{trimmed}\n"));
        Ok(ExecOutput {
            stdout,
            stderr: String::new(),
            exit_code: Some(0),
            duration: Duration::ZERO,
        })
    }
}

pub fn truncate_text(text: &str, max_chars: usize) -> (String, bool) {
    let mut iter = text.chars();
    let truncated = iter.by_ref().take(max_chars).collect::<String>();
    if iter.next().is_some() {
        (truncated, true)
    } else {
        (text.to_string(), false)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn request(command: &str, timeout_secs: u64) -> ExecRequest {
        ExecRequest {
            command: command.to_string(),
            cwd: std::env::temp_dir(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    #[tokio::test]
    async fn captures_stdout_stderr_and_exit_code() {
        let out = ShellExecutor
            .execute(&request("echo hello; echo oops >&2; exit 3", 5))
            .await
            .expect("command should run");
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.stderr.trim(), "oops");
        assert_eq!(out.exit_code, Some(3));
    }

    #[tokio::test]
    async fn missing_workdir_is_reported_as_exit_status() {
        let mut req = request("pwd", 5);
        req.cwd = PathBuf::from("/definitely/not/a/real/dir");
        let out = ShellExecutor.execute(&req).await.expect("shell spawns");
        assert_eq!(out.exit_code, Some(125));
        assert!(!out.stderr.is_empty());
    }

    #[tokio::test]
    async fn timeout_kills_background_descendants() {
        let marker = tempfile::tempdir().expect("tempdir");
        let flag = marker.path().join("survived");
        let command = format!("(sleep 2; touch '{}') & sleep 5", flag.display());

        let started = Instant::now();
        let err = ShellExecutor
            .execute(&request(&command, 1))
            .await
            .expect_err("should time out");
        assert!(matches!(err, ExecError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_millis(1900));

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!flag.exists(), "background child outlived the timeout");
    }

    #[tokio::test]
    async fn backgrounded_child_does_not_hold_the_call_open() {
        let started = Instant::now();
        let out = ShellExecutor
            .execute(&request("sleep 60 & echo started", 5))
            .await
            .expect("shell exits before the timeout");
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout.trim(), "started");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn truncate_text_flags_overflow() {
        assert_eq!(truncate_text("abcdef", 3), ("abc".to_string(), true));
        assert_eq!(truncate_text("abc", 3), ("abc".to_string(), false));
    }
}
