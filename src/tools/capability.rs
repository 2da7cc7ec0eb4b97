use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::Semaphore;

use super::execute_bash::{CommandExecutor, ExecError, ExecRequest, truncate_text};
use crate::agents::state::{ToolInvocation, ToolOutcome};
use crate::config::RuntimeConfig;
use crate::error::PipelineError;
use crate::tool_policy::CommandPolicy;

pub const MAX_TOOL_TIMEOUT_SECS: u64 = 600;

/// A command an agent asked for, as parsed from model output.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToolRequest {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Policy-checked front of the executor. Shared by every run of the process,
/// so the semaphore bounds tool calls globally.
pub struct Capability {
    executor: Arc<dyn CommandExecutor>,
    policy: CommandPolicy,
    permits: Arc<Semaphore>,
    default_timeout_secs: u64,
    max_output_chars: usize,
    base_dir: PathBuf,
}

impl Capability {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        policy: CommandPolicy,
        max_concurrent: usize,
        default_timeout_secs: u64,
        max_output_chars: usize,
        base_dir: PathBuf,
    ) -> Self {
        Self {
            executor,
            policy,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            default_timeout_secs: default_timeout_secs.max(1),
            max_output_chars,
            base_dir,
        }
    }

    pub fn from_config(cfg: &RuntimeConfig, executor: Arc<dyn CommandExecutor>) -> Result<Self> {
        let base_dir = match &cfg.workdir {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir().context("failed to resolve current directory")?,
        };
        Ok(Self::new(
            executor,
            CommandPolicy::from_config(cfg),
            cfg.max_concurrent_tools,
            cfg.tool_timeout_secs,
            cfg.max_output_chars,
            base_dir,
        ))
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    fn resolve_cwd(&self, cwd: Option<&str>) -> Result<PathBuf, String> {
        let Some(raw) = cwd else {
            return Ok(self.base_dir.clone());
        };
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(self.base_dir.clone());
        }
        if raw.contains('\0') {
            return Err("working directory contains a NUL byte".to_string());
        }
        let path = Path::new(raw);
        if path.is_absolute() {
            Ok(path.to_path_buf())
        } else {
            Ok(self.base_dir.join(path))
        }
    }

    fn timeout_secs(&self, request: &ToolRequest) -> u64 {
        request
            .timeout_secs
            .filter(|t| *t > 0)
            .unwrap_or(self.default_timeout_secs)
            .min(MAX_TOOL_TIMEOUT_SECS)
    }

    fn blank_invocation(&self, request: &ToolRequest, outcome: ToolOutcome) -> ToolInvocation {
        ToolInvocation {
            command: request.command.trim().to_string(),
            cwd: request.cwd.clone().unwrap_or_default(),
            timeout_secs: self.timeout_secs(request),
            outcome,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: None,
            duration_ms: 0,
            read_only: false,
            error: None,
        }
    }

    /// The record written for `request` if the step ends before `invoke`
    /// returns.
    pub fn interrupted_record(&self, request: &ToolRequest) -> ToolInvocation {
        let mut invocation = self.blank_invocation(request, ToolOutcome::Interrupted);
        if let Ok(cwd) = self.resolve_cwd(request.cwd.as_deref()) {
            invocation.cwd = cwd.display().to_string();
        }
        invocation.error = Some("step ended before the command finished".to_string());
        invocation
    }

    /// Runs one request through policy and executor. Never fails: every
    /// outcome, including refusal, comes back as an invocation record.
    pub async fn invoke(&self, request: &ToolRequest) -> ToolInvocation {
        let mut invocation = self.blank_invocation(request, ToolOutcome::Denied);
        let timeout_secs = invocation.timeout_secs;
        let command = invocation.command.clone();

        let cwd = match self.resolve_cwd(request.cwd.as_deref()) {
            Ok(cwd) => cwd,
            Err(err) => {
                invocation.outcome = ToolOutcome::SpawnFailed;
                invocation.error = Some(err);
                return invocation;
            }
        };
        invocation.cwd = cwd.display().to_string();

        let verdict = match self.policy.check(&command, &cwd) {
            Ok(verdict) => verdict,
            Err(reason) => {
                tracing::info!(command = command.as_str(), reason = reason.as_str(), "command denied");
                invocation.error = Some(PipelineError::PolicyDenied(reason).to_string());
                return invocation;
            }
        };
        invocation.read_only = verdict.read_only;

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                invocation.outcome = ToolOutcome::SpawnFailed;
                invocation.error = Some("executor is shutting down".to_string());
                return invocation;
            }
        };

        let exec = ExecRequest {
            command: command.clone(),
            cwd,
            timeout: Duration::from_secs(timeout_secs),
        };
        match self.executor.execute(&exec).await {
            Ok(output) => {
                let (stdout, stdout_truncated) = truncate_text(&output.stdout, self.max_output_chars);
                let (stderr, stderr_truncated) = truncate_text(&output.stderr, self.max_output_chars);
                invocation.outcome = ToolOutcome::Completed;
                invocation.stdout = stdout;
                invocation.stderr = stderr;
                invocation.stdout_truncated = stdout_truncated;
                invocation.stderr_truncated = stderr_truncated;
                invocation.exit_code = output.exit_code;
                invocation.duration_ms = output.duration.as_millis() as u64;
            }
            Err(ExecError::Timeout { elapsed, .. }) => {
                invocation.outcome = ToolOutcome::TimedOut;
                invocation.duration_ms = elapsed.as_millis() as u64;
                invocation.error = Some(format!("command timed out after {timeout_secs}s"));
            }
            Err(ExecError::Spawn(err)) => {
                invocation.outcome = ToolOutcome::SpawnFailed;
                invocation.error = Some(err);
            }
        }

        tracing::info!(
            command = invocation.command.as_str(),
            outcome = ?invocation.outcome,
            exit_code = ?invocation.exit_code,
            duration_ms = invocation.duration_ms,
            "command finished"
        );
        invocation
    }
}

/// Collects invocations for one step. Lives outside the agent future so the
/// record survives a step timeout that drops that future.
#[derive(Debug, Clone, Default)]
pub struct InvocationRecorder {
    inner: Arc<Mutex<Vec<ToolInvocation>>>,
}

impl InvocationRecorder {
    pub fn record(&self, invocation: ToolInvocation) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(invocation);
    }

    /// Starts tracking an in-flight invocation. Unless completed, the guard
    /// records `interrupted` when it is dropped.
    pub fn begin(&self, interrupted: ToolInvocation) -> PendingInvocation {
        PendingInvocation {
            recorder: self.clone(),
            interrupted: Some(interrupted),
            started: Instant::now(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn take(&self) -> Vec<ToolInvocation> {
        std::mem::take(&mut *self.inner.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

pub struct PendingInvocation {
    recorder: InvocationRecorder,
    interrupted: Option<ToolInvocation>,
    started: Instant,
}

impl PendingInvocation {
    pub fn complete(mut self, invocation: ToolInvocation) {
        self.interrupted = None;
        self.recorder.record(invocation);
    }
}

impl Drop for PendingInvocation {
    fn drop(&mut self) {
        if let Some(mut invocation) = self.interrupted.take() {
            invocation.duration_ms = self.started.elapsed().as_millis() as u64;
            tracing::warn!(
                command = invocation.command.as_str(),
                duration_ms = invocation.duration_ms,
                "command interrupted by end of step"
            );
            self.recorder.record(invocation);
        }
    }
}
