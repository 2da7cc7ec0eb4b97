use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::descriptor::AgentKind;
use crate::error::PipelineError;

/// One user request. Immutable for the lifetime of its run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub session_id: String,
    pub input: String,
    pub received_at: DateTime<Utc>,
}

impl Request {
    pub fn new(session_id: impl Into<String>, input: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            input: input.into(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Failed,
    TimedOut,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Ok => "ok",
            StepStatus::Failed => "failed",
            StepStatus::TimedOut => "timed_out",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    /// The process ran to completion. Any exit code counts.
    Completed,
    TimedOut,
    SpawnFailed,
    /// Refused by the command policy. No process was started.
    Denied,
    /// The step ended while the command was still running; its process
    /// group was killed.
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub command: String,
    pub cwd: String,
    pub timeout_secs: u64,
    pub outcome: ToolOutcome,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub read_only: bool,
    pub error: Option<String>,
}

impl ToolInvocation {
    pub fn failed(&self) -> bool {
        matches!(
            self.outcome,
            ToolOutcome::TimedOut | ToolOutcome::SpawnFailed | ToolOutcome::Interrupted
        )
    }

    /// Text fed back to the model after a tool round.
    pub fn render_for_model(&self) -> String {
        let mut out = format!("$ {}\n(cwd: {})\n", self.command, self.cwd);
        match self.outcome {
            ToolOutcome::Completed => {
                out.push_str(&format!(
                    "exit_code: {}\n",
                    self.exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "signal".to_string())
                ));
            }
            ToolOutcome::TimedOut => {
                out.push_str(&format!("TIMED OUT after {}s\n", self.timeout_secs));
            }
            ToolOutcome::Interrupted => {
                out.push_str(&format!("INTERRUPTED after {}ms\n", self.duration_ms));
            }
            ToolOutcome::SpawnFailed | ToolOutcome::Denied => {
                out.push_str(&format!(
                    "NOT RUN: {}\n",
                    self.error.as_deref().unwrap_or("unknown error")
                ));
            }
        }
        if !self.stdout.is_empty() {
            out.push_str("stdout:\n");
            out.push_str(&self.stdout);
            if self.stdout_truncated {
                out.push_str("\n[stdout truncated]");
            }
            out.push('\n');
        }
        if !self.stderr.is_empty() {
            out.push_str("stderr:\n");
            out.push_str(&self.stderr);
            if self.stderr_truncated {
                out.push_str("\n[stderr truncated]");
            }
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approved,
    Rejected,
}

impl ReviewVerdict {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewVerdict::Approved => "approved",
            ReviewVerdict::Rejected => "not approved",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub code: String,
    pub message: String,
}

impl From<&PipelineError> for StepError {
    fn from(err: &PipelineError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub agent: String,
    pub kind: AgentKind,
    pub status: StepStatus,
    pub output: String,
    pub tool_invocations: Vec<ToolInvocation>,
    pub error: Option<StepError>,
    pub attempts: u32,
    pub duration_ms: u64,
    pub skip_downstream: Option<String>,
    /// Set only by review agents that ended with an approval line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewVerdict>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Routing {
    pub intent: Option<String>,
    pub fallback: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunTermination {
    Completed,
    SkippedDownstream { agent: String, reason: String },
    DeadlineExceeded,
    Cancelled,
}

/// Accumulated state of one run. Steps are append-only and keep their
/// append order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub request: Request,
    pub routing: Routing,
    pub plan: Vec<String>,
    steps: Vec<Step>,
    pub not_run: Vec<String>,
    pub termination: RunTermination,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub artifact: Option<String>,
}

impl RunState {
    pub fn new(request: Request) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            request,
            routing: Routing::default(),
            plan: Vec::new(),
            steps: Vec::new(),
            not_run: Vec::new(),
            termination: RunTermination::Completed,
            started_at: Utc::now(),
            finished_at: None,
            artifact: None,
        }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Appends a step, stamping its position. Returns the stored step.
    pub fn push_step(&mut self, mut step: Step) -> &Step {
        step.index = self.steps.len();
        self.steps.push(step);
        &self.steps[self.steps.len() - 1]
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &Step> {
        self.steps.iter().filter(|s| s.status != StepStatus::Ok)
    }

    pub fn finish(&mut self, artifact: String) {
        self.artifact = Some(artifact);
        self.finished_at = Some(Utc::now());
    }

    /// Request plus every prior step, rendered as the user turn an agent sees.
    pub fn render_context(&self, max_chars: usize) -> String {
        let mut out = format!("## Request\n{}\n", self.request.input.trim());
        for step in &self.steps {
            out.push_str(&format!(
                "\n## Step {} ({}) [{}]\n",
                step.index + 1,
                step.agent,
                step.status.as_str()
            ));
            if let Some(err) = &step.error {
                out.push_str(&format!("error: {} ({})\n", err.message, err.code));
            }
            if let Some(verdict) = step.review {
                out.push_str(&format!("review verdict: {}\n", verdict.as_str()));
            }
            for invocation in &step.tool_invocations {
                out.push_str(&invocation.render_for_model());
            }
            if !step.output.trim().is_empty() {
                out.push_str(step.output.trim());
                out.push('\n');
            }
        }

        // Keep the request and the most recent context when trimming.
        let total = out.chars().count();
        if total <= max_chars {
            return out;
        }
        let head = format!("## Request\n{}\n\n[earlier steps trimmed]\n", self.request.input.trim());
        let budget = max_chars.saturating_sub(head.chars().count());
        let tail = out.chars().skip(total.saturating_sub(budget)).collect::<String>();
        format!("{head}{tail}")
    }
}
