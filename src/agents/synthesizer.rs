use std::sync::Arc;
use std::time::{Duration, Instant};

use super::descriptor::AgentDescriptor;
use super::state::{RunState, RunTermination, Step, StepError, StepStatus};
use crate::error::PipelineError;
use crate::provider::{ContextMessage, ModelProvider};

/// Final bookkeeping step of every run. Not retried; a provider failure
/// degrades to a deterministic rendering of the run state.
pub struct Synthesizer {
    descriptor: Arc<AgentDescriptor>,
    provider: Arc<dyn ModelProvider>,
}

impl Synthesizer {
    pub fn new(descriptor: Arc<AgentDescriptor>, provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            descriptor,
            provider,
        }
    }

    /// Appends the synthesis step to `state` and returns the artifact.
    pub async fn synthesize(
        &self,
        state: &mut RunState,
        timeout: Duration,
        max_prompt_chars: usize,
    ) -> String {
        let started = Instant::now();
        let context = [ContextMessage::user(format!(
            "{}\n\n{}",
            state.render_context(max_prompt_chars),
            render_run_status(state, None)
        ))];

        let reply = tokio::time::timeout(
            timeout,
            self.provider.invoke(&self.descriptor.system_prompt, &context),
        )
        .await;

        let (body, status, error) = match reply {
            Ok(Ok(text)) if !text.trim().is_empty() => (text, StepStatus::Ok, None),
            Ok(Ok(_)) => (
                fallback_body(state),
                StepStatus::Failed,
                Some(StepError {
                    code: "provider_error".to_string(),
                    message: "synthesis reply was empty".to_string(),
                }),
            ),
            Ok(Err(err)) => (
                fallback_body(state),
                StepStatus::Failed,
                Some(StepError::from(&PipelineError::Provider(err))),
            ),
            Err(_) => (
                fallback_body(state),
                StepStatus::TimedOut,
                Some(StepError::from(&PipelineError::StepTimeout {
                    timeout_secs: timeout.as_secs(),
                })),
            ),
        };

        if let Some(err) = &error {
            tracing::warn!(
                run_id = %state.run_id,
                error = err.message.as_str(),
                "synthesis degraded to fallback rendering"
            );
        }

        let note = error
            .as_ref()
            .map(|e| format!("synthesis {}: {}; summary rendered from run state", status.as_str(), e.message));
        let artifact = format!("{}\n\n{}", body.trim(), render_run_status(state, note.as_deref()));

        state.push_step(Step {
            index: 0,
            agent: self.descriptor.name.clone(),
            kind: self.descriptor.kind,
            status,
            output: artifact.clone(),
            tool_invocations: Vec::new(),
            error,
            attempts: 1,
            duration_ms: started.elapsed().as_millis() as u64,
            skip_downstream: None,
            review: None,
        });

        artifact
    }
}

/// Step-by-step outcome table. Built from the run state only, so it cannot
/// disagree with what actually happened.
pub fn render_run_status(state: &RunState, synthesis_note: Option<&str>) -> String {
    let mut out = String::from("## Run status\n\n");

    match (&state.routing.intent, state.routing.fallback) {
        (Some(intent), _) => out.push_str(&format!("- Intent: {intent}\n")),
        (None, true) => out.push_str(&format!(
            "- Intent: unrecognized, default plan used ({})\n",
            state.routing.reason.as_deref().unwrap_or("no reason recorded")
        )),
        (None, false) => out.push_str("- Intent: none\n"),
    }

    let termination = match &state.termination {
        RunTermination::Completed => "completed".to_string(),
        RunTermination::SkippedDownstream { agent, reason } => {
            format!("stopped early by {agent}: {reason}")
        }
        RunTermination::DeadlineExceeded => "run deadline exceeded".to_string(),
        RunTermination::Cancelled => "cancelled".to_string(),
    };
    out.push_str(&format!("- Termination: {termination}\n"));
    for step in state.steps() {
        if let Some(verdict) = step.review {
            out.push_str(&format!("- Review ({}): {}\n", step.agent, verdict.as_str()));
        }
    }
    out.push('\n');

    out.push_str("| # | Agent | Status | Tools | Notes |\n|---|---|---|---|---|\n");
    for step in state.steps() {
        let failed_tools = step.tool_invocations.iter().filter(|i| i.failed()).count();
        let tools = if failed_tools > 0 {
            format!("{} ({} failed)", step.tool_invocations.len(), failed_tools)
        } else {
            step.tool_invocations.len().to_string()
        };
        let notes = step
            .error
            .as_ref()
            .map(|e| format!("{}: {}", e.code, e.message))
            .unwrap_or_default()
            .replace('|', "/");
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            step.index + 1,
            step.agent,
            step.status.as_str(),
            tools,
            notes
        ));
    }

    if !state.not_run.is_empty() {
        out.push_str(&format!("\nNot run: {}\n", state.not_run.join(", ")));
    }
    if let Some(note) = synthesis_note {
        out.push_str(&format!("\nNote: {note}\n"));
    }
    out
}

fn fallback_body(state: &RunState) -> String {
    let mut out = String::from("# Result\n");
    for step in state.steps() {
        out.push_str(&format!("\n### {}", step.agent));
        if step.status == StepStatus::Ok {
            out.push('\n');
            if step.output.trim().is_empty() {
                out.push_str("(no output)\n");
            } else {
                out.push_str(step.output.trim());
                out.push('\n');
            }
        } else {
            out.push_str(&format!(" ({})\n", step.status.as_str()));
            let reason = step
                .error
                .as_ref()
                .map(|e| e.message.as_str())
                .unwrap_or("no reason recorded");
            out.push_str(&format!("No result: {reason}\n"));
            if !step.output.trim().is_empty() {
                out.push_str(&format!("Partial output:\n{}\n", step.output.trim()));
            }
        }
    }
    out
}
