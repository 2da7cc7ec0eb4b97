use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::descriptor::{AgentDescriptor, AgentKind, ToolFailurePolicy};
use super::pipeline::ProgressEvent;
use super::state::{ReviewVerdict, RunState, ToolInvocation, ToolOutcome};
use crate::error::PipelineError;
use crate::provider::{ContextMessage, ModelProvider};
use crate::tools::{Capability, InvocationRecorder, ToolRequest};

pub const SKIP_DOWNSTREAM_MARKER: &str = "SKIP_DOWNSTREAM";
pub const APPROVAL_MARKER: &str = "APPROVED";

/// Everything the driver hands an agent for one step.
pub struct StepContext {
    pub run_id: Uuid,
    pub step_index: usize,
    /// Present only for descriptors with the executor flag.
    pub capability: Option<Arc<Capability>>,
    pub recorder: InvocationRecorder,
    pub cancel: CancellationToken,
    pub max_tool_rounds: u32,
    pub max_commands_per_round: usize,
    pub max_prompt_chars: usize,
    pub progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutput {
    pub text: String,
    pub skip_downstream: Option<String>,
    /// First failed invocation when the agent kept going past it.
    pub tool_failure: Option<PipelineError>,
    pub tool_rounds: u32,
    pub review: Option<ReviewVerdict>,
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn descriptor(&self) -> &AgentDescriptor;

    async fn run(&self, state: &RunState, ctx: &StepContext) -> Result<AgentOutput, PipelineError>;
}

/// The one agent implementation. Variants differ only by descriptor.
pub struct ModelAgent {
    descriptor: Arc<AgentDescriptor>,
    provider: Arc<dyn ModelProvider>,
}

impl ModelAgent {
    pub fn new(descriptor: Arc<AgentDescriptor>, provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            descriptor,
            provider,
        }
    }

    fn finish(&self, reply: String, tool_failure: Option<PipelineError>, tool_rounds: u32) -> AgentOutput {
        let (text, skip_downstream) = split_skip_marker(&reply);
        let review = if self.descriptor.kind == AgentKind::Review {
            parse_review_verdict(&text)
        } else {
            None
        };
        AgentOutput {
            text,
            skip_downstream,
            tool_failure,
            tool_rounds,
            review,
        }
    }

    fn system_prompt(&self, ctx: &StepContext, tools_enabled: bool) -> String {
        if !tools_enabled {
            return self.descriptor.system_prompt.clone();
        }
        format!(
            "{}\n\nLimits: at most {} commands per reply and {} tool rounds.",
            self.descriptor.system_prompt, ctx.max_commands_per_round, ctx.max_tool_rounds
        )
    }
}

#[async_trait]
impl Agent for ModelAgent {
    fn descriptor(&self) -> &AgentDescriptor {
        &self.descriptor
    }

    async fn run(&self, state: &RunState, ctx: &StepContext) -> Result<AgentOutput, PipelineError> {
        let capability = if self.descriptor.executor {
            ctx.capability.clone()
        } else {
            None
        };
        let system_prompt = self.system_prompt(ctx, capability.is_some());
        let mut messages = vec![ContextMessage::user(state.render_context(ctx.max_prompt_chars))];
        let mut rounds = 0u32;
        let mut tool_failure: Option<PipelineError> = None;

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let reply = self.provider.invoke(&system_prompt, &messages).await?;

            let Some(capability) = capability.as_ref() else {
                return Ok(self.finish(reply, tool_failure, rounds));
            };
            let requests = parse_tool_requests(&reply);
            if requests.is_empty() {
                return Ok(self.finish(reply, tool_failure, rounds));
            }
            if rounds >= ctx.max_tool_rounds {
                return Err(PipelineError::ToolRoundsExceeded {
                    max_rounds: ctx.max_tool_rounds,
                });
            }
            rounds += 1;

            let dropped = requests.len().saturating_sub(ctx.max_commands_per_round);
            let mut results = Vec::new();
            for request in requests.into_iter().take(ctx.max_commands_per_round) {
                let pending = ctx.recorder.begin(capability.interrupted_record(&request));
                let invocation = capability.invoke(&request).await;
                let failure = invocation_failure(&invocation);
                results.push(invocation.render_for_model());
                if let Some(tx) = &ctx.progress {
                    let _ = tx.send(ProgressEvent::ToolFinished {
                        run_id: ctx.run_id,
                        step: ctx.step_index,
                        agent: self.descriptor.name.clone(),
                        invocation: invocation.clone(),
                    });
                }
                pending.complete(invocation);

                if let Some(err) = failure {
                    tracing::warn!(
                        agent = self.descriptor.name.as_str(),
                        error = %err,
                        "tool invocation failed"
                    );
                    if self.descriptor.tool_failure == ToolFailurePolicy::Abort {
                        return Err(err);
                    }
                    tool_failure.get_or_insert(err);
                }
            }

            let mut feedback = format!("Tool results (round {rounds} of {}):\n\n", ctx.max_tool_rounds);
            feedback.push_str(&results.join("\n"));
            if dropped > 0 {
                feedback.push_str(&format!(
                    "\n{dropped} additional command(s) were ignored; the limit is {} per reply.\n",
                    ctx.max_commands_per_round
                ));
            }
            messages.push(ContextMessage::assistant(reply));
            messages.push(ContextMessage::user(feedback));
        }
    }
}


fn invocation_failure(invocation: &ToolInvocation) -> Option<PipelineError> {
    match invocation.outcome {
        ToolOutcome::TimedOut | ToolOutcome::Interrupted => Some(PipelineError::ToolTimeout {
            timeout_secs: invocation.timeout_secs,
        }),
        ToolOutcome::SpawnFailed => Some(PipelineError::ToolSpawnFailure(
            invocation.error.clone().unwrap_or_default(),
        )),
        ToolOutcome::Completed | ToolOutcome::Denied => None,
    }
}

#[derive(Debug, Deserialize)]
struct ToolRequestEnvelope {
    commands: Vec<ToolRequest>,
}

/// Extracts `{"commands":[...]}` from a model reply. Fenced ```json blocks
/// are tried first, then the outermost brace span of the reply.
pub fn parse_tool_requests(text: &str) -> Vec<ToolRequest> {
    let mut candidates = fenced_blocks(text);
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}'))
        && start < end
    {
        candidates.push(&text[start..=end]);
    }

    for candidate in candidates {
        if let Ok(envelope) = serde_json::from_str::<ToolRequestEnvelope>(candidate.trim()) {
            let commands = envelope
                .commands
                .into_iter()
                .filter(|c| !c.command.trim().is_empty())
                .collect::<Vec<_>>();
            if !commands.is_empty() {
                return commands;
            }
        }
    }
    Vec::new()
}

fn fenced_blocks(text: &str) -> Vec<&str> {
    let mut blocks = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find("```") {
        let after = &rest[open + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(after.len());
        let body = &after[body_start..];
        let Some(close) = body.find("```") else {
            break;
        };
        blocks.push(&body[..close]);
        rest = &body[close + 3..];
    }
    blocks
}

/// Splits a `SKIP_DOWNSTREAM[: reason]` line out of an agent reply.
pub fn split_skip_marker(reply: &str) -> (String, Option<String>) {
    let mut reason = None;
    let mut kept = Vec::new();
    for line in reply.lines() {
        let trimmed = line.trim().trim_start_matches('`');
        if reason.is_none()
            && let Some(rest) = trimmed.strip_prefix(SKIP_DOWNSTREAM_MARKER)
        {
            let rest = rest.trim().trim_end_matches('`').trim_start_matches(':').trim();
            reason = Some(if rest.is_empty() {
                "no reason given".to_string()
            } else {
                rest.to_string()
            });
            continue;
        }
        kept.push(line);
    }
    (kept.join("\n").trim().to_string(), reason)
}

/// Reads the last `APPROVED: yes|no` line of a review. A JSON
/// `"approved": true|false` field is accepted when no such line exists.
pub fn parse_review_verdict(text: &str) -> Option<ReviewVerdict> {
    let from_line = text.lines().rev().find_map(|line| {
        let trimmed = line.trim().trim_matches(|c: char| c == '*' || c == '`').trim();
        let (label, value) = trimmed.split_once(':')?;
        if !label.trim().eq_ignore_ascii_case(APPROVAL_MARKER) {
            return None;
        }
        verdict_from_word(value)
    });
    if from_line.is_some() {
        return from_line;
    }

    let (_, rest) = text.split_once("\"approved\"")?;
    let value = rest.trim_start().strip_prefix(':')?;
    verdict_from_word(value)
}

fn verdict_from_word(value: &str) -> Option<ReviewVerdict> {
    let word = value
        .trim()
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    match word.as_str() {
        "yes" | "true" | "approved" => Some(ReviewVerdict::Approved),
        "no" | "false" | "rejected" => Some(ReviewVerdict::Rejected),
        _ => None,
    }
}
