use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::agent::{Agent, AgentOutput, ModelAgent, StepContext};
use super::descriptor::{AgentDescriptor, DescriptorTable};
use super::router::{PipelinePlan, Router};
use super::state::{
    Request, RunState, RunTermination, Step, StepError, StepStatus, ToolInvocation, ToolOutcome,
};
use super::synthesizer::Synthesizer;
use crate::config::RuntimeConfig;
use crate::error::PipelineError;
use crate::provider::ProviderRegistry;
use crate::session::{RunStore, build_run_store};
use crate::telemetry::TelemetrySink;
use crate::tools::{Capability, InvocationRecorder, ShellExecutor};

pub const ROUTER_AGENT: &str = "router";

/// Lower bound on the synthesizer's budget once the run deadline is spent.
const SYNTHESIS_GRACE_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        run_id: Uuid,
        session_id: String,
    },
    PlanResolved {
        run_id: Uuid,
        intent: Option<String>,
        fallback: bool,
        agents: Vec<String>,
    },
    StepStarted {
        run_id: Uuid,
        step: usize,
        agent: String,
    },
    ToolFinished {
        run_id: Uuid,
        step: usize,
        agent: String,
        invocation: ToolInvocation,
    },
    StepFinished {
        run_id: Uuid,
        step: usize,
        agent: String,
        status: StepStatus,
        duration_ms: u64,
    },
    RunFinished {
        run_id: Uuid,
        termination: RunTermination,
        steps: usize,
    },
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: RunState,
    pub artifact: String,
}

pub struct Pipeline {
    config: Arc<RuntimeConfig>,
    table: Arc<DescriptorTable>,
    router: Router,
    providers: ProviderRegistry,
    capability: Arc<Capability>,
    store: Arc<dyn RunStore>,
    telemetry: Option<TelemetrySink>,
}

impl Pipeline {
    pub fn new(
        config: Arc<RuntimeConfig>,
        table: Arc<DescriptorTable>,
        providers: ProviderRegistry,
        capability: Arc<Capability>,
        store: Arc<dyn RunStore>,
    ) -> Result<Self> {
        let router = Router::new(providers.for_agent(ROUTER_AGENT), &table, &config.plans)?;
        Ok(Self {
            config,
            table,
            router,
            providers,
            capability,
            store,
            telemetry: None,
        })
    }

    pub async fn from_config(config: Arc<RuntimeConfig>, command: &str) -> Result<Self> {
        let table = Arc::new(DescriptorTable::from_config(&config.agents)?);
        let providers = ProviderRegistry::from_config(&config, &table)?;
        let capability = Arc::new(Capability::from_config(&config, Arc::new(ShellExecutor))?);
        let store = build_run_store(&config).await?;
        let telemetry = TelemetrySink::new(&config, command.to_string());
        Ok(Self::new(config, table, providers, capability, store)?.with_telemetry(telemetry))
    }

    pub fn with_telemetry(mut self, sink: TelemetrySink) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn table(&self) -> &DescriptorTable {
        &self.table
    }

    pub fn store(&self) -> Arc<dyn RunStore> {
        self.store.clone()
    }

    fn emit_telemetry(&self, event: &str, payload: serde_json::Value) {
        if let Some(sink) = &self.telemetry {
            sink.emit(event, payload);
        }
    }

    /// Runs one request to completion. Never fails: routing problems, step
    /// failures, the deadline and cancellation all end up in the returned
    /// run state, and an artifact is always produced.
    pub async fn submit(
        &self,
        request: Request,
        cancel: CancellationToken,
        progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) -> RunOutcome {
        let emit = |event: ProgressEvent| {
            if let Some(tx) = &progress {
                let _ = tx.send(event);
            }
        };

        let deadline_secs = self.config.run_deadline_secs;
        let deadline = Instant::now() + Duration::from_secs(deadline_secs);
        let step_timeout = Duration::from_secs(self.config.step_timeout_secs);
        let mut state = RunState::new(request);
        let run_id = state.run_id;

        tracing::info!(run_id = %run_id, session_id = state.request.session_id.as_str(), "run started");
        emit(ProgressEvent::RunStarted {
            run_id,
            session_id: state.request.session_id.clone(),
        });
        self.emit_telemetry(
            "run.started",
            json!({ "run_id": run_id.to_string(), "session_id": state.request.session_id }),
        );

        let route_timeout = step_timeout.min(deadline.saturating_duration_since(Instant::now()));
        let plan: PipelinePlan = self.router.route(&state.request, route_timeout).await;
        state.routing = plan.routing.clone();
        state.plan = plan.names();
        tracing::info!(
            run_id = %run_id,
            intent = ?state.routing.intent,
            fallback = state.routing.fallback,
            plan = ?state.plan,
            "plan resolved"
        );
        emit(ProgressEvent::PlanResolved {
            run_id,
            intent: state.routing.intent.clone(),
            fallback: state.routing.fallback,
            agents: state.plan.clone(),
        });

        for (position, descriptor) in plan.agents.iter().enumerate() {
            let remaining_names = || {
                plan.agents[position..]
                    .iter()
                    .map(|d| d.name.clone())
                    .collect::<Vec<_>>()
            };

            if cancel.is_cancelled() {
                state.termination = RunTermination::Cancelled;
                state.not_run = remaining_names();
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                state.termination = RunTermination::DeadlineExceeded;
                state.not_run = remaining_names();
                break;
            }

            let agent_timeout = descriptor
                .timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(step_timeout);
            let capped_by_deadline = remaining < agent_timeout;
            let timeout = agent_timeout.min(remaining);

            let index = state.steps().len();
            emit(ProgressEvent::StepStarted {
                run_id,
                step: index,
                agent: descriptor.name.clone(),
            });

            let step = self
                .run_step(
                    descriptor,
                    &state,
                    index,
                    timeout,
                    capped_by_deadline,
                    deadline_secs,
                    &cancel,
                    progress.clone(),
                )
                .await;
            let step = state.push_step(step);

            tracing::info!(
                run_id = %run_id,
                step = step.index,
                agent = step.agent.as_str(),
                status = step.status.as_str(),
                tools = step.tool_invocations.len(),
                duration_ms = step.duration_ms,
                "step finished"
            );
            emit(ProgressEvent::StepFinished {
                run_id,
                step: step.index,
                agent: step.agent.clone(),
                status: step.status,
                duration_ms: step.duration_ms,
            });
            self.record_step_telemetry(run_id, step);

            let deadline_hit = step.status == StepStatus::TimedOut && capped_by_deadline;
            let skip = step.skip_downstream.clone();
            let agent_name = step.agent.clone();

            if deadline_hit {
                state.termination = RunTermination::DeadlineExceeded;
                state.not_run = plan.agents[position + 1..]
                    .iter()
                    .map(|d| d.name.clone())
                    .collect();
                break;
            }
            if let Some(reason) = skip {
                state.termination = RunTermination::SkippedDownstream {
                    agent: agent_name,
                    reason,
                };
                state.not_run = plan.agents[position + 1..]
                    .iter()
                    .map(|d| d.name.clone())
                    .collect();
                break;
            }
        }

        if state.termination == RunTermination::Completed && cancel.is_cancelled() {
            state.termination = RunTermination::Cancelled;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let synthesis_timeout = step_timeout.min(remaining.max(Duration::from_secs(SYNTHESIS_GRACE_SECS)));
        let synthesizer = Synthesizer::new(
            self.table.synthesis(),
            self.providers.for_agent(&self.table.synthesis().name),
        );
        let artifact = synthesizer
            .synthesize(&mut state, synthesis_timeout, self.config.max_prompt_chars)
            .await;
        state.finish(artifact.clone());

        if let Err(err) = self.store.append(&state).await {
            tracing::warn!(run_id = %run_id, error = %err, "failed to persist run state");
        }

        let failed_steps = state.failed_steps().count();
        tracing::info!(
            run_id = %run_id,
            termination = ?state.termination,
            steps = state.steps().len(),
            failed_steps,
            "run finished"
        );
        self.emit_telemetry(
            "run.completed",
            json!({
                "run_id": run_id.to_string(),
                "session_id": state.request.session_id,
                "intent": state.routing.intent,
                "routing_fallback": state.routing.fallback,
                "steps": state.steps().len(),
                "failed_steps": failed_steps,
                "termination": state.termination,
            }),
        );
        emit(ProgressEvent::RunFinished {
            run_id,
            termination: state.termination.clone(),
            steps: state.steps().len(),
        });

        RunOutcome { state, artifact }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        descriptor: &Arc<AgentDescriptor>,
        state: &RunState,
        index: usize,
        timeout: Duration,
        capped_by_deadline: bool,
        deadline_secs: u64,
        cancel: &CancellationToken,
        progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
    ) -> Step {
        let recorder = InvocationRecorder::default();
        let ctx = StepContext {
            run_id: state.run_id,
            step_index: index,
            capability: descriptor.executor.then(|| self.capability.clone()),
            recorder: recorder.clone(),
            cancel: cancel.clone(),
            max_tool_rounds: descriptor
                .max_tool_rounds
                .unwrap_or(self.config.max_tool_rounds)
                .max(1),
            max_commands_per_round: self.config.max_commands_per_round,
            max_prompt_chars: self.config.max_prompt_chars,
            progress,
        };
        let agent = ModelAgent::new(descriptor.clone(), self.providers.for_agent(&descriptor.name));
        let attempts = AtomicU32::new(0);

        let started = Instant::now();
        let result = tokio::time::timeout(timeout, self.run_with_retries(&agent, state, &ctx, &attempts)).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut review = None;
        let (status, output, error, skip_downstream) = match result {
            Ok(Ok(AgentOutput {
                text,
                skip_downstream,
                tool_failure,
                review: verdict,
                ..
            })) => {
                review = verdict;
                match tool_failure {
                    Some(err) => (StepStatus::Failed, text, Some(err), skip_downstream),
                    None => (StepStatus::Ok, text, None, skip_downstream),
                }
            }
            Ok(Err(err)) => (StepStatus::Failed, String::new(), Some(err), None),
            Err(_) => {
                let err = if capped_by_deadline {
                    PipelineError::RunDeadlineExceeded { deadline_secs }
                } else {
                    PipelineError::StepTimeout {
                        timeout_secs: timeout.as_secs(),
                    }
                };
                (StepStatus::TimedOut, String::new(), Some(err), None)
            }
        };

        if let Some(err) = &error {
            tracing::warn!(
                run_id = %state.run_id,
                agent = descriptor.name.as_str(),
                code = err.code(),
                error = %err,
                "step did not complete cleanly"
            );
        }

        Step {
            index,
            agent: descriptor.name.clone(),
            kind: descriptor.kind,
            status,
            output,
            tool_invocations: recorder.take(),
            error: error.as_ref().map(StepError::from),
            attempts: attempts.load(Ordering::SeqCst).max(1),
            duration_ms,
            skip_downstream,
            review,
        }
    }

    /// Retryable provider errors re-run the whole agent call with
    /// exponential backoff.
    async fn run_with_retries(
        &self,
        agent: &ModelAgent,
        state: &RunState,
        ctx: &StepContext,
        attempts: &AtomicU32,
    ) -> Result<AgentOutput, PipelineError> {
        let max_attempts = self.config.provider_retry_attempts.saturating_add(1);
        let mut backoff = Duration::from_millis(self.config.provider_retry_backoff_ms);

        loop {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            match agent.run(state, ctx).await {
                Err(PipelineError::Provider(err)) if err.is_retryable() && attempt < max_attempts => {
                    if ctx.cancel.is_cancelled() {
                        return Err(PipelineError::Cancelled);
                    }
                    tracing::warn!(
                        agent = agent.descriptor().name.as_str(),
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "provider call failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
                other => return other,
            }
        }
    }

    fn record_step_telemetry(&self, run_id: Uuid, step: &Step) {
        let Some(sink) = &self.telemetry else {
            return;
        };
        for invocation in &step.tool_invocations {
            let event = match invocation.outcome {
                ToolOutcome::Completed => "tool.completed",
                ToolOutcome::Denied => "tool.denied",
                ToolOutcome::TimedOut | ToolOutcome::SpawnFailed | ToolOutcome::Interrupted => {
                    "tool.failed"
                }
            };
            sink.emit(
                event,
                json!({
                    "run_id": run_id.to_string(),
                    "agent": step.agent,
                    "command": invocation.command,
                    "exit_code": invocation.exit_code,
                    "duration_ms": invocation.duration_ms,
                    "outcome": invocation.outcome,
                }),
            );
        }
        let event = if step.status == StepStatus::Ok {
            "step.completed"
        } else {
            "step.failed"
        };
        sink.emit(
            event,
            json!({
                "run_id": run_id.to_string(),
                "agent": step.agent,
                "status": step.status,
                "attempts": step.attempts,
                "duration_ms": step.duration_ms,
                "error_code": step.error.as_ref().map(|e| e.code.clone()),
            }),
        );
    }
}
