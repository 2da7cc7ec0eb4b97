use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agents::descriptor::{AgentKind, DescriptorTable, ToolFailurePolicy};
use crate::agents::pipeline::{Pipeline, ProgressEvent, ROUTER_AGENT, RunOutcome};
use crate::agents::router::Router;
use crate::agents::state::{
    Request, ReviewVerdict, RunState, RunTermination, StepStatus, ToolOutcome,
};
use crate::cli::*;
use crate::config::*;
use crate::error::*;
use crate::provider::*;
use crate::server::*;
use crate::session::*;
use crate::telemetry::*;
use crate::tool_policy::CommandPolicy;
use crate::tools::*;

fn base_cfg() -> RuntimeConfig {
    RuntimeConfig {
        profile: "default".to_string(),
        config_path: ".baton/config.toml".to_string(),
        provider: Provider::Echo,
        model: None,
        session_id: "test-session".to_string(),
        persistence_backend: PersistenceBackend::Memory,
        db_url: "sqlite://.baton/test.db".to_string(),
        show_sensitive_config: false,
        tool_timeout_secs: 5,
        max_concurrent_tools: 4,
        run_deadline_secs: 60,
        step_timeout_secs: 30,
        max_tool_rounds: 3,
        max_commands_per_round: 2,
        max_output_chars: 4000,
        provider_retry_attempts: 2,
        provider_retry_backoff_ms: 1,
        workdir: None,
        allowed_workdirs: Vec::new(),
        allow_commands: Vec::new(),
        deny_commands: Vec::new(),
        telemetry_enabled: false,
        telemetry_path: ".baton/test-telemetry.jsonl".to_string(),
        max_prompt_chars: 32_000,
        agents: HashMap::new(),
        plans: PlansConfig::default(),
    }
}

fn test_cli(config_path: &str, profile: &str) -> Cli {
    Cli {
        provider: Provider::Auto,
        model: None,
        profile: profile.to_string(),
        config_path: config_path.to_string(),
        session_id: None,
        persistence: None,
        db_url: None,
        show_sensitive_config: false,
        tool_timeout_secs: None,
        max_concurrent_tools: None,
        run_deadline_secs: None,
        step_timeout_secs: None,
        max_tool_rounds: None,
        workdir: None,
        allow_command: Vec::new(),
        deny_command: Vec::new(),
        telemetry_enabled: None,
        telemetry_path: None,
        log_filter: "warn".to_string(),
        command: Commands::Doctor,
    }
}

fn scripted(replies: &[&str]) -> Arc<ScriptedProvider> {
    Arc::new(ScriptedProvider::new(replies.iter().copied()))
}

fn as_dyn(provider: &Arc<ScriptedProvider>) -> Arc<dyn ModelProvider> {
    provider.clone()
}

fn default_providers() -> ProviderRegistry {
    ProviderRegistry::new(Arc::new(ScriptedProvider::new(Vec::<&str>::new())))
}

fn commands_reply(commands: &[serde_json::Value]) -> String {
    format!("```json\n{}\n```", json!({ "commands": commands }))
}

fn build_pipeline(
    cfg: RuntimeConfig,
    providers: ProviderRegistry,
    executor: Arc<dyn CommandExecutor>,
) -> Pipeline {
    let cfg = Arc::new(cfg);
    let table = Arc::new(DescriptorTable::from_config(&cfg.agents).expect("table should build"));
    let capability = Arc::new(Capability::new(
        executor,
        CommandPolicy::from_config(&cfg),
        cfg.max_concurrent_tools,
        cfg.tool_timeout_secs,
        cfg.max_output_chars,
        std::env::temp_dir(),
    ));
    Pipeline::new(
        cfg,
        table,
        providers,
        capability,
        Arc::new(MemoryRunStore::default()),
    )
    .expect("pipeline should build")
}

async fn submit(pipeline: &Pipeline, input: &str) -> RunOutcome {
    pipeline
        .submit(
            Request::new("test-session", input),
            CancellationToken::new(),
            None,
        )
        .await
}

fn agent_names(state: &RunState) -> Vec<String> {
    state.steps().iter().map(|s| s.agent.clone()).collect()
}

/// Tracks how many executions overlap.
#[derive(Default)]
struct CountingExecutor {
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingExecutor {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl CommandExecutor for CountingExecutor {
    async fn execute(&self, request: &ExecRequest) -> Result<ExecOutput, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(ExecOutput {
            stdout: format!("ran {}\n", request.command),
            stderr: String::new(),
            exit_code: Some(0),
            duration: self.delay,
        })
    }
}

#[tokio::test]
async fn decide_request_runs_planning_research_decision_then_synthesis() {
    let router = scripted(&["INTENT: decide"]);
    let planning = scripted(&["1. Check whether component Y is already installed."]);
    let research = scripted(&[
        &commands_reply(&[json!({ "command": "kubectl get deployments -A" })]),
        "Component Y is already present in namespace ops.",
    ]);
    let decision = scripted(&["Do not adopt Y again; it is already installed."]);
    let synthesis = scripted(&[
        "## Recommendation\nComponent Y is already present in ops; keep the existing component Y.",
    ]);

    let providers = default_providers()
        .with_agent(ROUTER_AGENT, as_dyn(&router))
        .with_agent("planning", as_dyn(&planning))
        .with_agent("research", as_dyn(&research))
        .with_agent("decision", as_dyn(&decision))
        .with_agent("synthesis", as_dyn(&synthesis));
    let executor = Arc::new(EchoExecutor::new().respond("kubectl get", "component Y already present\n"));
    let pipeline = build_pipeline(base_cfg(), providers, executor);

    let outcome = submit(&pipeline, "Should we adopt component Y for the cluster?").await;
    let state = &outcome.state;

    assert_eq!(state.routing.intent.as_deref(), Some("decide"));
    assert!(!state.routing.fallback);
    assert_eq!(state.plan, vec!["planning", "research", "decision"]);
    assert_eq!(
        agent_names(state),
        vec!["planning", "research", "decision", "synthesis"]
    );
    assert_eq!(state.termination, RunTermination::Completed);
    assert!(state.not_run.is_empty());

    let research_step = &state.steps()[1];
    assert_eq!(research_step.status, StepStatus::Ok);
    assert_eq!(research_step.tool_invocations.len(), 1);
    let invocation = &research_step.tool_invocations[0];
    assert_eq!(invocation.command, "kubectl get deployments -A");
    assert_eq!(invocation.outcome, ToolOutcome::Completed);
    assert_eq!(invocation.stdout, "component Y already present\n");
    assert!(invocation.read_only);

    // The tool result is fed back to the model on the second round.
    let research_calls = research.calls();
    assert_eq!(research_calls.len(), 2);
    let feedback = research_calls[1].1.last().expect("feedback message");
    assert!(feedback.content.contains("component Y already present"));

    // Later agents see earlier outputs.
    let decision_calls = decision.calls();
    let decision_context = &decision_calls[0].1[0].content;
    assert!(decision_context.contains("already present in namespace ops"));
    assert!(decision_context.contains("Should we adopt component Y"));

    for step in state.steps().iter().filter(|s| s.agent != "research") {
        assert!(step.tool_invocations.is_empty(), "{} ran tools", step.agent);
    }

    assert!(outcome.artifact.contains("keep the existing component Y"));
    assert!(outcome.artifact.contains("already present"));
    assert!(outcome.artifact.contains("## Run status"));
    assert!(outcome.artifact.contains("| 2 | research | ok | 1 |"));
    assert_eq!(state.artifact.as_deref(), Some(outcome.artifact.as_str()));
    assert!(state.finished_at.is_some());
}

#[cfg(unix)]
#[tokio::test]
async fn slow_command_times_out_and_step_fails_without_blocking_the_run() {
    let research = scripted(&[
        &commands_reply(&[json!({ "command": "sleep 5", "timeout_secs": 1 })]),
        "The check timed out; no data gathered.",
    ]);
    let providers = default_providers().with_agent("research", as_dyn(&research));
    let pipeline = build_pipeline(base_cfg(), providers, Arc::new(ShellExecutor));

    let started = Instant::now();
    let outcome = submit(&pipeline, "query: how long does the check take?").await;
    assert!(started.elapsed() < Duration::from_secs(4));

    let state = &outcome.state;
    assert_eq!(agent_names(state), vec!["research", "synthesis"]);
    let step = &state.steps()[0];
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(
        step.error.as_ref().map(|e| e.code.as_str()),
        Some("tool_timeout")
    );
    assert_eq!(step.output, "The check timed out; no data gathered.");
    assert_eq!(step.tool_invocations.len(), 1);
    assert_eq!(step.tool_invocations[0].outcome, ToolOutcome::TimedOut);
    assert_eq!(step.tool_invocations[0].timeout_secs, 1);

    assert!(outcome.artifact.contains("tool_timeout"));
    assert!(outcome.artifact.contains("1 (1 failed)"));
}

#[cfg(unix)]
#[tokio::test]
async fn step_timeout_records_the_command_it_interrupted() {
    let research = scripted(&[&commands_reply(&[
        json!({ "command": "sleep 5", "timeout_secs": 10 }),
    ])]);
    let providers = default_providers().with_agent("research", as_dyn(&research));
    let mut cfg = base_cfg();
    cfg.step_timeout_secs = 1;
    let pipeline = build_pipeline(cfg, providers, Arc::new(ShellExecutor));

    let started = Instant::now();
    let outcome = submit(&pipeline, "query: is the batch job finished?").await;
    assert!(started.elapsed() < Duration::from_secs(4));

    let step = &outcome.state.steps()[0];
    assert_eq!(step.agent, "research");
    assert_eq!(step.status, StepStatus::TimedOut);
    assert_eq!(
        step.error.as_ref().map(|e| e.code.as_str()),
        Some("step_timeout")
    );
    assert_eq!(step.tool_invocations.len(), 1);
    let invocation = &step.tool_invocations[0];
    assert_eq!(invocation.command, "sleep 5");
    assert_eq!(invocation.outcome, ToolOutcome::Interrupted);
    assert_eq!(invocation.timeout_secs, 10);
    assert!(invocation.duration_ms >= 900);
}

#[tokio::test]
async fn pure_agents_never_reach_the_executor() {
    let command_text = commands_reply(&[json!({ "command": "ls" })]);
    let planning = scripted(&[&command_text]);
    let executor = Arc::new(CountingExecutor::default());
    let providers = default_providers().with_agent("planning", as_dyn(&planning));
    let pipeline = build_pipeline(base_cfg(), providers, executor.clone());

    let outcome = submit(&pipeline, "analyze: storage classes").await;
    let planning_step = &outcome.state.steps()[0];

    assert_eq!(planning_step.agent, "planning");
    assert_eq!(planning_step.status, StepStatus::Ok);
    assert!(planning_step.tool_invocations.is_empty());
    assert!(planning_step.output.contains("\"commands\""));
    assert_eq!(planning.call_count(), 1);
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn same_request_yields_the_same_step_sequence() {
    let mut sequences = Vec::new();
    for _ in 0..2 {
        let router = scripted(&["INTENT: build"]);
        let providers = default_providers().with_agent(ROUTER_AGENT, as_dyn(&router));
        let pipeline = build_pipeline(base_cfg(), providers, Arc::new(EchoExecutor::new()));
        let outcome = submit(&pipeline, "Write a namespace manifest for team-a").await;
        sequences.push(agent_names(&outcome.state));
    }
    assert_eq!(sequences[0], sequences[1]);
    assert_eq!(
        sequences[0],
        vec!["planning", "research", "generation", "review", "synthesis"]
    );
}

#[tokio::test]
async fn build_plan_runs_code_specialists_and_records_the_review_verdict() {
    let backend = scripted(&[
        &commands_reply(&[json!({ "command": "git diff --stat", "cwd": "api" })]),
        "Added the /healthz handler to the api service.",
    ]);
    let infrastructure = scripted(&["Added a readiness check on /healthz to the deployment."]);
    let review = scripted(&["No critical issues found.\nAPPROVED: yes"]);
    let providers = default_providers()
        .with_agent("backend", as_dyn(&backend))
        .with_agent("infrastructure", as_dyn(&infrastructure))
        .with_agent("review", as_dyn(&review));

    let mut cfg = base_cfg();
    cfg.plans.build = Some(
        ["review", "planning", "research", "backend", "infrastructure"]
            .iter()
            .map(|n| n.to_string())
            .collect(),
    );
    let pipeline = build_pipeline(cfg, providers, Arc::new(EchoExecutor::new()));

    let outcome = submit(&pipeline, "build: add a health endpoint to the api").await;
    let state = &outcome.state;
    assert_eq!(state.routing.intent.as_deref(), Some("build"));
    assert_eq!(
        agent_names(state),
        vec!["planning", "research", "backend", "infrastructure", "review", "synthesis"]
    );

    let backend_step = &state.steps()[2];
    assert_eq!(backend_step.kind, AgentKind::Generation);
    assert_eq!(backend_step.tool_invocations.len(), 1);
    assert!(backend_step.tool_invocations[0].cwd.ends_with("api"));
    assert!(backend_step.review.is_none());

    let review_step = &state.steps()[4];
    assert_eq!(review_step.review, Some(ReviewVerdict::Approved));
    assert!(outcome.artifact.contains("- Review (review): approved"));
}

#[tokio::test]
async fn unknown_intent_falls_back_to_default_plan() {
    let router = scripted(&["INTENT: dance"]);
    let providers = default_providers().with_agent(ROUTER_AGENT, as_dyn(&router));
    let pipeline = build_pipeline(base_cfg(), providers, Arc::new(EchoExecutor::new()));

    let outcome = submit(&pipeline, "something odd").await;
    let routing = &outcome.state.routing;
    assert!(routing.fallback);
    assert!(routing.intent.is_none());
    assert!(
        routing
            .reason
            .as_deref()
            .is_some_and(|r| r.contains("dance"))
    );
    assert_eq!(outcome.state.plan, default_plan_names());
    assert!(outcome.artifact.contains("default plan used"));
}

#[tokio::test]
async fn router_failure_uses_default_plan_and_records_reason() {
    let router = Arc::new(ScriptedProvider::with_results(vec![Err(
        ProviderError::Transport("connection reset".to_string()),
    )]));
    let table = DescriptorTable::builtin();
    let router =
        Router::new(as_dyn(&router), &table, &PlansConfig::default()).expect("router should build");

    let plan = router
        .route(&Request::new("s", "check the cluster"), Duration::from_secs(5))
        .await;
    assert!(plan.routing.fallback);
    assert_eq!(plan.names(), default_plan_names());
    assert!(
        plan.routing
            .reason
            .as_deref()
            .is_some_and(|r| r.contains("connection reset"))
    );
}

#[tokio::test]
async fn explicit_intent_prefix_skips_the_router_call() {
    let router = scripted(&["INTENT: build"]);
    let table = DescriptorTable::builtin();
    let router_impl =
        Router::new(as_dyn(&router), &table, &PlansConfig::default()).expect("router should build");

    let plan = router_impl
        .route(&Request::new("s", "query: which nodes are ready?"), Duration::from_secs(5))
        .await;
    assert_eq!(plan.routing.intent.as_deref(), Some("query"));
    assert_eq!(plan.names(), vec!["research"]);
    assert_eq!(router.call_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn executor_semaphore_bounds_concurrent_commands() {
    let executor = Arc::new(CountingExecutor::with_delay(Duration::from_millis(50)));
    let capability = Arc::new(Capability::new(
        executor.clone(),
        CommandPolicy::new(Vec::new(), Vec::new(), Vec::new()),
        2,
        5,
        1000,
        std::env::temp_dir(),
    ));

    let mut handles = Vec::new();
    for i in 0..6 {
        let capability = capability.clone();
        handles.push(tokio::spawn(async move {
            capability
                .invoke(&ToolRequest {
                    command: format!("echo {i}"),
                    cwd: None,
                    timeout_secs: None,
                })
                .await
        }));
    }
    for handle in handles {
        let invocation = handle.await.expect("task should join");
        assert_eq!(invocation.outcome, ToolOutcome::Completed);
    }

    assert_eq!(executor.calls.load(Ordering::SeqCst), 6);
    assert!(executor.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(capability.available_permits(), 2);
}

#[tokio::test]
async fn denied_command_is_recorded_and_not_executed() {
    let mut cfg = base_cfg();
    cfg.deny_commands = vec!["kubectl delete*".to_string()];
    let research = scripted(&[
        &commands_reply(&[json!({ "command": "kubectl delete ns prod" })]),
        "I was not allowed to delete the namespace.",
    ]);
    let executor = Arc::new(CountingExecutor::default());
    let providers = default_providers().with_agent("research", as_dyn(&research));
    let pipeline = build_pipeline(cfg, providers, executor.clone());

    let outcome = submit(&pipeline, "query: clean up prod").await;
    let step = &outcome.state.steps()[0];

    assert_eq!(step.status, StepStatus::Ok);
    assert_eq!(step.tool_invocations.len(), 1);
    assert_eq!(step.tool_invocations[0].outcome, ToolOutcome::Denied);
    assert!(
        step.tool_invocations[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("deny_commands"))
    );
    assert_eq!(executor.calls.load(Ordering::SeqCst), 0);

    let research_calls = research.calls();
    let feedback = &research_calls[1].1;
    assert!(
        feedback
            .last()
            .is_some_and(|m| m.content.contains("NOT RUN"))
    );
}

#[tokio::test]
async fn tool_rounds_are_capped() {
    let mut cfg = base_cfg();
    cfg.max_tool_rounds = 2;
    let research = Arc::new(
        ScriptedProvider::new(Vec::<&str>::new())
            .with_fallback(commands_reply(&[json!({ "command": "ls" })])),
    );
    let providers = default_providers().with_agent("research", as_dyn(&research));
    let pipeline = build_pipeline(cfg, providers, Arc::new(EchoExecutor::new()));

    let outcome = submit(&pipeline, "query: list everything forever").await;
    let step = &outcome.state.steps()[0];

    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(
        step.error.as_ref().map(|e| e.code.as_str()),
        Some("tool_rounds_exceeded")
    );
    assert_eq!(step.tool_invocations.len(), 2);
    assert_eq!(research.call_count(), 3);
}

#[tokio::test]
async fn extra_commands_in_one_reply_are_dropped() {
    let research = scripted(&[
        &commands_reply(&[
            json!({ "command": "ls" }),
            json!({ "command": "pwd" }),
            json!({ "command": "whoami" }),
        ]),
        "done looking",
    ]);
    let providers = default_providers().with_agent("research", as_dyn(&research));
    let pipeline = build_pipeline(base_cfg(), providers, Arc::new(EchoExecutor::new()));

    let outcome = submit(&pipeline, "query: where am I?").await;
    let step = &outcome.state.steps()[0];
    assert_eq!(step.tool_invocations.len(), 2);
    let research_calls = research.calls();
    let feedback = &research_calls[1].1;
    assert!(
        feedback
            .last()
            .is_some_and(|m| m.content.contains("1 additional command(s) were ignored"))
    );
}

#[tokio::test]
async fn abort_policy_stops_the_step_at_the_first_failed_command() {
    let mut cfg = base_cfg();
    cfg.agents.insert(
        "research".to_string(),
        AgentFileConfig {
            tool_failure: Some(ToolFailurePolicy::Abort),
            ..AgentFileConfig::default()
        },
    );
    let research = scripted(&[
        &commands_reply(&[json!({ "command": "ls", "cwd": "bad\u{0}dir" })]),
        "should not be reached",
    ]);
    let providers = default_providers().with_agent("research", as_dyn(&research));
    let pipeline = build_pipeline(cfg, providers, Arc::new(EchoExecutor::new()));

    let outcome = submit(&pipeline, "query: list files").await;
    let step = &outcome.state.steps()[0];
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(
        step.error.as_ref().map(|e| e.code.as_str()),
        Some("tool_spawn_failure")
    );
    assert_eq!(step.tool_invocations[0].outcome, ToolOutcome::SpawnFailed);
    assert_eq!(research.call_count(), 1);
}

#[tokio::test]
async fn retryable_provider_error_is_retried() {
    let planning = Arc::new(ScriptedProvider::with_results(vec![
        Err(ProviderError::Http {
            status: 503,
            body: "overloaded".to_string(),
        }),
        Ok("1. Inspect current storage classes.".to_string()),
    ]));
    let providers = default_providers().with_agent("planning", as_dyn(&planning));
    let pipeline = build_pipeline(base_cfg(), providers, Arc::new(EchoExecutor::new()));

    let outcome = submit(&pipeline, "analyze: storage").await;
    let step = &outcome.state.steps()[0];
    assert_eq!(step.status, StepStatus::Ok);
    assert_eq!(step.attempts, 2);
    assert_eq!(step.output, "1. Inspect current storage classes.");
}

#[tokio::test]
async fn auth_errors_are_not_retried() {
    let planning = Arc::new(ScriptedProvider::with_results(vec![Err(
        ProviderError::Auth { status: 401 },
    )]));
    let providers = default_providers().with_agent("planning", as_dyn(&planning));
    let pipeline = build_pipeline(base_cfg(), providers, Arc::new(EchoExecutor::new()));

    let outcome = submit(&pipeline, "analyze: storage").await;
    let step = &outcome.state.steps()[0];
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.attempts, 1);
    assert_eq!(
        step.error.as_ref().map(|e| e.code.as_str()),
        Some("provider_error")
    );
    assert_eq!(planning.call_count(), 1);
    // Later agents still run.
    assert_eq!(
        agent_names(&outcome.state),
        vec!["planning", "research", "review", "synthesis"]
    );
}

#[tokio::test]
async fn step_timeout_marks_the_step_and_continues() {
    let mut cfg = base_cfg();
    cfg.step_timeout_secs = 1;
    let planning = Arc::new(ScriptedProvider::new(["late plan"]).with_delay(Duration::from_secs(3)));
    let providers = default_providers().with_agent("planning", as_dyn(&planning));
    let pipeline = build_pipeline(cfg, providers, Arc::new(EchoExecutor::new()));

    let outcome = submit(&pipeline, "analyze: storage").await;
    let state = &outcome.state;
    assert_eq!(state.steps()[0].status, StepStatus::TimedOut);
    assert_eq!(
        state.steps()[0].error.as_ref().map(|e| e.code.as_str()),
        Some("step_timeout")
    );
    assert_eq!(state.termination, RunTermination::Completed);
    assert_eq!(
        agent_names(state),
        vec!["planning", "research", "review", "synthesis"]
    );
}

#[tokio::test]
async fn run_deadline_stops_remaining_agents() {
    let mut cfg = base_cfg();
    cfg.run_deadline_secs = 1;
    let planning = Arc::new(ScriptedProvider::new(["late plan"]).with_delay(Duration::from_secs(3)));
    let providers = default_providers().with_agent("planning", as_dyn(&planning));
    let pipeline = build_pipeline(cfg, providers, Arc::new(EchoExecutor::new()));

    let outcome = submit(&pipeline, "analyze: storage").await;
    let state = &outcome.state;

    assert_eq!(state.termination, RunTermination::DeadlineExceeded);
    assert_eq!(state.steps()[0].status, StepStatus::TimedOut);
    assert_eq!(
        state.steps()[0].error.as_ref().map(|e| e.code.as_str()),
        Some("run_deadline_exceeded")
    );
    assert_eq!(state.not_run, vec!["research", "review"]);
    assert_eq!(agent_names(state), vec!["planning", "synthesis"]);
    assert!(outcome.artifact.contains("run deadline exceeded"));
    assert!(outcome.artifact.contains("Not run: research, review"));
}

#[tokio::test]
async fn cancelled_run_skips_every_agent_but_still_synthesizes() {
    let pipeline = build_pipeline(base_cfg(), default_providers(), Arc::new(EchoExecutor::new()));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = pipeline
        .submit(Request::new("test-session", "analyze: storage"), cancel, None)
        .await;
    assert_eq!(outcome.state.termination, RunTermination::Cancelled);
    assert_eq!(outcome.state.not_run, vec!["planning", "research", "review"]);
    assert_eq!(agent_names(&outcome.state), vec!["synthesis"]);
    assert!(outcome.artifact.contains("## Run status"));
}

#[tokio::test]
async fn cancellation_between_steps_stops_the_plan() {
    let planning =
        Arc::new(ScriptedProvider::new(["plan"]).with_delay(Duration::from_millis(300)));
    let providers = default_providers().with_agent("planning", as_dyn(&planning));
    let pipeline = build_pipeline(base_cfg(), providers, Arc::new(EchoExecutor::new()));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let outcome = pipeline
        .submit(Request::new("test-session", "analyze: storage"), cancel, None)
        .await;
    assert_eq!(outcome.state.termination, RunTermination::Cancelled);
    assert_eq!(agent_names(&outcome.state), vec!["planning", "synthesis"]);
    assert_eq!(outcome.state.not_run, vec!["research", "review"]);
}

#[tokio::test]
async fn skip_downstream_marker_ends_the_plan_early() {
    let planning = scripted(&["Nothing to plan.\nSKIP_DOWNSTREAM: component already installed"]);
    let providers = default_providers().with_agent("planning", as_dyn(&planning));
    let pipeline = build_pipeline(base_cfg(), providers, Arc::new(EchoExecutor::new()));

    let outcome = submit(&pipeline, "analyze: component Y").await;
    let state = &outcome.state;

    assert_eq!(
        state.termination,
        RunTermination::SkippedDownstream {
            agent: "planning".to_string(),
            reason: "component already installed".to_string(),
        }
    );
    assert_eq!(state.steps()[0].output, "Nothing to plan.");
    assert_eq!(state.not_run, vec!["research", "review"]);
    assert_eq!(agent_names(state), vec!["planning", "synthesis"]);
    assert!(outcome.artifact.contains("stopped early by planning"));
}

#[tokio::test]
async fn synthesis_failure_falls_back_to_run_state_rendering() {
    let synthesis = Arc::new(ScriptedProvider::with_results(vec![Err(
        ProviderError::Http {
            status: 500,
            body: "boom".to_string(),
        },
    )]));
    let providers = default_providers().with_agent("synthesis", as_dyn(&synthesis));
    let pipeline = build_pipeline(base_cfg(), providers, Arc::new(EchoExecutor::new()));

    let outcome = submit(&pipeline, "query: anything").await;
    let last = outcome.state.steps().last().expect("synthesis step");
    assert_eq!(last.agent, "synthesis");
    assert_eq!(last.status, StepStatus::Failed);
    assert_eq!(synthesis.call_count(), 1);
    assert!(outcome.artifact.contains("## Run status"));
    assert!(outcome.artifact.contains("summary rendered from run state"));
}

#[tokio::test]
async fn progress_events_follow_the_run() {
    let research = scripted(&[&commands_reply(&[json!({ "command": "ls" })]), "ok"]);
    let providers = default_providers().with_agent("research", as_dyn(&research));
    let pipeline = build_pipeline(base_cfg(), providers, Arc::new(EchoExecutor::new()));

    let (tx, mut rx) = mpsc::unbounded_channel();
    let outcome = pipeline
        .submit(
            Request::new("test-session", "query: files"),
            CancellationToken::new(),
            Some(tx),
        )
        .await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert!(matches!(events.first(), Some(ProgressEvent::RunStarted { .. })));
    assert!(matches!(
        events.get(1),
        Some(ProgressEvent::PlanResolved { agents, .. }) if agents == &vec!["research".to_string()]
    ));
    assert!(
        events
            .iter()
            .any(|e| matches!(e, ProgressEvent::ToolFinished { agent, .. } if agent == "research"))
    );
    match events.last() {
        Some(ProgressEvent::RunFinished { run_id, steps, .. }) => {
            assert_eq!(*run_id, outcome.state.run_id);
            assert_eq!(*steps, 2);
        }
        other => panic!("unexpected last event: {other:?}"),
    }

    let encoded = serde_json::to_value(&events[0]).expect("event should serialize");
    assert_eq!(encoded["event"], "run_started");
}

#[tokio::test]
async fn runs_are_persisted_per_session() {
    let pipeline = build_pipeline(base_cfg(), default_providers(), Arc::new(EchoExecutor::new()));
    submit(&pipeline, "query: one").await;
    submit(&pipeline, "query: two").await;

    let runs = pipeline
        .store()
        .list_by_session("test-session", 10)
        .await
        .expect("runs should list");
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].request.input, "query: one");
    assert_eq!(runs[1].request.input, "query: two");
    assert!(runs.iter().all(|r| r.artifact.is_some()));

    let latest = pipeline
        .store()
        .list_by_session("test-session", 1)
        .await
        .expect("runs should list");
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].request.input, "query: two");
}

#[tokio::test]
async fn memory_store_evicts_the_oldest_runs_past_its_capacity() {
    let store = MemoryRunStore::with_capacity(2);
    let mut first = RunState::new(Request::new("ops", "query: one"));
    store.append(&first).await.expect("append should work");
    for input in ["query: two", "query: three"] {
        store
            .append(&RunState::new(Request::new("ops", input)))
            .await
            .expect("append should work");
    }
    store
        .append(&RunState::new(Request::new("other", "query: pods")))
        .await
        .expect("append should work");

    let runs = store.list_by_session("ops", 10).await.expect("list should work");
    let inputs = runs.iter().map(|r| r.request.input.as_str()).collect::<Vec<_>>();
    assert_eq!(inputs, vec!["query: two", "query: three"]);
    assert_eq!(store.list_by_session("other", 10).await.expect("list").len(), 1);

    // An evicted run coming back is stored again as the newest.
    first.finish("late".to_string());
    store.append(&first).await.expect("append should work");
    let runs = store.list_by_session("ops", 10).await.expect("list should work");
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[1].run_id, first.run_id);
}

#[tokio::test]
async fn sqlite_run_store_round_trips_and_upserts() {
    let dir = tempdir().expect("temp directory should create");
    let db_url = format!("sqlite://{}", dir.path().join("runs.db").to_string_lossy());
    let store = SqliteRunStore::open(&db_url)
        .await
        .expect("sqlite store should open");

    let mut state = RunState::new(Request::new("ops", "query: nodes"));
    store.append(&state).await.expect("append should work");
    state.finish("final artifact".to_string());
    store.append(&state).await.expect("second append should upsert");
    store
        .append(&RunState::new(Request::new("other", "query: pods")))
        .await
        .expect("append should work");

    let runs = store.list_by_session("ops", 10).await.expect("list should work");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, state.run_id);
    assert_eq!(runs[0].artifact.as_deref(), Some("final artifact"));

    let reopened = SqliteRunStore::open(&db_url)
        .await
        .expect("sqlite store should reopen");
    assert_eq!(
        reopened
            .list_by_session("other", 10)
            .await
            .expect("list should work")
            .len(),
        1
    );
}

#[tokio::test]
async fn telemetry_records_runs_steps_and_tools() {
    let dir = tempdir().expect("temp directory should create");
    let mut cfg = base_cfg();
    cfg.telemetry_enabled = true;
    cfg.telemetry_path = dir
        .path()
        .join("events.jsonl")
        .to_string_lossy()
        .to_string();
    cfg.deny_commands = vec!["rm *".to_string()];

    let research = scripted(&[
        &commands_reply(&[json!({ "command": "ls" }), json!({ "command": "rm notes.txt" })]),
        "listed",
    ]);
    let providers = default_providers().with_agent("research", as_dyn(&research));
    let sink = TelemetrySink::new(&cfg, "test".to_string());
    let pipeline =
        build_pipeline(cfg.clone(), providers, Arc::new(EchoExecutor::new())).with_telemetry(sink);

    submit(&pipeline, "query: files").await;

    let content = std::fs::read_to_string(&cfg.telemetry_path).expect("telemetry should exist");
    let lines = content.lines().map(str::to_string).collect::<Vec<_>>();
    let summary = summarize_telemetry_lines(lines, 1000);

    assert_eq!(summary.parse_errors, 0);
    assert_eq!(summary.runs_completed, 1);
    assert_eq!(summary.runs_with_failures, 0);
    assert_eq!(summary.steps_completed, 1);
    assert_eq!(summary.tools_completed, 1);
    assert_eq!(summary.tools_denied, 1);
    assert_eq!(summary.unique_runs.len(), 1);
    assert_eq!(summary.cli_command_counts.get("test"), Some(&summary.parsed_events));
}

#[test]
fn telemetry_summary_counts_failures_and_skips_bad_lines() {
    let lines = vec![
        json!({"event": "run.completed", "run_id": "r1", "failed_steps": 1, "cli_command": "run", "ts_unix_ms": 10}).to_string(),
        json!({"event": "step.failed", "run_id": "r1", "agent": "research", "cli_command": "run", "ts_unix_ms": 9}).to_string(),
        json!({"event": "tool.failed", "run_id": "r1", "cli_command": "run", "ts_unix_ms": 8}).to_string(),
        "not json".to_string(),
        String::new(),
    ];
    let summary = summarize_telemetry_lines(lines, 100);
    assert_eq!(summary.total_lines, 5);
    assert_eq!(summary.parsed_events, 3);
    assert_eq!(summary.parse_errors, 1);
    assert_eq!(summary.runs_with_failures, 1);
    assert_eq!(summary.failed_step_agents.get("research"), Some(&1));
    assert_eq!(summary.tools_failed, 1);
    assert_eq!(summary.last_event_ts_unix_ms, Some(10));
}

#[test]
fn config_file_registers_agents_and_plans() {
    let dir = tempdir().expect("temp directory should create");
    let path = dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[profiles.ops]
provider = "echo"
session_id = "ops"
run_deadline_secs = 120
allow_commands = ["kubectl get *"]

[agents.security]
kind = "review"
priority = 35
description = "Checks RBAC bindings"

[agents.research]
timeout_secs = 90
tool_failure = "abort"

[plans]
analyze = ["planning", "research", "security"]
"#,
    )
    .expect("config should write");

    let config_path = path.to_string_lossy().to_string();
    let file = load_config_file(&config_path).expect("config should parse");
    let cfg = resolve_runtime_config(&test_cli(&config_path, "ops"), &file)
        .expect("runtime config should resolve");

    assert_eq!(cfg.provider, Provider::Echo);
    assert_eq!(cfg.session_id, "ops");
    assert_eq!(cfg.run_deadline_secs, 120);
    assert_eq!(cfg.step_timeout_secs, DEFAULT_STEP_TIMEOUT_SECS);
    assert_eq!(cfg.allow_commands, vec!["kubectl get *"]);

    let table = DescriptorTable::from_config(&cfg.agents).expect("table should build");
    let security = table.get("security").expect("security agent registered");
    assert_eq!(security.kind, AgentKind::Review);
    assert!(security.is_pure());
    let research = table.get("research").expect("research agent");
    assert_eq!(research.timeout_secs, Some(90));
    assert_eq!(research.tool_failure, ToolFailurePolicy::Abort);
    assert!(research.executor);

    let router = Router::new(
        Arc::new(EchoProvider),
        &table,
        &cfg.plans,
    )
    .expect("router should build");
    let names = router
        .plan_for(Some(crate::agents::router::Intent::Analyze))
        .iter()
        .map(|d| d.name.as_str())
        .collect::<Vec<_>>();
    assert_eq!(names, vec!["planning", "research", "security"]);
}

#[test]
fn config_rejects_unknown_agents_and_fields() {
    let file = parse_config_file("[plans]\ndecide = [\"planning\", \"oracle\"]\n")
        .expect("toml should parse");
    let table = DescriptorTable::from_config(&file.agents).expect("table should build");
    let err = Router::new(Arc::new(EchoProvider), &table, &file.plans)
        .err()
        .expect("unknown agent should fail");
    assert!(format!("{err:#}").contains("unknown agent 'oracle'"));

    assert!(parse_config_file("[profiles.default]\nbogus = 1\n").is_err());

    let file = parse_config_file("[agents.auditor]\npriority = 5\n").expect("toml should parse");
    let err = DescriptorTable::from_config(&file.agents)
        .err()
        .expect("new agent without kind should fail");
    assert!(err.to_string().contains("must set kind"));

    let file = parse_config_file("[agents.synthesis]\nexecutor = true\n").expect("toml should parse");
    assert!(DescriptorTable::from_config(&file.agents).is_err());
}

#[test]
fn missing_profile_is_an_input_error() {
    let file = ConfigFile::default();
    let err = resolve_runtime_config(&test_cli("missing.toml", "staging"), &file)
        .expect_err("unknown profile should fail");
    assert_eq!(categorize_error(&err), ErrorCategory::Input);
    assert!(format_cli_error(&err, false).starts_with("[INPUT]"));
}

#[test]
fn cli_errors_redact_sqlite_urls() {
    let err = anyhow::anyhow!("failed to open sqlite run database sqlite:///home/ops/secret/runs.db");
    let rendered = format_cli_error(&err, false);
    assert!(!rendered.contains("/home/ops/secret"));
    assert!(format_cli_error(&err, true).contains("/home/ops/secret"));
}

#[test]
fn server_auth_requires_matching_bearer_token() {
    let cfg = base_cfg();
    let state = ServerState {
        cfg: Arc::new(cfg.clone()),
        pipeline: Arc::new(build_pipeline(
            cfg.clone(),
            default_providers(),
            Arc::new(EchoExecutor::new()),
        )),
        telemetry: TelemetrySink::new(&cfg, "serve".to_string()),
        auth_token: Some("s3cret".to_string()),
        shutdown: CancellationToken::new(),
    };

    let mut headers = axum::http::HeaderMap::new();
    assert!(check_server_auth(&state, &headers).is_err());
    headers.insert(
        axum::http::header::AUTHORIZATION,
        "Bearer wrong".parse().expect("header value"),
    );
    assert!(check_server_auth(&state, &headers).is_err());
    headers.insert(
        axum::http::header::AUTHORIZATION,
        "Bearer s3cret".parse().expect("header value"),
    );
    assert!(check_server_auth(&state, &headers).is_ok());
}

#[tokio::test]
async fn client_disconnect_cancels_the_run_between_steps_and_still_persists_it() {
    let cfg = base_cfg();
    let planning = Arc::new(
        ScriptedProvider::new(["1. Inspect the ingress controllers."])
            .with_delay(Duration::from_millis(500)),
    );
    let providers = default_providers().with_agent("planning", as_dyn(&planning));
    let pipeline = Arc::new(build_pipeline(cfg.clone(), providers, Arc::new(EchoExecutor::new())));
    let state = Arc::new(ServerState {
        cfg: Arc::new(cfg.clone()),
        pipeline: pipeline.clone(),
        telemetry: TelemetrySink::new(&cfg, "serve".to_string()),
        auth_token: None,
        shutdown: CancellationToken::new(),
    });

    let handler = handle_submit_run(
        axum::extract::State(state),
        axum::http::HeaderMap::new(),
        axum::Json(SubmitRunRequest {
            prompt: "analyze: ingress setup".to_string(),
            session_id: None,
            include_state: false,
        }),
    );
    // Dropping the handler future is what axum does when the client goes away.
    assert!(
        tokio::time::timeout(Duration::from_millis(100), handler)
            .await
            .is_err()
    );

    tokio::time::sleep(Duration::from_millis(800)).await;
    let runs = pipeline
        .store()
        .list_by_session("test-session", 10)
        .await
        .expect("store lists runs");
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.termination, RunTermination::Cancelled);
    assert_eq!(agent_names(run), vec!["planning", "synthesis"]);
    assert_eq!(run.steps()[0].status, StepStatus::Ok);
    assert!(run.not_run.contains(&"research".to_string()));
    assert!(run.artifact.as_deref().is_some_and(|a| a.contains("cancelled")));
}

#[tokio::test]
async fn run_summary_reflects_steps() {
    let pipeline = build_pipeline(base_cfg(), default_providers(), Arc::new(EchoExecutor::new()));
    let outcome = submit(&pipeline, "query: nodes").await;
    let summary = RunSummary::from(&outcome.state);
    assert_eq!(summary.intent.as_deref(), Some("query"));
    assert_eq!(summary.steps.len(), 2);
    assert_eq!(summary.steps[1].agent, "synthesis");
    assert_eq!(summary.artifact.as_deref(), Some(outcome.artifact.as_str()));
}
