use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::agents::pipeline::Pipeline;
use crate::agents::state::{Request, RunState, RunTermination, StepStatus};
use crate::config::RuntimeConfig;
use crate::telemetry::TelemetrySink;

pub struct ServerState {
    pub cfg: Arc<RuntimeConfig>,
    pub pipeline: Arc<Pipeline>,
    pub telemetry: TelemetrySink,
    pub auth_token: Option<String>,
    /// Parent of every in-flight run; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

#[derive(Debug, Serialize)]
pub struct ServerHealthResponse {
    pub status: &'static str,
    pub profile: String,
    pub agents: usize,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRunRequest {
    pub prompt: String,
    pub session_id: Option<String>,
    #[serde(default)]
    pub include_state: bool,
}

#[derive(Debug, Serialize)]
pub struct StepSummary {
    pub agent: String,
    pub status: StepStatus,
    pub tools: usize,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub session_id: String,
    pub intent: Option<String>,
    pub termination: RunTermination,
    pub steps: Vec<StepSummary>,
    pub artifact: Option<String>,
}

impl From<&RunState> for RunSummary {
    fn from(state: &RunState) -> Self {
        Self {
            run_id: state.run_id.to_string(),
            session_id: state.request.session_id.clone(),
            intent: state.routing.intent.clone(),
            termination: state.termination.clone(),
            steps: state
                .steps()
                .iter()
                .map(|step| StepSummary {
                    agent: step.agent.clone(),
                    status: step.status,
                    tools: step.tool_invocations.len(),
                    error: step.error.as_ref().map(|e| e.message.clone()),
                })
                .collect(),
            artifact: state.artifact.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitRunResponse {
    #[serde(flatten)]
    pub summary: RunSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<RunState>,
}

#[derive(Debug, Deserialize)]
pub struct ListRunsQuery {
    pub limit: Option<usize>,
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

pub fn check_server_auth(
    state: &ServerState,
    headers: &axum::http::HeaderMap,
) -> Result<(), ApiError> {
    let Some(expected_token) = state.auth_token.as_deref() else {
        return Ok(());
    };

    let header_value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let provided_token = header_value
        .strip_prefix("Bearer ")
        .unwrap_or_default()
        .trim();

    if provided_token.is_empty() || provided_token != expected_token {
        return Err(api_error(
            StatusCode::UNAUTHORIZED,
            "missing or invalid Authorization bearer token",
        ));
    }

    Ok(())
}

pub async fn handle_server_health(
    State(state): State<Arc<ServerState>>,
) -> Json<ServerHealthResponse> {
    Json(ServerHealthResponse {
        status: "ok",
        profile: state.cfg.profile.clone(),
        agents: state.pipeline.table().all().len(),
    })
}

pub async fn handle_submit_run(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    Json(request): Json<SubmitRunRequest>,
) -> ApiResult<SubmitRunResponse> {
    check_server_auth(&state, &headers)?;
    let started_at = Instant::now();

    let prompt = request.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "prompt cannot be empty for /v1/runs",
        ));
    }
    if prompt.chars().count() > state.cfg.max_prompt_chars {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!(
                "prompt exceeds the {} character limit",
                state.cfg.max_prompt_chars
            ),
        ));
    }

    let session_id = request
        .session_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| state.cfg.session_id.clone());

    // The run lives on its own task; a dropped connection only cancels it,
    // so it still stops between steps, synthesizes and persists.
    let cancel = state.shutdown.child_token();
    let _disconnect = cancel.clone().drop_guard();
    let run_state = state.clone();
    let run = tokio::spawn(async move {
        let outcome = run_state
            .pipeline
            .submit(Request::new(session_id.clone(), prompt), cancel, None)
            .await;
        run_state.telemetry.emit(
            "server.run.completed",
            json!({
                "run_id": outcome.state.run_id.to_string(),
                "session_id": session_id,
                "termination": outcome.state.termination,
                "latency_ms": started_at.elapsed().as_millis() as u64
            }),
        );
        outcome
    });
    let outcome = run.await.map_err(|err| {
        tracing::error!(error = %err, "run task failed");
        api_error(StatusCode::INTERNAL_SERVER_ERROR, "run task failed")
    })?;

    Ok(Json(SubmitRunResponse {
        summary: RunSummary::from(&outcome.state),
        state: request.include_state.then_some(outcome.state),
    }))
}

pub async fn handle_list_runs(
    State(state): State<Arc<ServerState>>,
    headers: axum::http::HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<ListRunsQuery>,
) -> ApiResult<Vec<RunSummary>> {
    check_server_auth(&state, &headers)?;
    let limit = query.limit.unwrap_or(20).clamp(1, 500);
    let runs = state
        .pipeline
        .store()
        .list_by_session(&session_id, limit)
        .await
        .map_err(|err| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")))?;
    Ok(Json(runs.iter().map(RunSummary::from).collect()))
}

pub fn build_server_router(state: Arc<ServerState>) -> AxumRouter {
    AxumRouter::new()
        .route("/healthz", get(handle_server_health))
        .route("/v1/runs", post(handle_submit_run))
        .route("/v1/sessions/{id}/runs", get(handle_list_runs))
        .with_state(state)
}

pub async fn run_server(
    cfg: Arc<RuntimeConfig>,
    host: String,
    port: u16,
    auth_token: Option<String>,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server bind address '{}:{}'", host, port))?;
    let pipeline = Arc::new(Pipeline::from_config(cfg.clone(), "serve").await?);
    let shutdown = CancellationToken::new();
    let state = Arc::new(ServerState {
        cfg: cfg.clone(),
        pipeline,
        telemetry: telemetry.clone(),
        auth_token: auth_token
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty()),
        shutdown: shutdown.clone(),
    });

    telemetry.emit(
        "server.started",
        json!({
            "host": host,
            "port": port,
            "profile": cfg.profile,
            "persistence": format!("{:?}", cfg.persistence_backend),
        }),
    );

    println!(
        "Server mode listening on http://{} (health: /healthz, runs: POST /v1/runs, history: GET /v1/sessions/{{id}}/runs)",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server listener")?;
    axum::serve(listener, build_server_router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown.cancel();
        })
        .await
        .context("server runtime failed")
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { println!("\nReceived Ctrl+C, shutting down gracefully..."); }
        _ = terminate => { println!("\nReceived SIGTERM, shutting down gracefully..."); }
    }
}
