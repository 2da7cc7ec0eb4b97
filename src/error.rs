use thiserror::Error;

use crate::provider::ProviderError;

/// Failures the pipeline records against a step or a tool invocation.
///
/// None of these escape a run: the driver stores them in the run state and
/// the synthesizer renders them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("command timed out after {timeout_secs}s")]
    ToolTimeout { timeout_secs: u64 },

    #[error("failed to spawn command: {0}")]
    ToolSpawnFailure(String),

    #[error("command denied by policy: {0}")]
    PolicyDenied(String),

    #[error("routing was ambiguous ({0}); using the default plan")]
    RoutingAmbiguous(String),

    #[error("agent requested tools for more than {max_rounds} rounds")]
    ToolRoundsExceeded { max_rounds: u32 },

    #[error("step exceeded its {timeout_secs}s timeout")]
    StepTimeout { timeout_secs: u64 },

    #[error("run deadline of {deadline_secs}s exceeded")]
    RunDeadlineExceeded { deadline_secs: u64 },

    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Provider(_) => "provider_error",
            PipelineError::ToolTimeout { .. } => "tool_timeout",
            PipelineError::ToolSpawnFailure(_) => "tool_spawn_failure",
            PipelineError::PolicyDenied(_) => "policy_denied",
            PipelineError::RoutingAmbiguous(_) => "routing_ambiguous",
            PipelineError::ToolRoundsExceeded { .. } => "tool_rounds_exceeded",
            PipelineError::StepTimeout { .. } => "step_timeout",
            PipelineError::RunDeadlineExceeded { .. } => "run_deadline_exceeded",
            PipelineError::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Provider,
    Persistence,
    Tooling,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Provider => "PROVIDER",
            ErrorCategory::Persistence => "PERSISTENCE",
            ErrorCategory::Tooling => "TOOLING",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Provider => {
                "Set provider credentials (for example ANTHROPIC_API_KEY) or run with --provider echo."
            }
            ErrorCategory::Persistence => {
                "Check --persistence/--db-url and run migrate for sqlite persistence."
            }
            ErrorCategory::Tooling => {
                "Review command policy settings and retry with RUST_LOG=info for executor logs."
            }
            ErrorCategory::Input => "Run baton --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("api_key")
        || msg.contains("no provider could be auto-detected")
        || msg.contains("provider")
    {
        return ErrorCategory::Provider;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("profile")
        || msg.contains("prompt")
        || msg.contains("unknown agent")
        || msg.contains("[plans]")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("persist") || msg.contains("sqlite") || msg.contains("migrat") {
        return ErrorCategory::Persistence;
    }

    if msg.contains("tool") || msg.contains("command") || msg.contains("policy") {
        return ErrorCategory::Tooling;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let category = categorize_error(err);
    let rendered_error = render_error_message(err, show_sensitive_config);
    format!(
        "[{}] {}\nHint: {}",
        category.code(),
        rendered_error,
        category.hint()
    )
}

pub fn render_error_message(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let rendered = format!("{err:#}");
    if show_sensitive_config {
        rendered
    } else {
        redact_sqlite_urls(&rendered)
    }
}

pub fn redact_sqlite_urls(text: &str) -> String {
    const SQLITE_PREFIX: &str = "sqlite:";
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;

    while let Some(offset) = text[cursor..].find(SQLITE_PREFIX) {
        let start = cursor + offset;
        out.push_str(&text[cursor..start]);

        let remainder = &text[start..];
        let end = remainder
            .find(|ch: char| {
                ch.is_whitespace()
                    || matches!(
                        ch,
                        '"' | '\'' | '(' | ')' | '[' | ']' | '{' | '}' | ',' | ';'
                    )
            })
            .unwrap_or(remainder.len());
        let token = &remainder[..end];
        out.push_str(&redact_sqlite_url_value(token));
        cursor = start + end;
    }

    out.push_str(&text[cursor..]);
    out
}

pub fn redact_sqlite_url_value(value: &str) -> String {
    if value.starts_with("sqlite://") {
        "sqlite://[REDACTED]".to_string()
    } else if value.starts_with("sqlite:") {
        "sqlite:[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}
