use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::agents::descriptor::{AgentKind, ToolFailurePolicy};
use crate::cli::*;

pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_CONCURRENT_TOOLS: usize = 4;
pub const DEFAULT_RUN_DEADLINE_SECS: u64 = 600;
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 3;
pub const DEFAULT_MAX_COMMANDS_PER_ROUND: usize = 2;
pub const DEFAULT_MAX_OUTPUT_CHARS: usize = 8000;
pub const DEFAULT_PROVIDER_RETRY_ATTEMPTS: u32 = 2;
pub const DEFAULT_PROVIDER_RETRY_BACKOFF_MS: u64 = 500;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub provider: Provider,
    pub model: Option<String>,
    pub session_id: String,
    pub persistence_backend: PersistenceBackend,
    pub db_url: String,
    pub show_sensitive_config: bool,
    pub tool_timeout_secs: u64,
    pub max_concurrent_tools: usize,
    pub run_deadline_secs: u64,
    pub step_timeout_secs: u64,
    pub max_tool_rounds: u32,
    pub max_commands_per_round: usize,
    pub max_output_chars: usize,
    pub provider_retry_attempts: u32,
    pub provider_retry_backoff_ms: u64,
    pub workdir: Option<String>,
    pub allowed_workdirs: Vec<String>,
    pub allow_commands: Vec<String>,
    pub deny_commands: Vec<String>,
    pub telemetry_enabled: bool,
    pub telemetry_path: String,
    pub max_prompt_chars: usize,
    pub agents: HashMap<String, AgentFileConfig>,
    pub plans: PlansConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
    #[serde(default)]
    pub agents: HashMap<String, AgentFileConfig>,
    #[serde(default)]
    pub plans: PlansConfig,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub session_id: Option<String>,
    pub persistence: Option<PersistenceBackend>,
    pub db_url: Option<String>,
    pub tool_timeout_secs: Option<u64>,
    pub max_concurrent_tools: Option<usize>,
    pub run_deadline_secs: Option<u64>,
    pub step_timeout_secs: Option<u64>,
    pub max_tool_rounds: Option<u32>,
    pub max_commands_per_round: Option<usize>,
    pub max_output_chars: Option<usize>,
    pub provider_retry_attempts: Option<u32>,
    pub provider_retry_backoff_ms: Option<u64>,
    pub workdir: Option<String>,
    #[serde(default)]
    pub allowed_workdirs: Vec<String>,
    #[serde(default)]
    pub allow_commands: Vec<String>,
    #[serde(default)]
    pub deny_commands: Vec<String>,
    pub telemetry_enabled: Option<bool>,
    pub telemetry_path: Option<String>,
}

/// One `[agents.<name>]` table. Every field is optional so a table can either
/// tweak a built-in descriptor or register a new agent from scratch.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentFileConfig {
    pub kind: Option<AgentKind>,
    pub description: Option<String>,
    pub executor: Option<bool>,
    pub priority: Option<i32>,
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub timeout_secs: Option<u64>,
    pub max_tool_rounds: Option<u32>,
    pub tool_failure: Option<ToolFailurePolicy>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlansConfig {
    #[serde(default = "default_plan_names")]
    pub default: Vec<String>,
    pub build: Option<Vec<String>>,
    pub analyze: Option<Vec<String>>,
    pub decide: Option<Vec<String>>,
    pub query: Option<Vec<String>>,
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            default: default_plan_names(),
            build: None,
            analyze: None,
            decide: None,
            query: None,
        }
    }
}

pub fn default_plan_names() -> Vec<String> {
    ["planning", "research", "generation", "review"]
        .iter()
        .map(|name| name.to_string())
        .collect()
}

pub fn load_config_file(config_path: &str) -> Result<ConfigFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ConfigFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at '{}'", path.display()))?;
    parse_config_file(&content).with_context(|| {
        format!(
            "invalid configuration in '{}'. Check profile, agent and plan field names.",
            path.display()
        )
    })
}

pub fn parse_config_file(content: &str) -> Result<ConfigFile> {
    let parsed = toml::from_str::<ConfigFile>(content)?;
    Ok(parsed)
}

fn merge_unique_names(first: &[String], second: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::<String>::new();
    let mut merged = Vec::<String>::new();

    for name in first.iter().chain(second.iter()) {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            continue;
        }
        if seen.insert(trimmed.to_string()) {
            merged.push(trimmed.to_string());
        }
    }

    merged
}

pub fn resolve_runtime_config(cli: &Cli, file: &ConfigFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !file.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        file.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = file.profiles.keys().cloned().collect::<Vec<String>>();
            names.sort();
            if names.is_empty() {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. No profiles are defined yet.",
                    selected,
                    cli.config_path
                )
            } else {
                anyhow::anyhow!(
                    "profile '{}' not found in '{}'. Available profiles: {}",
                    selected,
                    cli.config_path,
                    names.join(", ")
                )
            }
        })?
    };

    if file.plans.default.iter().all(|name| name.trim().is_empty()) {
        return Err(anyhow::anyhow!(
            "[plans].default must name at least one agent"
        ));
    }

    let provider = if cli.provider != Provider::Auto {
        cli.provider
    } else {
        profile.provider.unwrap_or(Provider::Auto)
    };

    Ok(RuntimeConfig {
        profile: selected.to_string(),
        config_path: cli.config_path.clone(),
        provider,
        model: cli.model.clone().or(profile.model),
        session_id: cli
            .session_id
            .clone()
            .or(profile.session_id)
            .unwrap_or_else(|| "default-session".to_string()),
        persistence_backend: cli
            .persistence
            .or(profile.persistence)
            .unwrap_or(PersistenceBackend::Memory),
        db_url: cli
            .db_url
            .clone()
            .or(profile.db_url)
            .unwrap_or_else(|| "sqlite://.baton/runs.db".to_string()),
        show_sensitive_config: cli.show_sensitive_config,
        tool_timeout_secs: cli
            .tool_timeout_secs
            .or(profile.tool_timeout_secs)
            .unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS)
            .max(1),
        max_concurrent_tools: cli
            .max_concurrent_tools
            .or(profile.max_concurrent_tools)
            .unwrap_or(DEFAULT_MAX_CONCURRENT_TOOLS)
            .max(1),
        run_deadline_secs: cli
            .run_deadline_secs
            .or(profile.run_deadline_secs)
            .unwrap_or(DEFAULT_RUN_DEADLINE_SECS)
            .max(1),
        step_timeout_secs: cli
            .step_timeout_secs
            .or(profile.step_timeout_secs)
            .unwrap_or(DEFAULT_STEP_TIMEOUT_SECS)
            .max(1),
        max_tool_rounds: cli
            .max_tool_rounds
            .or(profile.max_tool_rounds)
            .unwrap_or(DEFAULT_MAX_TOOL_ROUNDS)
            .max(1),
        max_commands_per_round: profile
            .max_commands_per_round
            .unwrap_or(DEFAULT_MAX_COMMANDS_PER_ROUND)
            .max(1),
        max_output_chars: profile
            .max_output_chars
            .unwrap_or(DEFAULT_MAX_OUTPUT_CHARS)
            .max(128),
        provider_retry_attempts: profile
            .provider_retry_attempts
            .unwrap_or(DEFAULT_PROVIDER_RETRY_ATTEMPTS),
        provider_retry_backoff_ms: profile
            .provider_retry_backoff_ms
            .unwrap_or(DEFAULT_PROVIDER_RETRY_BACKOFF_MS),
        workdir: cli.workdir.clone().or(profile.workdir),
        allowed_workdirs: merge_unique_names(&profile.allowed_workdirs, &[]),
        allow_commands: merge_unique_names(&profile.allow_commands, &cli.allow_command),
        deny_commands: merge_unique_names(&profile.deny_commands, &cli.deny_command),
        telemetry_enabled: cli
            .telemetry_enabled
            .or(profile.telemetry_enabled)
            .unwrap_or(true),
        telemetry_path: cli
            .telemetry_path
            .clone()
            .or(profile.telemetry_path)
            .unwrap_or_else(|| ".baton/telemetry/events.jsonl".to_string()),
        max_prompt_chars: 32_000,
        agents: file.agents.clone(),
        plans: file.plans.clone(),
    })
}

pub fn display_db_url(cfg: &RuntimeConfig) -> String {
    if cfg.show_sensitive_config {
        cfg.db_url.clone()
    } else {
        format!(
            "{} (set --show-sensitive-config to reveal)",
            crate::error::redact_sqlite_url_value(&cfg.db_url)
        )
    }
}
