use anyhow::Result;

use crate::agents::descriptor::DescriptorTable;
use crate::config::{ConfigFile, RuntimeConfig, display_db_url};

pub fn run_profiles_list(file: &ConfigFile, cfg: &RuntimeConfig) -> Result<()> {
    let mut names = file.profiles.keys().cloned().collect::<Vec<String>>();
    if !names.iter().any(|name| name == "default") {
        names.push("default".to_string());
    }
    names.sort();

    println!("Configured profiles (active='{}'):", cfg.profile);
    for name in names {
        let marker = if name == cfg.profile { "*" } else { " " };
        let source = if file.profiles.contains_key(&name) {
            "configured"
        } else {
            "implicit"
        };
        println!("{marker} {name} ({source})");
    }

    Ok(())
}

fn list_or_none(values: &[String]) -> String {
    if values.is_empty() {
        "<none>".to_string()
    } else {
        values.join(", ")
    }
}

pub fn run_profiles_show(cfg: &RuntimeConfig) -> Result<()> {
    println!("Active profile: {}", cfg.profile);
    println!("Config path: {}", cfg.config_path);
    println!("Provider: {:?}", cfg.provider);
    println!(
        "Model: {}",
        cfg.model.as_deref().unwrap_or("<provider-default>")
    );
    println!("Session ID: {}", cfg.session_id);
    println!("Persistence backend: {:?}", cfg.persistence_backend);
    println!("Persistence DB URL: {}", display_db_url(cfg));
    println!("Tool timeout (secs): {}", cfg.tool_timeout_secs);
    println!("Max concurrent tools: {}", cfg.max_concurrent_tools);
    println!("Max tool rounds: {}", cfg.max_tool_rounds);
    println!("Max commands per round: {}", cfg.max_commands_per_round);
    println!("Max output chars: {}", cfg.max_output_chars);
    println!("Run deadline (secs): {}", cfg.run_deadline_secs);
    println!("Step timeout (secs): {}", cfg.step_timeout_secs);
    println!(
        "Provider retries: {} (backoff {} ms)",
        cfg.provider_retry_attempts, cfg.provider_retry_backoff_ms
    );
    println!(
        "Workdir: {}",
        cfg.workdir.as_deref().unwrap_or("<current directory>")
    );
    println!("Allowed workdirs: {}", list_or_none(&cfg.allowed_workdirs));
    println!("Allow commands: {}", list_or_none(&cfg.allow_commands));
    println!("Deny commands: {}", list_or_none(&cfg.deny_commands));
    println!("Telemetry enabled: {}", cfg.telemetry_enabled);
    println!("Telemetry path: {}", cfg.telemetry_path);
    println!("Default plan: {}", list_or_none(&cfg.plans.default));
    println!("Agent overrides: {}", cfg.agents.len());
    Ok(())
}

pub fn run_agents_list(cfg: &RuntimeConfig) -> Result<()> {
    let table = DescriptorTable::from_config(&cfg.agents)?;
    println!("Registered agents (priority order):");
    for descriptor in table.all() {
        let overrides = if cfg.agents.contains_key(&descriptor.name) {
            " [configured]"
        } else {
            ""
        };
        println!(
            "- {} kind={} priority={} executor={} timeout={} tool_failure={:?}{}",
            descriptor.name,
            descriptor.kind.as_str(),
            descriptor.priority,
            descriptor.executor,
            descriptor
                .timeout_secs
                .map(|t| format!("{t}s"))
                .unwrap_or_else(|| "default".to_string()),
            descriptor.tool_failure,
            overrides
        );
        println!("    {}", descriptor.description);
    }
    Ok(())
}
