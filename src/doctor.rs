use anyhow::Result;

use crate::agents::descriptor::DescriptorTable;
use crate::agents::router::Router;
use crate::cli::{PersistenceBackend, Provider};
use crate::config::{RuntimeConfig, display_db_url};
use crate::provider::{EchoProvider, detect_provider, env_present};
use crate::session::SqliteRunStore;

pub async fn run_doctor(cfg: &RuntimeConfig) -> Result<()> {
    println!(
        "Active profile: '{}' (config: {})",
        cfg.profile, cfg.config_path
    );

    let checks = [
        ("ANTHROPIC_API_KEY", env_present("ANTHROPIC_API_KEY")),
        ("OPENAI_API_KEY", env_present("OPENAI_API_KEY")),
        ("GROQ_API_KEY", env_present("GROQ_API_KEY")),
        ("OLLAMA_HOST", env_present("OLLAMA_HOST")),
    ];

    println!("Provider environment check:");
    for (key, ok) in checks {
        let status = if ok { "set" } else { "missing" };
        println!("- {key}: {status}");
    }

    if cfg.provider == Provider::Auto {
        match detect_provider() {
            Some(provider) => println!("Auto provider resolution: {:?}", provider),
            None => {
                println!("Auto provider resolution: none");
                println!("Tip: export one provider key or run with --provider echo");
            }
        }
    } else {
        println!("Provider: {:?} (explicit)", cfg.provider);
    }

    let table = DescriptorTable::from_config(&cfg.agents)?;
    // Router construction validates every plan template against the table.
    Router::new(std::sync::Arc::new(EchoProvider), &table, &cfg.plans)?;
    let executors = table
        .all()
        .iter()
        .filter(|d| d.executor)
        .map(|d| d.name.clone())
        .collect::<Vec<_>>();
    println!(
        "Agents: {} registered, executor-enabled: {}",
        table.all().len(),
        if executors.is_empty() {
            "<none>".to_string()
        } else {
            executors.join(", ")
        }
    );
    println!("Plans: default=[{}] (all templates resolve)", cfg.plans.default.join(", "));

    println!(
        "Executor: timeout_secs={} max_concurrent={} max_tool_rounds={} max_commands_per_round={}",
        cfg.tool_timeout_secs,
        cfg.max_concurrent_tools,
        cfg.max_tool_rounds,
        cfg.max_commands_per_round
    );
    println!(
        "Command policy: allow={} deny={} workdir_roots={} workdir={}",
        cfg.allow_commands.len(),
        cfg.deny_commands.len(),
        cfg.allowed_workdirs.len(),
        cfg.workdir.as_deref().unwrap_or("<current directory>")
    );
    println!(
        "Deadlines: run_secs={} step_secs={} provider_retries={} backoff_ms={}",
        cfg.run_deadline_secs,
        cfg.step_timeout_secs,
        cfg.provider_retry_attempts,
        cfg.provider_retry_backoff_ms
    );
    println!(
        "Telemetry: enabled={} path={}",
        cfg.telemetry_enabled, cfg.telemetry_path
    );
    println!(
        "Persistence: {:?} (session_id: {})",
        cfg.persistence_backend, cfg.session_id
    );

    if cfg.persistence_backend == PersistenceBackend::Sqlite {
        SqliteRunStore::open(&cfg.db_url).await?;
        println!("SQLite run store check: ok ({})", display_db_url(cfg));
    }

    Ok(())
}
