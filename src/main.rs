use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use baton_cli::agents::descriptor::DescriptorTable;
use baton_cli::agents::pipeline::{Pipeline, ProgressEvent, ROUTER_AGENT};
use baton_cli::agents::router::Router;
use baton_cli::agents::state::Request;
use baton_cli::cli::*;
use baton_cli::config::{RuntimeConfig, load_config_file, resolve_runtime_config};
use baton_cli::doctor::run_doctor;
use baton_cli::error::{categorize_error, format_cli_error};
use baton_cli::profiles::{run_agents_list, run_profiles_list, run_profiles_show};
use baton_cli::provider::ProviderRegistry;
use baton_cli::server::run_server;
use baton_cli::session::{run_migrate, run_runs_last, run_runs_list};
use baton_cli::telemetry::{TelemetrySink, run_telemetry_report};
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let show_sensitive_config = cli.show_sensitive_config;
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err, show_sensitive_config));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let file = load_config_file(&cli.config_path)?;
    let cfg = Arc::new(resolve_runtime_config(&cli, &file)?);

    match cli.command {
        Commands::Run {
            prompt,
            events,
            json,
        } => {
            run_request(cfg, prompt.join(" "), events, json).await?;
        }
        Commands::Plan { prompt } => {
            print_plan(&cfg, prompt.join(" ")).await?;
        }
        Commands::Agents { command } => match command {
            AgentCommands::List => run_agents_list(&cfg)?,
        },
        Commands::Runs { command } => match command {
            RunCommands::List { session_id, recent } => {
                run_runs_list(&cfg, session_id, recent).await?
            }
            RunCommands::Last { session_id } => run_runs_last(&cfg, session_id).await?,
        },
        Commands::Serve {
            host,
            port,
            auth_token,
        } => {
            let telemetry = TelemetrySink::new(&cfg, "serve".to_string());
            run_server(cfg.clone(), host, port, auth_token, &telemetry).await?;
        }
        Commands::Doctor => {
            run_doctor(&cfg).await?;
        }
        Commands::Migrate => {
            run_migrate(&cfg).await?;
        }
        Commands::Profiles { command } => match command {
            ProfileCommands::List => run_profiles_list(&file, &cfg)?,
            ProfileCommands::Show => run_profiles_show(&cfg)?,
        },
        Commands::Telemetry { command } => match command {
            TelemetryCommands::Report { path, limit } => run_telemetry_report(&cfg, path, limit)?,
        },
    }

    Ok(())
}

fn validate_prompt(cfg: &RuntimeConfig, prompt: &str) -> Result<()> {
    if prompt.trim().is_empty() {
        return Err(anyhow::anyhow!("prompt cannot be empty"));
    }
    let chars = prompt.chars().count();
    if chars > cfg.max_prompt_chars {
        return Err(anyhow::anyhow!(
            "prompt is {} characters; the limit is {}",
            chars,
            cfg.max_prompt_chars
        ));
    }
    Ok(())
}

async fn run_request(cfg: Arc<RuntimeConfig>, prompt: String, events: bool, json: bool) -> Result<()> {
    validate_prompt(&cfg, &prompt)?;
    let pipeline = Pipeline::from_config(cfg.clone(), "run").await?;

    let cancel = CancellationToken::new();
    let ctrl_c_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl+C, cancelling run...");
            ctrl_c_token.cancel();
        }
    });

    let (progress, printer) = if events {
        let (tx, mut rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let printer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match serde_json::to_string(&event) {
                    Ok(line) => eprintln!("{line}"),
                    Err(err) => tracing::warn!(error = %err, "failed to encode progress event"),
                }
            }
        });
        (Some(tx), Some(printer))
    } else {
        (None, None)
    };

    let outcome = pipeline
        .submit(Request::new(cfg.session_id.clone(), prompt), cancel, progress)
        .await;

    if let Some(printer) = printer {
        let _ = printer.await;
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&outcome.state)?);
    } else {
        println!("{}", outcome.artifact);
    }

    Ok(())
}

async fn print_plan(cfg: &RuntimeConfig, prompt: String) -> Result<()> {
    validate_prompt(cfg, &prompt)?;
    let table = DescriptorTable::from_config(&cfg.agents)?;
    let providers = ProviderRegistry::from_config(cfg, &table)?;
    let router = Router::new(providers.for_agent(ROUTER_AGENT), &table, &cfg.plans)?;
    let plan = router
        .route(
            &Request::new(cfg.session_id.clone(), prompt),
            Duration::from_secs(cfg.step_timeout_secs),
        )
        .await;

    println!(
        "Intent: {}{}",
        plan.routing.intent.as_deref().unwrap_or("<none>"),
        if plan.routing.fallback {
            " (default plan)"
        } else {
            ""
        }
    );
    if let Some(reason) = &plan.routing.reason {
        println!("Reason: {reason}");
    }
    println!("Plan:");
    for (index, descriptor) in plan.agents.iter().enumerate() {
        println!(
            "{}. {} (kind={}, priority={}, executor={})",
            index + 1,
            descriptor.name,
            descriptor.kind.as_str(),
            descriptor.priority,
            descriptor.executor
        );
    }
    println!("Then: {}", table.synthesis().name);
    Ok(())
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}
