use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Auto,
    Openai,
    Anthropic,
    Groq,
    Ollama,
    Echo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List configured profiles and highlight the active profile")]
    List,
    #[command(about = "Show the active profile's resolved runtime settings")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum AgentCommands {
    #[command(about = "List registered agent descriptors in priority order")]
    List,
}

#[derive(Debug, Subcommand)]
pub enum RunCommands {
    #[command(about = "List persisted runs for a session")]
    List {
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long, default_value_t = 20)]
        recent: usize,
    },
    #[command(about = "Print the final artifact of the most recent run in a session")]
    Last {
        #[arg(long)]
        session_id: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum TelemetryCommands {
    #[command(about = "Summarize telemetry events from a JSONL stream")]
    Report {
        #[arg(long)]
        path: Option<String>,
        #[arg(long, default_value_t = 5000)]
        limit: usize,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  baton run \"decide: adopt Tekton for CI on the cluster\"\n\
  baton --provider anthropic run --events \"analyze current storage classes\"\n\
  baton plan \"build a postgres operator overlay\"\n\
  baton agents list\n\
  baton --persistence sqlite runs list --session-id ops\n\
  baton serve --host 127.0.0.1 --port 8788\n\
  baton telemetry report --limit 2000\n\
\n\
Routing:\n\
  - The router classifies each request as build, analyze, decide or query.\n\
  - Unrecognized intents fall back to the default plan from [plans].default.\n\
  - Agents are registered in [agents.<name>] tables of the config file.";

#[derive(Debug, Parser)]
#[command(name = "baton")]
#[command(about = "Route a request through a pipeline of model-backed agents")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "BATON_PROVIDER", value_enum, default_value_t = Provider::Auto)]
    pub provider: Provider,

    #[arg(long, env = "BATON_MODEL")]
    pub model: Option<String>,

    #[arg(long, env = "BATON_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "BATON_CONFIG", default_value = ".baton/config.toml")]
    pub config_path: String,

    #[arg(long, env = "BATON_SESSION_ID")]
    pub session_id: Option<String>,

    #[arg(long, env = "BATON_PERSISTENCE", value_enum)]
    pub persistence: Option<PersistenceBackend>,

    #[arg(long, env = "BATON_DB_URL")]
    pub db_url: Option<String>,

    #[arg(long, env = "BATON_SHOW_SENSITIVE_CONFIG", default_value_t = false)]
    pub show_sensitive_config: bool,

    #[arg(long, env = "BATON_TOOL_TIMEOUT_SECS")]
    pub tool_timeout_secs: Option<u64>,

    #[arg(long, env = "BATON_MAX_CONCURRENT_TOOLS")]
    pub max_concurrent_tools: Option<usize>,

    #[arg(long, env = "BATON_RUN_DEADLINE_SECS")]
    pub run_deadline_secs: Option<u64>,

    #[arg(long, env = "BATON_STEP_TIMEOUT_SECS")]
    pub step_timeout_secs: Option<u64>,

    #[arg(long, env = "BATON_MAX_TOOL_ROUNDS")]
    pub max_tool_rounds: Option<u32>,

    #[arg(long, env = "BATON_WORKDIR")]
    pub workdir: Option<String>,

    #[arg(long = "allow-command", env = "BATON_ALLOW_COMMAND")]
    pub allow_command: Vec<String>,

    #[arg(long = "deny-command", env = "BATON_DENY_COMMAND")]
    pub deny_command: Vec<String>,

    #[arg(long, env = "BATON_TELEMETRY")]
    pub telemetry_enabled: Option<bool>,

    #[arg(long, env = "BATON_TELEMETRY_PATH")]
    pub telemetry_path: Option<String>,

    #[arg(long, env = "RUST_LOG", default_value = "warn")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run a request through the agent pipeline and print the final artifact")]
    Run {
        #[arg(required = true)]
        prompt: Vec<String>,
        #[arg(long, default_value_t = false, help = "Print progress events to stderr")]
        events: bool,
        #[arg(long, default_value_t = false, help = "Print the full run state as JSON")]
        json: bool,
    },
    #[command(about = "Classify a request and print the resolved plan without running it")]
    Plan {
        #[arg(required = true)]
        prompt: Vec<String>,
    },
    #[command(about = "Inspect the agent descriptor table")]
    Agents {
        #[command(subcommand)]
        command: AgentCommands,
    },
    #[command(about = "Inspect persisted runs")]
    Runs {
        #[command(subcommand)]
        command: RunCommands,
    },
    #[command(about = "Run HTTP server mode exposing the pipeline")]
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 8788)]
        port: u16,
        #[arg(long, env = "BATON_SERVER_TOKEN")]
        auth_token: Option<String>,
    },
    #[command(about = "Validate provider environment, policy and persistence configuration")]
    Doctor,
    #[command(about = "Run persistence migrations (sqlite only)")]
    Migrate,
    #[command(about = "Inspect profile configuration and active resolved profile state")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    #[command(about = "Inspect local telemetry")]
    Telemetry {
        #[command(subcommand)]
        command: TelemetryCommands,
    },
}
