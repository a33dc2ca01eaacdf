use clap::{Parser, Subcommand, ValueEnum};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Auto,
    Openai,
    Ollama,
    Compatible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryBackend {
    Disabled,
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryFailurePolicy {
    Degrade,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationPolicy {
    Partial,
    Strict,
}

#[derive(Debug, Subcommand)]
pub enum SpecialistCommands {
    #[command(about = "List configured specialists and their delegation tool names")]
    List,
    #[command(about = "Activate every specialist and report connection status")]
    Check,
}

#[derive(Debug, Subcommand)]
pub enum ProfileCommands {
    #[command(about = "List profiles defined in the profile config file")]
    List,
    #[command(about = "Show the resolved runtime configuration")]
    Show,
}

#[derive(Debug, Subcommand)]
pub enum SessionCommands {
    #[command(about = "Show the persisted message log for a session")]
    Show {
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long, default_value_t = 20)]
        recent: usize,
    },
}

#[derive(Debug, Subcommand)]
pub enum MemoryCommands {
    #[command(about = "Search long-term memories for the active user")]
    Search {
        #[arg(required = true)]
        query: Vec<String>,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    #[command(about = "Store a memory for the active user")]
    Add {
        #[arg(required = true)]
        text: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
pub enum ServerCommands {
    #[command(about = "Run the HTTP orchestrator endpoint")]
    Serve {
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        #[arg(long, env = "PORT", default_value_t = 8001)]
        port: u16,
    },
}

const CLI_EXAMPLES: &str = "Examples:\n\
  strategist chat\n\
  strategist ask \"Summarize open issues in our roadmap repo\"\n\
  strategist --capability-config mcp_config.json specialists list\n\
  strategist specialists check\n\
  strategist --profile ops profiles show\n\
  strategist --memory-backend sqlite memory search \"pricing\"\n\
  strategist server serve --port 8001\n\
  strategist --history-db-url sqlite://.strategist/history.db sessions show --session-id s-1\n\
\n\
Exit interactive chat with exit, quit, bye or goodbye.";

#[derive(Debug, Parser)]
#[command(name = "strategist")]
#[command(about = "Orchestrator that delegates requests to MCP-backed specialist agents")]
#[command(after_long_help = CLI_EXAMPLES)]
pub struct Cli {
    #[arg(long, env = "STRATEGIST_PROVIDER", value_enum, default_value_t = Provider::Auto)]
    pub provider: Provider,

    #[arg(long, env = "MODEL_CHOICE")]
    pub model: Option<String>,

    #[arg(long, env = "BASE_URL")]
    pub base_url: Option<String>,

    #[arg(long, env = "STRATEGIST_PROFILE", default_value = "default")]
    pub profile: String,

    #[arg(long, env = "STRATEGIST_CONFIG", default_value = ".strategist/config.toml")]
    pub config_path: String,

    #[arg(long, env = "STRATEGIST_CAPABILITY_CONFIG")]
    pub capability_config: Option<String>,

    #[arg(long, env = "STRATEGIST_ACTIVATION_POLICY", value_enum)]
    pub activation_policy: Option<ActivationPolicy>,

    #[arg(long, env = "STRATEGIST_USER_ID")]
    pub user_id: Option<String>,

    #[arg(long, env = "STRATEGIST_SESSION_ID")]
    pub session_id: Option<String>,

    #[arg(long, env = "STRATEGIST_MEMORY_BACKEND", value_enum)]
    pub memory_backend: Option<MemoryBackend>,

    #[arg(long, env = "STRATEGIST_MEMORY_DB_URL")]
    pub memory_db_url: Option<String>,

    #[arg(long, env = "STRATEGIST_MEMORY_LIMIT")]
    pub memory_limit: Option<usize>,

    #[arg(long, env = "STRATEGIST_MEMORY_FAILURE_POLICY", value_enum)]
    pub memory_failure_policy: Option<MemoryFailurePolicy>,

    #[arg(long, env = "STRATEGIST_HISTORY_DB_URL")]
    pub history_db_url: Option<String>,

    #[arg(long, env = "STRATEGIST_HISTORY_WINDOW")]
    pub history_window: Option<usize>,

    #[arg(long, env = "STRATEGIST_TURN_TIMEOUT_SECS")]
    pub turn_timeout_secs: Option<u64>,

    #[arg(long, env = "STRATEGIST_SPECIALIST_TIMEOUT_SECS")]
    pub specialist_timeout_secs: Option<u64>,

    #[arg(long, env = "STRATEGIST_MAX_TOOL_ROUNDS")]
    pub max_tool_rounds: Option<usize>,

    #[arg(long, env = "STRATEGIST_SHOW_SENSITIVE_CONFIG", default_value_t = false)]
    pub show_sensitive_config: bool,

    #[arg(long, env = "RUST_LOG", default_value = "error")]
    pub log_filter: String,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Run a single orchestrated turn and print the final response")]
    Ask {
        #[arg(required = true)]
        prompt: Vec<String>,
    },
    #[command(about = "Run the interactive orchestrator session (default)")]
    Chat,
    #[command(about = "Validate provider environment, capability config and stores")]
    Doctor,
    #[command(about = "Inspect configured specialists")]
    Specialists {
        #[command(subcommand)]
        command: SpecialistCommands,
    },
    #[command(about = "Inspect configuration profiles")]
    Profiles {
        #[command(subcommand)]
        command: ProfileCommands,
    },
    #[command(about = "Inspect persisted conversation sessions")]
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },
    #[command(about = "Search or seed long-term memory")]
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },
    #[command(about = "Networked orchestrator endpoint")]
    Server {
        #[command(subcommand)]
        command: ServerCommands,
    },
}

pub fn command_label(command: &Commands) -> String {
    match command {
        Commands::Ask { .. } => "ask".to_string(),
        Commands::Chat => "chat".to_string(),
        Commands::Doctor => "doctor".to_string(),
        Commands::Specialists { command } => match command {
            SpecialistCommands::List => "specialists.list".to_string(),
            SpecialistCommands::Check => "specialists.check".to_string(),
        },
        Commands::Profiles { command } => match command {
            ProfileCommands::List => "profiles.list".to_string(),
            ProfileCommands::Show => "profiles.show".to_string(),
        },
        Commands::Sessions { command } => match command {
            SessionCommands::Show { .. } => "sessions.show".to_string(),
        },
        Commands::Memory { command } => match command {
            MemoryCommands::Search { .. } => "memory.search".to_string(),
            MemoryCommands::Add { .. } => "memory.add".to_string(),
        },
        Commands::Server { command } => match command {
            ServerCommands::Serve { .. } => "server.serve".to_string(),
        },
    }
}
