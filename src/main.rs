use anyhow::Result;
use clap::Parser;
use tracing::level_filters::LevelFilter;

use strategist_cli::app::{AppContext, run_specialists_check, run_specialists_list};
use strategist_cli::chat::run_chat;
use strategist_cli::cli::{
    Cli, Commands, MemoryCommands, ProfileCommands, ServerCommands, SessionCommands,
    SpecialistCommands, command_label,
};
use strategist_cli::config::{RuntimeConfig, load_profiles, resolve_runtime_config};
use strategist_cli::doctor::run_doctor;
use strategist_cli::error::{categorize_error, format_cli_error};
use strategist_cli::history::run_sessions_show;
use strategist_cli::memory::{run_memory_add, run_memory_search};
use strategist_cli::profiles::{run_profiles_list, run_profiles_show};
use strategist_cli::server::run_server;
use strategist_cli::streaming::run_ask;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let show_sensitive = cli.show_sensitive_config;
    if let Err(err) = run_cli(cli).await {
        eprintln!("{}", format_cli_error(&err, show_sensitive));
        tracing::error!(category = %categorize_error(&err).code(), error = %err, "command failed");
        std::process::exit(1);
    }

    Ok(())
}

async fn run_cli(cli: Cli) -> Result<()> {
    init_tracing(&cli.log_filter)?;
    let profiles = load_profiles(&cli.config_path)?;
    let cfg = resolve_runtime_config(&cli, &profiles)?;

    let Some(command) = cli.command else {
        return run_interactive(cfg).await;
    };
    tracing::info!(command = %command_label(&command), profile = %cfg.profile, "Running command");

    match command {
        Commands::Ask { prompt } => {
            let app = AppContext::start(cfg).await?;
            let result = run_ask(&app, &prompt.join(" ")).await;
            app.shutdown().await;
            result?;
        }
        Commands::Chat => run_interactive(cfg).await?,
        Commands::Doctor => run_doctor(&cfg).await?,
        Commands::Specialists { command } => match command {
            SpecialistCommands::List => run_specialists_list(&cfg)?,
            SpecialistCommands::Check => run_specialists_check(&cfg).await?,
        },
        Commands::Profiles { command } => match command {
            ProfileCommands::List => run_profiles_list(&profiles, &cfg)?,
            ProfileCommands::Show => run_profiles_show(&cfg)?,
        },
        Commands::Sessions { command } => match command {
            SessionCommands::Show { session_id, recent } => {
                run_sessions_show(&cfg, session_id, recent).await?
            }
        },
        Commands::Memory { command } => match command {
            MemoryCommands::Search { query, limit } => {
                run_memory_search(&cfg, &query.join(" "), limit).await?
            }
            MemoryCommands::Add { text } => run_memory_add(&cfg, &text.join(" ")).await?,
        },
        Commands::Server { command } => match command {
            ServerCommands::Serve { host, port } => run_server(cfg, host, port).await?,
        },
    }

    Ok(())
}

async fn run_interactive(cfg: RuntimeConfig) -> Result<()> {
    let app = AppContext::start(cfg).await?;
    let result = run_chat(&app).await;
    app.shutdown().await;
    result
}

fn init_tracing(log_filter: &str) -> Result<()> {
    let level = log_filter
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_env_filter(log_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing subscriber: {e}"))
}
