use std::path::Path;

use anyhow::Result;

use crate::cli::MemoryBackend;
use crate::config::{RuntimeConfig, display_db_url};
use crate::delegation::delegation_tool_name;
use crate::history::SqliteHistoryStore;
use crate::memory::SqliteMemoryStore;
use crate::provider::{detect_provider, env_present};
use crate::registry::load_capabilities;
use crate::server::AUTH_TOKEN_ENV;

pub async fn run_doctor(cfg: &RuntimeConfig) -> Result<()> {
    println!(
        "Active profile: '{}' (config: {})",
        cfg.profile, cfg.config_path
    );

    let checks = [
        ("LLM_API_KEY", env_present("LLM_API_KEY")),
        ("OPENAI_API_KEY", env_present("OPENAI_API_KEY")),
        ("BASE_URL", env_present("BASE_URL")),
        ("OLLAMA_HOST", env_present("OLLAMA_HOST")),
        (AUTH_TOKEN_ENV, env_present(AUTH_TOKEN_ENV)),
    ];

    println!("Environment check:");
    for (key, ok) in checks {
        let status = if ok { "set" } else { "missing" };
        println!("- {key}: {status}");
    }

    match detect_provider(cfg) {
        Some(provider) => println!("Auto provider resolution: {:?}", provider),
        None => {
            println!("Auto provider resolution: none");
            println!("Tip: export LLM_API_KEY, set BASE_URL, or run with --provider ollama");
        }
    }
    println!(
        "Model: {} (provider setting: {:?})",
        cfg.model.as_deref().unwrap_or("<provider-default>"),
        cfg.provider
    );

    let registry = load_capabilities(Path::new(&cfg.capability_config))?;
    println!(
        "Capability config: {} ({} specialist(s), activation={:?})",
        cfg.capability_config,
        registry.len(),
        cfg.activation_policy
    );
    for capability in registry.values() {
        println!(
            "- {} -> {} via `{}`",
            capability.name,
            delegation_tool_name(&capability.name),
            capability.launch.command
        );
    }

    println!(
        "Memory: backend={:?} limit={} failure_policy={:?}",
        cfg.memory_backend, cfg.memory_limit, cfg.memory_failure_policy
    );
    if matches!(cfg.memory_backend, MemoryBackend::Sqlite) {
        SqliteMemoryStore::open(&cfg.memory_db_url).await?;
        println!(
            "SQLite memory DB check: ok ({})",
            display_db_url(cfg, &cfg.memory_db_url)
        );
    }

    SqliteHistoryStore::open(&cfg.history_db_url).await?;
    println!(
        "SQLite history DB check: ok ({}, window={})",
        display_db_url(cfg, &cfg.history_db_url),
        cfg.history_window
    );
    println!(
        "Timeouts: turn={}s specialist={}s max_tool_rounds={}",
        cfg.turn_timeout_secs, cfg.specialist_timeout_secs, cfg.max_tool_rounds
    );

    Ok(())
}
