use anyhow::Result;

use crate::config::{ProfilesFile, RuntimeConfig, display_db_url};

pub fn run_profiles_list(profiles: &ProfilesFile, cfg: &RuntimeConfig) -> Result<()> {
    let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
    if !names.iter().any(|name| name == "default") {
        names.push("default".to_string());
    }
    names.sort();

    println!("Configured profiles (active='{}'):", cfg.profile);
    for name in names {
        let marker = if name == cfg.profile { "*" } else { " " };
        let source = if profiles.profiles.contains_key(&name) {
            "configured"
        } else {
            "implicit"
        };
        println!("{marker} {name} ({source})");
    }

    Ok(())
}

pub fn run_profiles_show(cfg: &RuntimeConfig) -> Result<()> {
    println!("Active profile: {}", cfg.profile);
    println!("Config path: {}", cfg.config_path);
    println!("Provider: {:?}", cfg.provider);
    println!(
        "Model: {}",
        cfg.model.as_deref().unwrap_or("<provider-default>")
    );
    println!(
        "Base URL: {}",
        cfg.base_url.as_deref().unwrap_or("<provider-default>")
    );
    println!("User: {}", cfg.user_id);
    println!("Session ID: {}", cfg.session_id);
    println!("Capability config: {}", cfg.capability_config);
    println!("Activation policy: {:?}", cfg.activation_policy);
    println!(
        "Orchestrator instruction: {}",
        if cfg.orchestrator_instruction.is_some() {
            "custom"
        } else {
            "default"
        }
    );
    println!("Memory backend: {:?}", cfg.memory_backend);
    println!("Memory DB URL: {}", display_db_url(cfg, &cfg.memory_db_url));
    println!("Memory limit: {}", cfg.memory_limit);
    println!("Memory failure policy: {:?}", cfg.memory_failure_policy);
    println!("History DB URL: {}", display_db_url(cfg, &cfg.history_db_url));
    println!("History window: {}", cfg.history_window);
    println!("Turn timeout (secs): {}", cfg.turn_timeout_secs);
    println!("Specialist timeout (secs): {}", cfg.specialist_timeout_secs);
    println!("Max tool rounds: {}", cfg.max_tool_rounds);
    Ok(())
}
