use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::cli::*;

pub const DEFAULT_USER_ID: &str = "default_user";
pub const DEFAULT_CAPABILITY_CONFIG: &str = "mcp_config.json";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub profile: String,
    pub config_path: String,
    pub provider: Provider,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub user_id: String,
    pub session_id: String,
    pub capability_config: String,
    pub activation_policy: ActivationPolicy,
    pub orchestrator_instruction: Option<String>,
    pub memory_backend: MemoryBackend,
    pub memory_db_url: String,
    pub memory_limit: usize,
    pub memory_failure_policy: MemoryFailurePolicy,
    pub history_db_url: String,
    pub history_window: usize,
    pub turn_timeout_secs: u64,
    pub specialist_timeout_secs: u64,
    pub max_tool_rounds: usize,
    pub show_sensitive_config: bool,
}

impl RuntimeConfig {
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    pub fn specialist_timeout(&self) -> Duration {
        Duration::from_secs(self.specialist_timeout_secs)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilesFile {
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileConfig {
    pub provider: Option<Provider>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub capability_config: Option<String>,
    pub activation_policy: Option<ActivationPolicy>,
    pub orchestrator_instruction: Option<String>,
    pub memory_backend: Option<MemoryBackend>,
    pub memory_db_url: Option<String>,
    pub memory_limit: Option<usize>,
    pub memory_failure_policy: Option<MemoryFailurePolicy>,
    pub history_db_url: Option<String>,
    pub history_window: Option<usize>,
    pub turn_timeout_secs: Option<u64>,
    pub specialist_timeout_secs: Option<u64>,
    pub max_tool_rounds: Option<usize>,
}

pub fn load_profiles(config_path: &str) -> Result<ProfilesFile> {
    let path = Path::new(config_path);
    if !path.exists() {
        return Ok(ProfilesFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read profile config file at '{}'", path.display()))?;
    toml::from_str::<ProfilesFile>(&content).with_context(|| {
        format!(
            "invalid profile configuration in '{}'. Check provider/memory values and field names.",
            path.display()
        )
    })
}

pub fn resolve_runtime_config(cli: &Cli, profiles: &ProfilesFile) -> Result<RuntimeConfig> {
    let selected = cli.profile.trim();
    if selected.is_empty() {
        return Err(anyhow::anyhow!(
            "profile name cannot be empty. Set --profile <name>."
        ));
    }

    let profile = if selected == "default" && !profiles.profiles.contains_key("default") {
        ProfileConfig::default()
    } else {
        profiles.profiles.get(selected).cloned().ok_or_else(|| {
            let mut names = profiles.profiles.keys().cloned().collect::<Vec<String>>();
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
        base_url: cli.base_url.clone().or(profile.base_url),
        user_id: cli
            .user_id
            .clone()
            .or(profile.user_id)
            .unwrap_or_else(|| DEFAULT_USER_ID.to_string()),
        session_id: cli
            .session_id
            .clone()
            .or(profile.session_id)
            .unwrap_or_else(|| "default-session".to_string()),
        capability_config: cli
            .capability_config
            .clone()
            .or(profile.capability_config)
            .unwrap_or_else(|| DEFAULT_CAPABILITY_CONFIG.to_string()),
        activation_policy: cli
            .activation_policy
            .or(profile.activation_policy)
            .unwrap_or(ActivationPolicy::Partial),
        orchestrator_instruction: profile
            .orchestrator_instruction
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
        memory_backend: cli
            .memory_backend
            .or(profile.memory_backend)
            .unwrap_or(MemoryBackend::Sqlite),
        memory_db_url: cli
            .memory_db_url
            .clone()
            .or(profile.memory_db_url)
            .unwrap_or_else(|| "sqlite://.strategist/memories.db".to_string()),
        memory_limit: cli
            .memory_limit
            .or(profile.memory_limit)
            .unwrap_or(3)
            .max(1),
        memory_failure_policy: cli
            .memory_failure_policy
            .or(profile.memory_failure_policy)
            .unwrap_or(MemoryFailurePolicy::Degrade),
        history_db_url: cli
            .history_db_url
            .clone()
            .or(profile.history_db_url)
            .unwrap_or_else(|| "sqlite://.strategist/history.db".to_string()),
        history_window: cli
            .history_window
            .or(profile.history_window)
            .unwrap_or(10)
            .max(1),
        turn_timeout_secs: cli
            .turn_timeout_secs
            .or(profile.turn_timeout_secs)
            .unwrap_or(120)
            .max(1),
        specialist_timeout_secs: cli
            .specialist_timeout_secs
            .or(profile.specialist_timeout_secs)
            .unwrap_or(90)
            .max(1),
        max_tool_rounds: cli
            .max_tool_rounds
            .or(profile.max_tool_rounds)
            .unwrap_or(8)
            .max(1),
        show_sensitive_config: cli.show_sensitive_config,
    })
}

pub fn display_db_url(cfg: &RuntimeConfig, url: &str) -> String {
    if cfg.show_sensitive_config {
        url.to_string()
    } else {
        format!(
            "{} (set --show-sensitive-config to reveal)",
            crate::error::redact_sqlite_url_value(url)
        )
    }
}
