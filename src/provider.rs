use std::sync::Arc;

use anyhow::{Context, Result};

use crate::cli::Provider;
use crate::config::RuntimeConfig;
use crate::llm::Llm;
use crate::openai::{DEFAULT_OPENAI_BASE_URL, OpenAiCompatibleConfig, OpenAiCompatibleModel};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_OLLAMA_MODEL: &str = "llama3.2";

pub fn resolve_model(cfg: &RuntimeConfig) -> Result<(Arc<dyn Llm>, Provider, String)> {
    let provider = match cfg.provider {
        Provider::Auto => detect_provider(cfg).context(
            "no provider could be auto-detected. Set OPENAI_API_KEY or LLM_API_KEY, \
             set BASE_URL for a compatible endpoint, or use --provider ollama",
        )?,
        p => p,
    };

    let (base_url, api_key, default_model) = match provider {
        Provider::Openai => {
            let api_key = first_env(&["LLM_API_KEY", "OPENAI_API_KEY"])
                .context("LLM_API_KEY or OPENAI_API_KEY is required for the OpenAI provider")?;
            let base_url = cfg
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string());
            (base_url, Some(api_key), DEFAULT_MODEL)
        }
        Provider::Ollama => {
            let host = std::env::var("OLLAMA_HOST")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| "http://localhost:11434".to_string());
            (ollama_base_url(&host), None, DEFAULT_OLLAMA_MODEL)
        }
        Provider::Compatible => {
            let base_url = cfg.base_url.clone().context(
                "the compatible provider requires --base-url, BASE_URL or profile.base_url",
            )?;
            (base_url, first_env(&["LLM_API_KEY"]), DEFAULT_MODEL)
        }
        Provider::Auto => unreachable!("auto provider must be resolved before matching"),
    };

    let model_name = cfg
        .model
        .clone()
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| default_model.to_string());
    let model = OpenAiCompatibleModel::new(OpenAiCompatibleConfig {
        base_url,
        api_key,
        model: model_name.clone(),
    })?;
    Ok((Arc::new(model), provider, model_name))
}

pub fn detect_provider(cfg: &RuntimeConfig) -> Option<Provider> {
    if cfg.base_url.is_some() {
        return Some(Provider::Compatible);
    }
    if env_present("LLM_API_KEY") || env_present("OPENAI_API_KEY") {
        return Some(Provider::Openai);
    }
    if env_present("OLLAMA_HOST") {
        return Some(Provider::Ollama);
    }
    None
}

pub fn env_present(key: &str) -> bool {
    std::env::var(key)
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false)
}

fn first_env(keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.trim().is_empty())
}

fn ollama_base_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.ends_with("/v1") {
        host.to_string()
    } else {
        format!("{host}/v1")
    }
}
