use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::cli::{ActivationPolicy, Provider};
use crate::config::RuntimeConfig;
use crate::delegation::{build_delegation_tools, delegation_tool_name};
use crate::llm::Llm;
use crate::mcp::McpConnector;
use crate::memory::{MemoryAugmentation, MemoryStore, build_memory_store};
use crate::orchestrator::{ORCHESTRATOR_INSTRUCTION, Orchestrator, OrchestratorSettings};
use crate::provider::resolve_model;
use crate::registry::{CapabilityRegistry, load_capabilities};
use crate::specialist::{SpecialistPool, SpecialistSettings, activate_specialists};

/// Everything a session needs, built once at startup and shared by the
/// interactive loop and the server.
pub struct AppContext {
    pub cfg: RuntimeConfig,
    pub provider: Provider,
    pub model_name: String,
    pub registry: CapabilityRegistry,
    pub specialists: SpecialistPool,
    pub orchestrator: Orchestrator,
}

impl AppContext {
    pub async fn start(cfg: RuntimeConfig) -> Result<Self> {
        let registry = load_capabilities(Path::new(&cfg.capability_config))?;
        let (model, provider, model_name) = resolve_model(&cfg)?;
        tracing::info!(provider = ?provider, model = %model_name, "Using model");

        let memory_store = build_memory_store(&cfg).await?;
        let specialists = activate_specialists(
            &registry,
            &McpConnector,
            model.clone(),
            specialist_settings(&cfg),
            cfg.activation_policy,
        )
        .await?;
        if specialists.is_empty() && !registry.is_empty() {
            tracing::warn!(
                configured = registry.len(),
                "No specialists could be activated; the orchestrator will answer on its own"
            );
        }

        Ok(Self::assemble(
            cfg,
            provider,
            model_name,
            registry,
            specialists,
            model,
            memory_store,
        ))
    }

    pub fn assemble(
        cfg: RuntimeConfig,
        provider: Provider,
        model_name: String,
        registry: CapabilityRegistry,
        specialists: SpecialistPool,
        model: Arc<dyn Llm>,
        memory_store: Arc<dyn MemoryStore>,
    ) -> Self {
        let memory = MemoryAugmentation::new(
            memory_store,
            cfg.memory_limit,
            cfg.memory_failure_policy,
        );
        let orchestrator = Orchestrator::new(
            model,
            build_delegation_tools(&specialists),
            memory,
            OrchestratorSettings {
                instruction: cfg
                    .orchestrator_instruction
                    .clone()
                    .unwrap_or_else(|| ORCHESTRATOR_INSTRUCTION.to_string()),
                inference_timeout: cfg.turn_timeout(),
                max_tool_rounds: cfg.max_tool_rounds,
            },
        );

        Self {
            cfg,
            provider,
            model_name,
            registry,
            specialists,
            orchestrator,
        }
    }

    pub async fn shutdown(&self) {
        self.specialists.shutdown().await;
        tracing::info!(specialists = self.specialists.len(), "Specialist connections released");
    }
}

pub fn specialist_settings(cfg: &RuntimeConfig) -> SpecialistSettings {
    SpecialistSettings {
        timeout: cfg.specialist_timeout(),
        max_tool_rounds: cfg.max_tool_rounds,
    }
}

pub fn run_specialists_list(cfg: &RuntimeConfig) -> Result<()> {
    let registry = load_capabilities(Path::new(&cfg.capability_config))?;
    if registry.is_empty() {
        println!("No specialists configured in '{}'.", cfg.capability_config);
        return Ok(());
    }

    println!("Configured specialists ({}):", cfg.capability_config);
    for capability in registry.values() {
        let args = capability.launch.args.join(" ");
        println!(
            "- {} -> {}: {} {}",
            capability.name,
            delegation_tool_name(&capability.name),
            capability.launch.command,
            args
        );
    }
    Ok(())
}

/// Launches every configured specialist, reports which came up, and
/// releases them again.
pub async fn run_specialists_check(cfg: &RuntimeConfig) -> Result<()> {
    let registry = load_capabilities(Path::new(&cfg.capability_config))?;
    let (model, _, _) = resolve_model(cfg)?;
    let pool = activate_specialists(
        &registry,
        &McpConnector,
        model,
        specialist_settings(cfg),
        ActivationPolicy::Partial,
    )
    .await?;

    println!(
        "Specialist check: {}/{} active",
        pool.len(),
        registry.len()
    );
    for specialist in pool.iter() {
        println!(
            "- {} [ok]: {}",
            specialist.name(),
            specialist.tool_names().join(", ")
        );
    }
    for failure in pool.failures() {
        println!("- {} [failed]: {}", failure.specialist, failure.reason);
    }
    pool.shutdown().await;

    if !pool.failures().is_empty() && matches!(cfg.activation_policy, ActivationPolicy::Strict) {
        anyhow::bail!(
            "{} specialist(s) failed to activate under the strict activation policy",
            pool.failures().len()
        );
    }
    Ok(())
}
