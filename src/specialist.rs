//! Specialist agents: one model-driven agent per capability, each bound to
//! the tools exposed by its own backing connection.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::agent::{AgentInput, LlmAgent};
use crate::cli::ActivationPolicy;
use crate::error::{ActivationError, SpecialistError, TurnError};
use crate::llm::Llm;
use crate::registry::{Capability, CapabilityRegistry};
use crate::tool::ToolTable;

/// A live connection to a capability's backing server.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    fn tools(&self) -> ToolTable;

    async fn is_alive(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, capability: &Capability) -> Result<Arc<dyn ToolBackend>>;
}

#[derive(Debug, Clone, Copy)]
pub struct SpecialistSettings {
    pub timeout: Duration,
    pub max_tool_rounds: usize,
}

pub struct SpecialistAgent {
    name: String,
    agent: LlmAgent,
    backend: Arc<dyn ToolBackend>,
    timeout: Duration,
    released: AtomicBool,
}

impl SpecialistAgent {
    pub fn new(
        capability: &Capability,
        model: Arc<dyn Llm>,
        backend: Arc<dyn ToolBackend>,
        settings: SpecialistSettings,
    ) -> Self {
        let agent = LlmAgent::new(
            capability.name.clone(),
            capability.instructions.clone(),
            model,
            backend.tools(),
        )
        .with_max_tool_rounds(settings.max_tool_rounds)
        .with_inference_timeout(settings.timeout);

        Self {
            name: capability.name.clone(),
            agent,
            backend,
            timeout: settings.timeout,
            released: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instructions(&self) -> &str {
        self.agent.instruction()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.agent.tools().names()
    }

    /// Runs the query through this specialist's own model/tool loop and
    /// returns its final text.
    pub async fn run(&self, query: &str) -> Result<String, SpecialistError> {
        if self.released.load(Ordering::Acquire) {
            return Err(SpecialistError::Inactive {
                specialist: self.name.clone(),
            });
        }
        if !self.backend.is_alive().await {
            return Err(SpecialistError::Connection {
                specialist: self.name.clone(),
                reason: "backing server is no longer running".to_string(),
            });
        }

        let started = std::time::Instant::now();
        let output = tokio::time::timeout(self.timeout, self.agent.run(AgentInput::prompt(query)))
            .await
            .map_err(|_| SpecialistError::Timeout {
                specialist: self.name.clone(),
                after: self.timeout,
            })?
            .map_err(|err| match err {
                TurnError::Timeout(after) => SpecialistError::Timeout {
                    specialist: self.name.clone(),
                    after,
                },
                other => SpecialistError::Inference {
                    specialist: self.name.clone(),
                    reason: other.to_string(),
                },
            })?;

        tracing::info!(
            specialist = %self.name,
            tool_calls = output.tool_invocations().count(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Specialist run completed"
        );
        Ok(output.text)
    }

    /// Closes the backing connection. Only the first call has any effect.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.backend.close().await {
            tracing::warn!(
                specialist = %self.name,
                error = %format!("{err:#}"),
                "Failed to close specialist backend"
            );
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

/// The active specialists plus the activation failures that were tolerated.
#[derive(Default)]
pub struct SpecialistPool {
    specialists: BTreeMap<String, Arc<SpecialistAgent>>,
    failures: Vec<ActivationError>,
}

impl SpecialistPool {
    pub fn from_agents(agents: impl IntoIterator<Item = Arc<SpecialistAgent>>) -> Self {
        Self {
            specialists: agents
                .into_iter()
                .map(|agent| (agent.name().to_string(), agent))
                .collect(),
            failures: Vec::new(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<SpecialistAgent>> {
        self.specialists.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.specialists.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.specialists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specialists.is_empty()
    }

    pub fn failures(&self) -> &[ActivationError] {
        &self.failures
    }

    pub async fn shutdown(&self) {
        futures::future::join_all(self.specialists.values().map(|agent| agent.release())).await;
    }
}

/// Connects every capability concurrently. Under the partial policy failed
/// capabilities are recorded and skipped; under the strict policy any failure
/// releases what did connect and aborts.
pub async fn activate_specialists(
    registry: &CapabilityRegistry,
    connector: &dyn BackendConnector,
    model: Arc<dyn Llm>,
    settings: SpecialistSettings,
    policy: ActivationPolicy,
) -> Result<SpecialistPool, ActivationError> {
    let attempts = registry.values().map(|capability| {
        let model = model.clone();
        async move {
            let connected = tokio::time::timeout(settings.timeout, connector.connect(capability))
                .await
                .map_err(|_| ActivationError {
                    specialist: capability.name.clone(),
                    reason: format!("connection timed out after {}s", settings.timeout.as_secs()),
                })?
                .map_err(|err| ActivationError {
                    specialist: capability.name.clone(),
                    reason: format!("{err:#}"),
                })?;
            Ok::<_, ActivationError>(Arc::new(SpecialistAgent::new(
                capability, model, connected, settings,
            )))
        }
    });

    let mut pool = SpecialistPool::default();
    for outcome in futures::future::join_all(attempts).await {
        match outcome {
            Ok(agent) => {
                tracing::info!(
                    specialist = %agent.name(),
                    tools = agent.tool_names().len(),
                    "Specialist activated"
                );
                pool.specialists.insert(agent.name().to_string(), agent);
            }
            Err(err) => {
                tracing::warn!(
                    specialist = %err.specialist,
                    reason = %err.reason,
                    "Specialist activation failed"
                );
                pool.failures.push(err);
            }
        }
    }

    if policy == ActivationPolicy::Strict && !pool.failures.is_empty() {
        pool.shutdown().await;
        return Err(pool.failures.remove(0));
    }
    Ok(pool)
}
