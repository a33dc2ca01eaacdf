use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::agent::{AgentInput, AgentStep, LlmAgent, ToolInvocation};
use crate::error::TurnError;
use crate::history::Message;
use crate::llm::Llm;
use crate::memory::{MemoryAugmentation, render_memory_context};
use crate::tool::ToolTable;

pub const ORCHESTRATOR_INSTRUCTION: &str = "You are a Business Strategist orchestrator. \
Delegate tasks to subagents based on the user's request.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    MemoryRetrieved,
    Responding,
    ToolInvoked,
    Completed,
    Failed,
}

pub struct TurnRequest<'a> {
    pub user_id: &'a str,
    pub query: &'a str,
    pub history: &'a [Message],
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub text: String,
    pub memories: Vec<String>,
    pub tool_calls: Vec<ToolInvocation>,
    pub states: Vec<TurnState>,
    pub memory_committed: bool,
}

pub struct OrchestratorSettings {
    pub instruction: String,
    pub inference_timeout: Duration,
    pub max_tool_rounds: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            instruction: ORCHESTRATOR_INSTRUCTION.to_string(),
            inference_timeout: Duration::from_secs(120),
            max_tool_rounds: 8,
        }
    }
}

/// Routes each turn to specialists through delegation tools, with memory
/// retrieved before the turn and committed after it.
pub struct Orchestrator {
    agent: LlmAgent,
    memory: MemoryAugmentation,
}

impl Orchestrator {
    pub fn new(
        model: Arc<dyn Llm>,
        delegation_tools: ToolTable,
        memory: MemoryAugmentation,
        settings: OrchestratorSettings,
    ) -> Self {
        let agent = LlmAgent::new("orchestrator", settings.instruction, model, delegation_tools)
            .with_max_tool_rounds(settings.max_tool_rounds)
            .with_inference_timeout(settings.inference_timeout);
        Self { agent, memory }
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.agent.tools().names()
    }

    pub fn memory(&self) -> &MemoryAugmentation {
        &self.memory
    }

    /// Runs one turn up to its final text. Text deltas go to `deltas` as they
    /// stream. Memory is left untouched until `commit_turn`.
    pub async fn run_turn(
        &self,
        request: TurnRequest<'_>,
        deltas: Option<UnboundedSender<String>>,
    ) -> Result<TurnOutcome, TurnError> {
        let mut states = vec![TurnState::Idle];

        let memories = match self.memory.retrieve(request.user_id, request.query).await {
            Ok(memories) => memories,
            Err(err) => {
                tracing::warn!(
                    user_id = request.user_id,
                    state = ?TurnState::Failed,
                    error = %err,
                    "Memory retrieval failed"
                );
                return Err(err.into());
            }
        };
        states.push(TurnState::MemoryRetrieved);
        tracing::debug!(
            user_id = request.user_id,
            memories = memories.len(),
            "Memories retrieved"
        );

        let input = AgentInput {
            prompt: request.query,
            history: request.history,
            context: render_memory_context(&memories).into_iter().collect(),
            deltas,
        };
        let output = match self.agent.run(input).await {
            Ok(output) => output,
            Err(err) => {
                tracing::warn!(
                    user_id = request.user_id,
                    state = ?TurnState::Failed,
                    error = %err,
                    "Turn failed"
                );
                return Err(err);
            }
        };

        let mut tool_calls = Vec::new();
        for step in output.steps {
            match step {
                AgentStep::Responded => states.push(TurnState::Responding),
                AgentStep::ToolInvoked(invocation) => {
                    states.push(TurnState::ToolInvoked);
                    tool_calls.push(invocation);
                }
            }
        }

        Ok(TurnOutcome {
            text: output.text,
            memories,
            tool_calls,
            states,
            memory_committed: false,
        })
    }

    /// Commits the exchange to long-term memory and marks the turn completed.
    /// Callers invoke this only once the turn's history update has succeeded;
    /// a failed commit is logged and never fails the turn.
    pub async fn commit_turn(&self, user_id: &str, query: &str, outcome: &mut TurnOutcome) {
        outcome.memory_committed = match self.memory.commit(user_id, query, &outcome.text).await {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(
                    user_id,
                    error = %err,
                    "Memory commit failed; turn result is unaffected"
                );
                false
            }
        };
        outcome.states.push(TurnState::Completed);
        tracing::debug!(user_id, state = ?TurnState::Completed, "Turn completed");
    }
}
