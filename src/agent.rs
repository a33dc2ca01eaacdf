//! The model/tool loop shared by the orchestrator and every specialist.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::TurnError;
use crate::history::{Message, MessageRole};
use crate::llm::{ChatMessage, Llm, LlmChunk, LlmRequest, ToolCall};
use crate::tool::ToolTable;

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool: String,
    pub arguments: Value,
    pub succeeded: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentStep {
    Responded,
    ToolInvoked(ToolInvocation),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutput {
    /// Everything the model streamed across all rounds.
    pub text: String,
    pub steps: Vec<AgentStep>,
}

impl AgentOutput {
    pub fn tool_invocations(&self) -> impl Iterator<Item = &ToolInvocation> {
        self.steps.iter().filter_map(|step| match step {
            AgentStep::ToolInvoked(invocation) => Some(invocation),
            AgentStep::Responded => None,
        })
    }
}

/// One run's inputs. `context` blocks are appended to the system instruction.
pub struct AgentInput<'a> {
    pub prompt: &'a str,
    pub history: &'a [Message],
    pub context: Vec<String>,
    pub deltas: Option<UnboundedSender<String>>,
}

impl<'a> AgentInput<'a> {
    pub fn prompt(prompt: &'a str) -> Self {
        Self {
            prompt,
            history: &[],
            context: Vec::new(),
            deltas: None,
        }
    }
}

pub struct LlmAgent {
    name: String,
    instruction: String,
    model: Arc<dyn Llm>,
    tools: ToolTable,
    max_tool_rounds: usize,
    inference_timeout: Duration,
}

impl LlmAgent {
    pub fn new(
        name: impl Into<String>,
        instruction: impl Into<String>,
        model: Arc<dyn Llm>,
        tools: ToolTable,
    ) -> Self {
        Self {
            name: name.into(),
            instruction: instruction.into(),
            model,
            tools,
            max_tool_rounds: 8,
            inference_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds.max(1);
        self
    }

    pub fn with_inference_timeout(mut self, timeout: Duration) -> Self {
        self.inference_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn tools(&self) -> &ToolTable {
        &self.tools
    }

    pub async fn run(&self, input: AgentInput<'_>) -> Result<AgentOutput, TurnError> {
        let mut messages = Vec::with_capacity(input.history.len() + 2);
        messages.push(ChatMessage::system(self.system_prompt(&input.context)));
        messages.extend(input.history.iter().map(|message| match message.role {
            MessageRole::User => ChatMessage::user(message.content.clone()),
            MessageRole::Assistant => ChatMessage::assistant(message.content.clone()),
        }));
        messages.push(ChatMessage::user(input.prompt));

        let declarations = self.tools.declarations();
        let mut output = AgentOutput {
            text: String::new(),
            steps: Vec::new(),
        };

        for round in 0..=self.max_tool_rounds {
            let request = LlmRequest {
                messages: messages.clone(),
                tools: declarations.clone(),
            };
            let (text, calls) = tokio::time::timeout(
                self.inference_timeout,
                self.stream_round(request, input.deltas.as_ref()),
            )
            .await
            .map_err(|_| TurnError::Timeout(self.inference_timeout))??;

            output.text.push_str(&text);
            output.steps.push(AgentStep::Responded);

            if calls.is_empty() {
                return Ok(output);
            }
            if round == self.max_tool_rounds {
                return Err(TurnError::ToolRoundsExceeded(self.max_tool_rounds));
            }

            messages.push(ChatMessage::assistant_tool_calls(text, calls.clone()));
            for call in calls {
                let (result, invocation) = self.invoke_tool(&call).await;
                messages.push(ChatMessage::tool_result(call.id, result.to_string()));
                output.steps.push(AgentStep::ToolInvoked(invocation));
            }
        }

        Err(TurnError::ToolRoundsExceeded(self.max_tool_rounds))
    }

    fn system_prompt(&self, context: &[String]) -> String {
        let mut prompt = self.instruction.clone();
        for block in context.iter().filter(|block| !block.trim().is_empty()) {
            prompt.push_str("\n\n");
            prompt.push_str(block);
        }
        prompt
    }

    async fn stream_round(
        &self,
        request: LlmRequest,
        deltas: Option<&UnboundedSender<String>>,
    ) -> Result<(String, Vec<ToolCall>), TurnError> {
        let mut stream = self
            .model
            .generate(request)
            .await
            .map_err(|err| TurnError::Inference(format!("{err:#}")))?;

        let mut text = String::new();
        let mut calls = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk.map_err(|err| TurnError::Inference(format!("{err:#}")))? {
                LlmChunk::TextDelta(delta) => {
                    text.push_str(&delta);
                    if let Some(sink) = deltas {
                        // The renderer may already be gone; the turn still completes.
                        let _ = sink.send(delta);
                    }
                }
                LlmChunk::ToolCall(call) => calls.push(call),
            }
        }
        Ok((text, calls))
    }

    async fn invoke_tool(&self, call: &ToolCall) -> (Value, ToolInvocation) {
        tracing::info!(
            tool = %call.name,
            author = %self.name,
            lifecycle = "requested",
            "Tool call requested"
        );

        let outcome = self.tools.invoke(&call.name, call.arguments.clone()).await;
        let succeeded = outcome.is_ok();
        let result = match outcome {
            Ok(value) => {
                tracing::info!(
                    tool = %call.name,
                    author = %self.name,
                    lifecycle = "succeeded",
                    "Tool execution completed"
                );
                value
            }
            Err(err) => {
                tracing::warn!(
                    tool = %call.name,
                    author = %self.name,
                    lifecycle = "failed",
                    error = %err,
                    "Tool execution failed"
                );
                json!({ "error": err.to_string() })
            }
        };

        (
            result,
            ToolInvocation {
                tool: call.name.clone(),
                arguments: call.arguments.clone(),
                succeeded,
            },
        )
    }
}
