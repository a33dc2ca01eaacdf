use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::error::ToolError;
use crate::specialist::{SpecialistAgent, SpecialistPool};
use crate::tool::{Tool, ToolTable, required_str};

pub fn delegation_tool_name(specialist: &str) -> String {
    format!("use_{specialist}_agent")
}

/// Exposes one specialist to the orchestrator as `use_<name>_agent(query)`.
pub struct DelegationTool {
    name: String,
    description: String,
    specialist: Arc<SpecialistAgent>,
}

impl DelegationTool {
    pub fn new(specialist: Arc<SpecialistAgent>) -> Self {
        Self {
            name: delegation_tool_name(specialist.name()),
            description: format!(
                "Delegate a request to the {} specialist. Pass the full task as `query`; \
                 the specialist's final answer is returned as `result`.",
                specialist.name()
            ),
            specialist,
        }
    }
}

#[async_trait]
impl Tool for DelegationTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The request for the specialist, in natural language."
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        let query = required_str(&self.name, &args, "query")?;
        tracing::info!(
            tool = %self.name,
            specialist = %self.specialist.name(),
            "Delegating to specialist"
        );
        let result = self
            .specialist
            .run(query)
            .await
            .map_err(|err| ToolError::Execution {
                tool: self.name.clone(),
                reason: err.to_string(),
            })?;
        Ok(json!({ "result": result }))
    }
}

/// One delegation tool per active specialist.
pub fn build_delegation_tools(pool: &SpecialistPool) -> ToolTable {
    pool.iter()
        .map(|specialist| Arc::new(DelegationTool::new(specialist.clone())) as Arc<dyn Tool>)
        .collect()
}
