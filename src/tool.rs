use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::ToolError;
use crate::llm::ToolDeclaration;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON schema for the tool's arguments object.
    fn parameters(&self) -> Value;

    async fn execute(&self, args: Value) -> Result<Value, ToolError>;

    fn declaration(&self) -> ToolDeclaration {
        ToolDeclaration {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters(),
        }
    }
}

type ToolHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ToolError>> + Send + Sync>;

/// A tool backed by an async closure.
#[derive(Clone)]
pub struct FunctionTool {
    name: String,
    description: String,
    parameters: Value,
    handler: ToolHandler,
}

impl FunctionTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        (self.handler)(args).await
    }
}

/// Name-keyed tool set offered to one agent.
#[derive(Clone, Default)]
pub struct ToolTable {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool, returning the one it replaced if the name was taken.
    pub fn insert(&mut self, tool: Arc<dyn Tool>) -> Option<Arc<dyn Tool>> {
        self.tools.insert(tool.name().to_string(), tool)
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn Tool>, ToolError> {
        self.tools
            .get(name)
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        self.tools.values().map(|tool| tool.declaration()).collect()
    }

    pub async fn invoke(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        self.get(name)?.execute(args).await
    }
}

impl FromIterator<Arc<dyn Tool>> for ToolTable {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Tool>>>(iter: I) -> Self {
        let mut table = ToolTable::new();
        for tool in iter {
            table.insert(tool);
        }
        table
    }
}

/// Reads a required string argument from a tool's argument object.
pub fn required_str<'a>(tool: &str, args: &'a Value, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ToolError::InvalidArguments {
            tool: tool.to_string(),
            reason: format!("'{key}' must be a string"),
        })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn echo_tool() -> Arc<dyn Tool> {
        Arc::new(FunctionTool::new(
            "echo",
            "Echo the message back",
            json!({"type": "object", "properties": {"message": {"type": "string"}}}),
            |args| async move {
                let message = required_str("echo", &args, "message")?;
                Ok(json!({"echo": message}))
            },
        ))
    }

    #[tokio::test]
    async fn invoke_dispatches_by_name() {
        let table = ToolTable::from_iter([echo_tool()]);
        let out = table
            .invoke("echo", json!({"message": "hi"}))
            .await
            .expect("echo should succeed");
        assert_eq!(out, json!({"echo": "hi"}));
        assert_eq!(table.declarations()[0].name, "echo");
    }

    #[tokio::test]
    async fn unknown_tool_and_bad_arguments_are_typed_errors() {
        let table = ToolTable::from_iter([echo_tool()]);
        let err = table.invoke("missing", json!({})).await.expect_err("unknown");
        assert!(matches!(err, ToolError::NotFound(name) if name == "missing"));

        let err = table
            .invoke("echo", json!({"message": 7}))
            .await
            .expect_err("bad args");
        assert!(matches!(err, ToolError::InvalidArguments { .. }));
    }
}
