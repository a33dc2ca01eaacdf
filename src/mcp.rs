//! Stdio MCP client: newline-delimited JSON-RPC 2.0 with a spawned server.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::error::ToolError;
use crate::registry::Capability;
use crate::specialist::{BackendConnector, ToolBackend};
use crate::tool::{Tool, ToolTable};

const PROTOCOL_VERSION: &str = "2024-11-05";
const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Deserialize)]
struct JsonRpcMessage {
    id: Option<Value>,
    method: Option<String>,
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    json!({"type": "object", "properties": {}})
}

/// Waiters keyed by request id; `None` once the server's output has closed.
type PendingResponses =
    Arc<std::sync::Mutex<Option<HashMap<u64, oneshot::Sender<JsonRpcMessage>>>>>;

pub struct McpServer {
    name: String,
    child: Mutex<Child>,
    outbound: mpsc::UnboundedSender<String>,
    pending: PendingResponses,
    next_id: AtomicU64,
}

/// Drops the waiter for a request whose caller went away (for example on timeout).
struct PendingGuard<'a> {
    pending: &'a PendingResponses,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Some(waiters) = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            waiters.remove(&self.id);
        }
    }
}

impl McpServer {
    pub async fn spawn(capability: &Capability) -> Result<Arc<Self>> {
        let launch = &capability.launch;
        tracing::info!(
            server = %capability.name,
            command = %launch.command,
            args = ?launch.args,
            "Spawning MCP server"
        );

        let mut child = Command::new(&launch.command)
            .args(&launch.args)
            .envs(&launch.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn MCP server '{}' via '{}'",
                    capability.name, launch.command
                )
            })?;

        let stdin = child.stdin.take().context("MCP server stdin unavailable")?;
        let stdout = child.stdout.take().context("MCP server stdout unavailable")?;
        if let Some(stderr) = child.stderr.take() {
            let server = capability.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %server, "{line}");
                }
            });
        }

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let pending = PendingResponses::new(std::sync::Mutex::new(Some(HashMap::new())));
        tokio::spawn(write_loop(capability.name.clone(), stdin, outbound_rx));
        tokio::spawn(read_loop(
            capability.name.clone(),
            stdout,
            outbound.clone(),
            pending.clone(),
        ));

        let server = Arc::new(Self {
            name: capability.name.clone(),
            child: Mutex::new(child),
            outbound,
            pending,
            next_id: AtomicU64::new(1),
        });
        server.initialize().await?;
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> Result<()> {
        self.request(
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": env!("CARGO_PKG_NAME"),
                    "version": env!("CARGO_PKG_VERSION"),
                }
            })),
        )
        .await
        .with_context(|| format!("MCP server '{}' failed to initialize", self.name))?;

        self.notify("notifications/initialized").await
    }

    async fn notify(&self, method: &str) -> Result<()> {
        self.send(json!({"jsonrpc": "2.0", "method": method}).to_string())
    }

    /// Queues one whole line for the writer task, so a cancelled caller never
    /// leaves a partial message on the server's stdin.
    fn send(&self, line: String) -> Result<()> {
        self.outbound
            .send(line)
            .map_err(|_| anyhow::anyhow!("MCP server '{}' input stream is closed", self.name))
    }

    async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut message = json!({"jsonrpc": "2.0", "id": id, "method": method});
        if let Some(params) = params {
            message["params"] = params;
        }
        tracing::debug!(server = %self.name, method, id, "MCP request");

        let closed = || anyhow::anyhow!("MCP server '{}' closed its output stream", self.name);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .ok_or_else(closed)?
            .insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        self.send(message.to_string())?;

        let response = rx.await.map_err(|_| closed())?;
        if let Some(error) = response.error {
            return Err(anyhow::anyhow!(
                "MCP server '{}' returned error {} for {method}: {}",
                self.name,
                error.code,
                error.message
            ));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    pub async fn list_tools(&self) -> Result<Vec<McpToolDefinition>> {
        let result = self.request("tools/list", Some(json!({}))).await?;
        let tools = result.get("tools").cloned().unwrap_or_else(|| json!([]));
        serde_json::from_value(tools)
            .with_context(|| format!("MCP server '{}' returned malformed tool list", self.name))
    }

    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ToolError> {
        let result = self
            .request("tools/call", Some(json!({"name": name, "arguments": arguments})))
            .await
            .map_err(|err| ToolError::Execution {
                tool: name.to_string(),
                reason: format!("{err:#}"),
            })?;
        tool_result_value(name, &result)
    }

    async fn is_running(&self) -> bool {
        matches!(self.child.lock().await.try_wait(), Ok(None))
    }

    async fn terminate(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        child
            .kill()
            .await
            .with_context(|| format!("failed to stop MCP server '{}'", self.name))
    }
}

async fn write_loop(
    server: String,
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = lines.recv().await {
        if let Err(err) = write_line(&mut stdin, &line).await {
            tracing::warn!(server = %server, error = %err, "MCP server input closed");
            break;
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> Result<()> {
    stdin.write_all(format!("{line}\n").as_bytes()).await?;
    stdin.flush().await?;
    Ok(())
}

/// Routes responses to their waiting requests and answers requests the server
/// sends to us. Pending waiters are dropped once the output stream ends.
async fn read_loop(
    server: String,
    stdout: ChildStdout,
    outbound: mpsc::UnboundedSender<String>,
    pending: PendingResponses,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(server = %server, error = %err, "Failed to read from MCP server");
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<JsonRpcMessage>(trimmed) else {
            tracing::debug!(server = %server, line = %trimmed, "Skipping non-JSON-RPC output");
            continue;
        };

        let method = message.method.clone();
        match (method.as_deref(), message.id.clone()) {
            (Some(method), Some(id)) => {
                tracing::debug!(server = %server, method, "Answering MCP server request");
                if outbound.send(server_request_reply(method, id).to_string()).is_err() {
                    break;
                }
            }
            (Some(method), None) => {
                tracing::debug!(server = %server, method, "MCP notification");
            }
            (None, Some(id)) => {
                let waiter = id.as_u64().and_then(|id| {
                    pending
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .as_mut()
                        .and_then(|waiters| waiters.remove(&id))
                });
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(message);
                    }
                    None => {
                        tracing::debug!(server = %server, %id, "Dropping unmatched MCP response");
                    }
                }
            }
            (None, None) => {}
        }
    }
    pending.lock().unwrap_or_else(PoisonError::into_inner).take();
}

/// `ping` gets an empty result; anything else we do not serve.
fn server_request_reply(method: &str, id: Value) -> Value {
    if method == "ping" {
        json!({"jsonrpc": "2.0", "id": id, "result": {}})
    } else {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"code": METHOD_NOT_FOUND, "message": format!("Method not found: {method}")}
        })
    }
}

/// Flattens a `tools/call` result into the value handed back to the model.
fn tool_result_value(tool: &str, result: &Value) -> Result<Value, ToolError> {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<&str>>()
                .join("\n")
        })
        .unwrap_or_default();

    if result.get("isError").and_then(Value::as_bool).unwrap_or(false) {
        return Err(ToolError::Execution {
            tool: tool.to_string(),
            reason: if text.is_empty() {
                "tool reported an error".to_string()
            } else {
                text
            },
        });
    }

    if let Some(structured) = result.get("structuredContent") {
        return Ok(structured.clone());
    }
    Ok(Value::String(text))
}

/// Proxies one MCP tool through its server connection.
pub struct McpTool {
    server: Arc<McpServer>,
    definition: McpToolDefinition,
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn description(&self) -> &str {
        self.definition.description.as_deref().unwrap_or("")
    }

    fn parameters(&self) -> Value {
        self.definition.input_schema.clone()
    }

    async fn execute(&self, args: Value) -> Result<Value, ToolError> {
        self.server.call_tool(&self.definition.name, args).await
    }
}

pub struct McpBackend {
    server: Arc<McpServer>,
    tools: ToolTable,
}

impl McpBackend {
    pub async fn connect(capability: &Capability) -> Result<Self> {
        let server = McpServer::spawn(capability).await?;
        let definitions = match server.list_tools().await {
            Ok(definitions) => definitions,
            Err(err) => {
                if let Err(close_err) = server.terminate().await {
                    tracing::warn!(
                        server = %capability.name,
                        error = %close_err,
                        "Failed to stop MCP server"
                    );
                }
                return Err(err);
            }
        };

        let tools = definitions
            .into_iter()
            .map(|definition| {
                Arc::new(McpTool {
                    server: server.clone(),
                    definition,
                }) as Arc<dyn Tool>
            })
            .collect::<ToolTable>();
        tracing::info!(
            server = %capability.name,
            tools = tools.len(),
            "MCP tools discovered"
        );
        Ok(Self { server, tools })
    }
}

#[async_trait]
impl ToolBackend for McpBackend {
    fn tools(&self) -> ToolTable {
        self.tools.clone()
    }

    async fn is_alive(&self) -> bool {
        self.server.is_running().await
    }

    async fn close(&self) -> Result<()> {
        self.server.terminate().await
    }
}

/// Launches each capability's server as a child process over stdio.
pub struct McpConnector;

#[async_trait]
impl BackendConnector for McpConnector {
    async fn connect(&self, capability: &Capability) -> Result<Arc<dyn ToolBackend>> {
        Ok(Arc::new(McpBackend::connect(capability).await?))
    }
}
