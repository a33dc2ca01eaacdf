use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("capability config '{path}' not found")]
    Missing { path: String },
    #[error("failed to read capability config '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid capability config '{path}': {source}")]
    Malformed {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("capability '{name}' is invalid: {reason}")]
    InvalidCapability { name: String, reason: String },
}

#[derive(Debug, Error)]
#[error("failed to activate specialist '{specialist}': {reason}")]
pub struct ActivationError {
    pub specialist: String,
    pub reason: String,
}

#[derive(Debug, Error)]
pub enum SpecialistError {
    #[error("specialist '{specialist}' is not active")]
    Inactive { specialist: String },
    #[error("specialist '{specialist}' inference failed: {reason}")]
    Inference { specialist: String, reason: String },
    #[error("specialist '{specialist}' tool connection failed: {reason}")]
    Connection { specialist: String, reason: String },
    #[error("specialist '{specialist}' timed out after {}s", .after.as_secs())]
    Timeout { specialist: String, after: Duration },
}

#[derive(Debug, Error)]
pub enum MemoryStoreError {
    #[error("memory search failed: {0}")]
    Search(String),
    #[error("memory commit failed: {0}")]
    Commit(String),
    #[error("memory store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum HistoryStoreError {
    #[error("failed to fetch history for session '{session_id}': {reason}")]
    Fetch { session_id: String, reason: String },
    #[error("failed to store message for session '{session_id}': {reason}")]
    Store { session_id: String, reason: String },
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool '{0}' is not registered")]
    NotFound(String),
    #[error("tool '{tool}' received invalid arguments: {reason}")]
    InvalidArguments { tool: String, reason: String },
    #[error("tool '{tool}' failed: {reason}")]
    Execution { tool: String, reason: String },
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("turn timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("model exceeded {0} tool rounds without producing a final answer")]
    ToolRoundsExceeded(usize),
    #[error(transparent)]
    Memory(#[from] MemoryStoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Provider,
    Specialist,
    Memory,
    History,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Config => "CONFIG",
            ErrorCategory::Provider => "PROVIDER",
            ErrorCategory::Specialist => "SPECIALIST",
            ErrorCategory::Memory => "MEMORY",
            ErrorCategory::History => "HISTORY",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Config => {
                "Check the capability config (mcpServers) and profile file for malformed entries."
            }
            ErrorCategory::Provider => {
                "Set provider credentials (OPENAI_API_KEY or LLM_API_KEY) or run with --provider ollama."
            }
            ErrorCategory::Specialist => {
                "Run strategist specialists check to see which specialist connections are healthy."
            }
            ErrorCategory::Memory => {
                "Check --memory-backend/--memory-db-url, or use --memory-failure-policy degrade."
            }
            ErrorCategory::History => "Check --history-db-url and that the sqlite file is writable.",
            ErrorCategory::Input => "Run strategist --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    if err.chain().any(|cause| cause.is::<ConfigError>()) {
        return ErrorCategory::Config;
    }
    if err
        .chain()
        .any(|cause| cause.is::<ActivationError>() || cause.is::<SpecialistError>())
    {
        return ErrorCategory::Specialist;
    }
    if err.chain().any(|cause| cause.is::<MemoryStoreError>()) {
        return ErrorCategory::Memory;
    }
    if err.chain().any(|cause| cause.is::<HistoryStoreError>()) {
        return ErrorCategory::History;
    }
    if let Some(turn) = err.chain().find_map(|cause| cause.downcast_ref::<TurnError>()) {
        return match turn {
            TurnError::Memory(_) => ErrorCategory::Memory,
            TurnError::Inference(_) | TurnError::Timeout(_) | TurnError::ToolRoundsExceeded(_) => {
                ErrorCategory::Provider
            }
        };
    }

    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("api_key") || msg.contains("provider") {
        return ErrorCategory::Provider;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("failed to read input")
        || msg.contains("profile")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("sqlite") || msg.contains("session") {
        return ErrorCategory::History;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let category = categorize_error(err);
    let rendered_error = render_error_message(err, show_sensitive_config);
    format!(
        "[{}] {}\nHint: {}",
        category.code(),
        rendered_error,
        category.hint()
    )
}

pub fn render_error_message(err: &anyhow::Error, show_sensitive_config: bool) -> String {
    let text = format!("{err:#}");
    if show_sensitive_config {
        text
    } else {
        redact_sqlite_urls(&text)
    }
}

pub fn redact_sqlite_urls(text: &str) -> String {
    const SQLITE_PREFIX: &str = "sqlite:";
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0usize;

    while let Some(offset) = text[cursor..].find(SQLITE_PREFIX) {
        let start = cursor + offset;
        out.push_str(&text[cursor..start]);

        let remainder = &text[start..];
        let end = remainder
            .find(|ch: char| {
                ch.is_whitespace()
                    || matches!(
                        ch,
                        '"' | '\'' | '(' | ')' | '[' | ']' | '{' | '}' | ',' | ';'
                    )
            })
            .unwrap_or(remainder.len());
        out.push_str(&redact_sqlite_url_value(&remainder[..end]));
        cursor = start + end;
    }

    out.push_str(&text[cursor..]);
    out
}

pub fn redact_sqlite_url_value(value: &str) -> String {
    if value.starts_with("sqlite://") {
        "sqlite://[REDACTED]".to_string()
    } else if value.starts_with("sqlite:") {
        "sqlite:[REDACTED]".to_string()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_errors_drive_category_before_message_heuristics() {
        let err = anyhow::Error::new(ConfigError::Missing {
            path: "mcp_config.json".to_string(),
        })
        .context("startup failed for provider openai");
        assert_eq!(categorize_error(&err), ErrorCategory::Config);

        let err = anyhow::Error::new(MemoryStoreError::Search("boom".to_string()));
        assert_eq!(categorize_error(&err), ErrorCategory::Memory);
    }

    #[test]
    fn turn_failures_are_categorized_by_their_cause() {
        let err = anyhow::Error::new(TurnError::Memory(MemoryStoreError::Unavailable(
            "locked".to_string(),
        )));
        assert_eq!(categorize_error(&err), ErrorCategory::Memory);

        let err = anyhow::Error::new(TurnError::Inference("503".to_string()));
        assert_eq!(categorize_error(&err), ErrorCategory::Provider);

        let err = anyhow::Error::new(SpecialistError::Inactive {
            specialist: "github".to_string(),
        })
        .context("delegation failed");
        assert_eq!(categorize_error(&err), ErrorCategory::Specialist);
    }

    #[test]
    fn formatted_error_redacts_sqlite_urls() {
        let err = anyhow::anyhow!("failed to open sqlite://secret/path.db for history");
        let rendered = format_cli_error(&err, false);
        assert!(rendered.starts_with("[HISTORY]"));
        assert!(rendered.contains("sqlite://[REDACTED]"));
        assert!(!rendered.contains("secret/path.db"));
    }
}
