//! Capability registry loaded from an `mcpServers` JSON document.
//!
//! The registry only describes how each specialist's backing server is
//! launched; connections are opened later by specialist activation.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

const DEFAULT_INSTRUCTIONS: &[(&str, &str)] = &[
    (
        "airtable",
        "You are an Airtable specialist. Help users interact with Airtable databases.",
    ),
    ("brave", "You are a web search specialist using Brave Search."),
    (
        "filesystem",
        "You are a filesystem specialist. Manage files and directories.",
    ),
    (
        "github",
        "You are a GitHub specialist. Manage repositories and issues.",
    ),
    (
        "slack",
        "You are a Slack specialist. Work with channels and messages.",
    ),
    (
        "firecrawl",
        "You are a web crawling specialist. Extract data from websites.",
    ),
    (
        "notionApi",
        "You are a Notion specialist. Work with Notion pages and databases.",
    ),
];

/// How to launch a capability's backing server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub name: String,
    pub instructions: String,
    pub launch: LaunchSpec,
}

pub type CapabilityRegistry = BTreeMap<String, Capability>;

#[derive(Debug, Deserialize)]
struct CapabilityFile {
    #[serde(default, rename = "mcpServers")]
    mcp_servers: HashMap<String, ServerEntry>,
}

#[derive(Debug, Deserialize)]
struct ServerEntry {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
}

pub fn load_capabilities(path: &Path) -> Result<CapabilityRegistry, ConfigError> {
    let display = path.display().to_string();
    if !path.exists() {
        return Err(ConfigError::Missing { path: display });
    }
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: display.clone(),
        source,
    })?;
    parse_capabilities(&content, &display, |key| std::env::var(key).ok())
}

/// Parses a capability document, expanding env values through `lookup`.
pub fn parse_capabilities(
    content: &str,
    source_label: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<CapabilityRegistry, ConfigError> {
    let file = serde_json::from_str::<CapabilityFile>(content).map_err(|source| {
        ConfigError::Malformed {
            path: source_label.to_string(),
            source,
        }
    })?;

    let mut registry = CapabilityRegistry::new();
    for (name, entry) in file.mcp_servers {
        let trimmed = name.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::InvalidCapability {
                name,
                reason: "name cannot be empty".to_string(),
            });
        }
        if trimmed.chars().any(char::is_whitespace) {
            return Err(ConfigError::InvalidCapability {
                name: trimmed.to_string(),
                reason: "name cannot contain whitespace".to_string(),
            });
        }
        if registry.contains_key(trimmed) {
            return Err(ConfigError::InvalidCapability {
                name: trimmed.to_string(),
                reason: "duplicate capability name".to_string(),
            });
        }
        if entry.command.trim().is_empty() {
            return Err(ConfigError::InvalidCapability {
                name: trimmed.to_string(),
                reason: "command cannot be empty".to_string(),
            });
        }

        let env = entry
            .env
            .into_iter()
            .map(|(key, value)| {
                let expanded = expand_env_vars(&value, &lookup);
                (key, expanded)
            })
            .collect::<BTreeMap<String, String>>();

        registry.insert(
            trimmed.to_string(),
            Capability {
                name: trimmed.to_string(),
                instructions: default_instructions(trimmed),
                launch: LaunchSpec {
                    command: entry.command,
                    args: entry.args,
                    env,
                },
            },
        );
    }

    Ok(registry)
}

pub fn default_instructions(name: &str) -> String {
    DEFAULT_INSTRUCTIONS
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, text)| (*text).to_string())
        .unwrap_or_else(|| format!("You are the {name} specialist."))
}

/// Shell-style `$VAR` / `${VAR}` expansion. Unknown variables and malformed
/// references are left untouched.
pub fn expand_env_vars(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                let key = &braced[..end];
                if is_valid_var_name(key)
                    && let Some(resolved) = lookup(key)
                {
                    out.push_str(&resolved);
                } else {
                    out.push_str(&rest[pos..pos + end + 3]);
                }
                rest = &braced[end + 1..];
                continue;
            }
            out.push('$');
            rest = after;
            continue;
        }

        let name_len = after
            .char_indices()
            .take_while(|(_, ch)| ch.is_ascii_alphanumeric() || *ch == '_')
            .count();
        if name_len == 0 {
            out.push('$');
            rest = after;
            continue;
        }

        let key = &after[..name_len];
        match lookup(key) {
            Some(resolved) => out.push_str(&resolved),
            None => {
                out.push('$');
                out.push_str(key);
            }
        }
        rest = &after[name_len..];
    }

    out.push_str(rest);
    out
}

fn is_valid_var_name(key: &str) -> bool {
    !key.is_empty() && key.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(key: &str) -> Option<String> {
        match key {
            "AIRTABLE_API_KEY" => Some("key-123".to_string()),
            "HOME" => Some("/home/strategist".to_string()),
            _ => None,
        }
    }

    #[test]
    fn expands_plain_and_braced_references() {
        assert_eq!(expand_env_vars("$AIRTABLE_API_KEY", lookup), "key-123");
        assert_eq!(expand_env_vars("${HOME}/data", lookup), "/home/strategist/data");
        assert_eq!(
            expand_env_vars("Bearer $AIRTABLE_API_KEY!", lookup),
            "Bearer key-123!"
        );
    }

    #[test]
    fn leaves_unknown_and_malformed_references_untouched() {
        assert_eq!(expand_env_vars("$MISSING", lookup), "$MISSING");
        assert_eq!(expand_env_vars("${MISSING}", lookup), "${MISSING}");
        assert_eq!(expand_env_vars("cost $5", lookup), "cost $5");
        assert_eq!(expand_env_vars("trailing $", lookup), "trailing $");
        assert_eq!(expand_env_vars("${open", lookup), "${open");
    }

    #[test]
    fn parses_servers_with_default_and_fallback_instructions() {
        let doc = r#"{
            "mcpServers": {
                "airtable": {
                    "command": "npx",
                    "args": ["-y", "airtable-mcp-server"],
                    "env": {"AIRTABLE_API_KEY": "$AIRTABLE_API_KEY"}
                },
                "crm": {"command": "crm-mcp"}
            }
        }"#;

        let registry = parse_capabilities(doc, "test", lookup).expect("registry should parse");
        assert_eq!(registry.len(), 2);

        let airtable = &registry["airtable"];
        assert!(airtable.instructions.starts_with("You are an Airtable specialist"));
        assert_eq!(airtable.launch.args, vec!["-y", "airtable-mcp-server"]);
        assert_eq!(airtable.launch.env["AIRTABLE_API_KEY"], "key-123");

        let crm = &registry["crm"];
        assert_eq!(crm.instructions, "You are the crm specialist.");
        assert!(crm.launch.args.is_empty());
    }

    #[test]
    fn malformed_and_missing_sources_are_config_errors() {
        let err = parse_capabilities("{not json", "broken.json", lookup).expect_err("malformed");
        assert!(matches!(err, ConfigError::Malformed { .. }));

        let err = parse_capabilities(r#"{"mcpServers": {"x": {"args": []}}}"#, "t", lookup)
            .expect_err("command is required");
        assert!(matches!(err, ConfigError::Malformed { .. }));

        let err = load_capabilities(Path::new("/definitely/not/here.json"))
            .expect_err("missing file");
        assert!(matches!(err, ConfigError::Missing { .. }));
    }

    #[test]
    fn empty_command_is_rejected() {
        let err = parse_capabilities(r#"{"mcpServers": {"x": {"command": " "}}}"#, "t", lookup)
            .expect_err("empty command");
        assert!(matches!(err, ConfigError::InvalidCapability { .. }));
    }

    #[test]
    fn names_that_trim_to_the_same_value_are_rejected() {
        let content = r#"{"mcpServers": {
            "github": {"command": "npx"},
            " github": {"command": "docker"}
        }}"#;
        let err = parse_capabilities(content, "t", lookup).expect_err("duplicate name");
        assert!(matches!(
            err,
            ConfigError::InvalidCapability { ref name, ref reason }
                if name == "github" && reason == "duplicate capability name"
        ));
    }
}
