use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ExecflowError, Result};

/// Environment variable consulted when `[crypto] key` is unset.
pub const KEY_ENV_VAR: &str = "EXECFLOW_KEY";

/// Top-level execflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub compiler: CompilerConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Where the remote execution agent listens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// WebSocket endpoint for streaming task-set execution.
    #[serde(default = "default_stream_url")]
    pub stream_url: String,
    /// HTTP endpoint for single-shot commands.
    #[serde(default = "default_exec_url")]
    pub exec_url: String,
    /// Timeout for single-shot requests.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Give up on a streaming connection that is not ready after this long.
    /// Unset means wait indefinitely.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            stream_url: default_stream_url(),
            exec_url: default_exec_url(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: None,
        }
    }
}

fn default_stream_url() -> String { "ws://127.0.0.1:9191/exec_task_set".to_string() }
fn default_exec_url() -> String { "http://127.0.0.1:9191/exec_command".to_string() }
fn default_request_timeout() -> u64 { 30 }

/// Pre-shared key material and envelope binding.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Base64-encoded 256-bit key. Supports `${ENV_VAR}` references.
    #[serde(default)]
    pub key: Option<String>,
    /// Associated data bound to every envelope (UTF-8). Empty by default.
    #[serde(default)]
    pub associated_data: String,
}

impl CryptoConfig {
    /// Resolve the base64 key from config, falling back to `EXECFLOW_KEY`.
    pub fn resolve_key(&self) -> Option<String> {
        self.key
            .as_ref()
            .filter(|k| !k.is_empty() && !k.starts_with("${"))
            .cloned()
            .or_else(|| std::env::var(KEY_ENV_VAR).ok().filter(|k| !k.is_empty()))
    }
}

/// How the compiler treats repeated edges between the same pair of nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateEdgePolicy {
    /// Keep the first occurrence and log the rest.
    #[default]
    Collapse,
    /// Fail compilation.
    Reject,
}

/// Which nodes head the top-level `task_set_nodes` array.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RootSelection {
    /// Nodes without incoming edges. Every node of an acyclic graph is
    /// reachable from one of them.
    #[default]
    Sources,
    /// Every node, including those already embedded as someone's child.
    All,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerConfig {
    /// Accept graphs without nodes (default: false).
    #[serde(default)]
    pub allow_empty: bool,
    #[serde(default)]
    pub duplicate_edges: DuplicateEdgePolicy,
    #[serde(default)]
    pub root_selection: RootSelection,
    /// Longest parent-to-leaf chain accepted, counted in nodes.
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            allow_empty: false,
            duplicate_edges: DuplicateEdgePolicy::Collapse,
            root_selection: RootSelection::Sources,
            max_depth: default_max_depth(),
        }
    }
}

/// Default for `[compiler] max_depth`.
pub const DEFAULT_MAX_DEPTH: usize = 256;

fn default_max_depth() -> usize { DEFAULT_MAX_DEPTH }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Capacity of the session event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_capacity: default_event_capacity(),
        }
    }
}

fn default_event_capacity() -> usize { 256 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ExecflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded)
            .map_err(|e| ExecflowError::Config(e.to_string()))
    }

    /// Copy safe to print: the key is replaced by a marker.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.crypto.key.is_some() {
            copy.crypto.key = Some("<redacted>".to_string());
        }
        copy
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
