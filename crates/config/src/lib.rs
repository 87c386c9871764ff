//! Configuration loading, validation, and management for Toolmesh.
//!
//! Loads configuration from `~/.toolmesh/config.toml` with environment
//! variable overrides. Validates all settings at startup. Tool server
//! declarations are consumed read-only by the hypervisor — identity is the
//! server `name`, and duplicates are rejected up front.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.toolmesh/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model provider configuration
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Execution loop configuration
    #[serde(default)]
    pub agent: AgentConfig,

    /// Tool server supervision settings
    #[serde(default)]
    pub hypervisor: HypervisorConfig,

    /// Declared external tool servers
    #[serde(default)]
    pub tool_servers: Vec<ToolServerConfig>,

    /// Directories containing imported skill-package manifests
    #[serde(default)]
    pub skill_packages: Vec<PathBuf>,

    /// Workflow storage and scheduling
    #[serde(default)]
    pub workflows: WorkflowConfig,
}

/// Model provider settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the OpenAI-compatible endpoint
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Model name
    #[serde(default = "default_model")]
    pub model: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum tokens per response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Execution loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum model-response/tool-execution cycles per user request
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    /// Per-tool-call timeout in seconds
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,

    /// System prompt prepended to every conversation
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            tool_timeout_secs: default_tool_timeout(),
            system_prompt: default_system_prompt(),
        }
    }
}

/// Tool server supervision settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HypervisorConfig {
    /// How many times a crashed subprocess server is restarted before it is
    /// marked errored for good
    #[serde(default = "default_restart_ceiling")]
    pub restart_ceiling: u32,

    /// Handshake timeout in seconds (distinct from per-call timeouts)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            restart_ceiling: default_restart_ceiling(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

/// Static declaration of one external tool server.
///
/// Immutable once loaded; identity = `name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    /// Unique server name (also the tool-name prefix)
    pub name: String,

    /// How to reach the server
    #[serde(flatten)]
    pub transport: TransportConfig,

    /// Optional declared-capability hints (informational only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

/// Transport-specific connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Child process speaking line-framed JSON-RPC over stdin/stdout
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    /// Long-lived server-sent-event stream with a companion POST endpoint
    Sse { url: String },
    /// Independent HTTP request/response per call
    StreamableHttp { url: String },
}

impl TransportConfig {
    /// Short label for logs and error reports.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::Sse { .. } => "sse",
            TransportConfig::StreamableHttp { .. } => "streamable_http",
        }
    }
}

/// Workflow storage and scheduling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Directory holding workflow definition documents
    #[serde(default = "default_workflow_dir")]
    pub storage_dir: PathBuf,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            storage_dir: default_workflow_dir(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_model() -> String {
    "gpt-4o".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_max_turns() -> u32 {
    25
}
fn default_tool_timeout() -> u64 {
    60
}
fn default_system_prompt() -> String {
    "You are a helpful assistant with access to external tools. \
     Use them when the user's request requires acting on the outside world."
        .into()
}
fn default_restart_ceiling() -> u32 {
    3
}
fn default_connect_timeout() -> u64 {
    15
}
fn default_workflow_dir() -> PathBuf {
    home_dir().join(".toolmesh").join("workflows")
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("provider", &self.provider)
            .field("agent", &self.agent)
            .field("hypervisor", &self.hypervisor)
            .field("tool_servers", &self.tool_servers)
            .field("skill_packages", &self.skill_packages)
            .field("workflows", &self.workflows)
            .finish()
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &self.api_key.as_ref().map(|_| "[REDACTED]"),
            )
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            provider: ProviderConfig::default(),
            agent: AgentConfig::default(),
            hypervisor: HypervisorConfig::default(),
            tool_servers: Vec::new(),
            skill_packages: Vec::new(),
            workflows: WorkflowConfig::default(),
        }
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl AppConfig {
    /// The default config file location: `~/.toolmesh/config.toml`.
    pub fn default_path() -> PathBuf {
        home_dir().join(".toolmesh").join("config.toml")
    }

    /// Load configuration from the given path, applying env overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: AppConfig = toml::from_str(&raw)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from the default path, falling back to defaults if it is absent.
    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Using default config");
                let mut config = Self::default();
                config.apply_env_overrides();
                config
            }
        }
    }

    /// Write the configuration to the given path, creating parent dirs.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let raw = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Invalid(format!("serialization failed: {e}")))?;
        std::fs::write(path, raw).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `TOOLMESH_*` environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("TOOLMESH_API_KEY") {
            if !key.is_empty() {
                self.provider.api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("TOOLMESH_BASE_URL") {
            if !url.is_empty() {
                self.provider.base_url = url;
            }
        }
        if let Ok(model) = std::env::var("TOOLMESH_MODEL") {
            if !model.is_empty() {
                self.provider.model = model;
            }
        }
    }

    /// Validate the configuration, returning a list of human-readable problems.
    ///
    /// An empty list means the config is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.agent.max_turns == 0 {
            problems.push("agent.max_turns must be at least 1".into());
        }
        if self.agent.tool_timeout_secs == 0 {
            problems.push("agent.tool_timeout_secs must be at least 1".into());
        }

        let mut seen = std::collections::HashSet::new();
        for server in &self.tool_servers {
            if server.name.is_empty() {
                problems.push("tool server with empty name".into());
                continue;
            }
            if !seen.insert(server.name.as_str()) {
                problems.push(format!("duplicate tool server name '{}'", server.name));
            }
            match &server.transport {
                TransportConfig::Stdio { command, .. } => {
                    if command.is_empty() {
                        problems
                            .push(format!("tool server '{}' has an empty command", server.name));
                    }
                }
                TransportConfig::Sse { url } | TransportConfig::StreamableHttp { url } => {
                    if !url.starts_with("http://") && !url.starts_with("https://") {
                        problems.push(format!(
                            "tool server '{}' has a non-HTTP url: {url}",
                            server.name
                        ));
                    }
                }
            }
        }

        problems
    }
}
