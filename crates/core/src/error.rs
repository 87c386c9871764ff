//! Error types for the Toolmesh domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error variant.

use thiserror::Error;

/// The top-level error type for all Toolmesh operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Tool server connection errors ---
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    // --- Tool invocation errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Model provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Workflow errors ---
    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    // --- Configuration errors ---
    #[error("Configuration error: {message}")]
    Config { message: String },

    // --- Serialization ---
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// A tool server could not be reached or failed its handshake.
///
/// Connect errors are always isolated per-server: the hypervisor records
/// them against the one server and keeps the rest of the ecosystem alive.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Failed to spawn '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("Handshake with '{server}' failed: {reason}")]
    HandshakeFailed { server: String, reason: String },

    #[error("Connect to '{server}' timed out after {timeout_secs}s")]
    Timeout { server: String, timeout_secs: u64 },

    #[error("Invalid server configuration for '{server}': {reason}")]
    InvalidConfig { server: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A tool invocation failed.
///
/// `Transport` and `Timeout` are infrastructure faults; `Business` is an
/// error the tool itself reported. The execution loop converts all of these
/// into function-role error messages rather than crashing the turn.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Server '{server}' is not running ({state})")]
    ServerUnavailable { server: String, state: String },

    #[error("Transport failure calling '{tool}': {reason}")]
    Transport { tool: String, reason: String },

    #[error("Tool timed out: {tool} after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("Tool '{tool}' reported an error: {message}")]
    Business { tool: String, message: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError { status_code: u16, message: String },

    #[error("Rate limited by provider, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Workflow not found: {0}")]
    NotFound(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Step {index} ('{step}') failed: {message}")]
    StepFailed {
        index: usize,
        step: String,
        message: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),
}
