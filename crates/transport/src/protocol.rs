//! JSON-RPC 2.0 wire types shared by all three transports.
//!
//! Tool servers speak a small JSON-RPC surface: an `initialize` handshake,
//! `tools/list` for discovery, and `tools/call` for invocation. The framing
//! differs per transport (newline-delimited for stdio, SSE events, plain
//! HTTP bodies), but the payloads are identical.

use serde::{Deserialize, Serialize};
use toolmesh_core::error::ToolError;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RpcRequest {
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct RpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl RpcNotification {
    pub fn new(method: &str) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            method: method.into(),
            params: None,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Unwrap into the result value, mapping a JSON-RPC error object to a
    /// transport-level `ToolError`.
    pub fn into_result(self, tool: &str) -> Result<serde_json::Value, ToolError> {
        if let Some(err) = self.error {
            return Err(ToolError::Transport {
                tool: tool.to_string(),
                reason: format!("JSON-RPC error {}: {}", err.code, err.message),
            });
        }
        Ok(self.result.unwrap_or(serde_json::Value::Null))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A tool as declared by a server in its `tools/list` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteToolSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "default_schema")]
    pub input_schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({"type": "object"})
}

/// `initialize` request params.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: ClientInfo,
}

impl InitializeParams {
    pub fn current() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: ClientCapabilities {},
            client_info: ClientInfo {
                name: "toolmesh".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ClientCapabilities {}

#[derive(Debug, Serialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

/// `tools/call` request params.
#[derive(Debug, Serialize)]
pub struct CallParams {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// `tools/call` result payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CallResult {
    #[serde(default)]
    pub content: Vec<ContentPart>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Interpret a raw `tools/call` result value.
///
/// A result with `isError: true` is a business error reported by the tool
/// itself — distinct from a transport fault — and maps to
/// `ToolError::Business`.
pub fn interpret_call_result(
    tool: &str,
    raw: serde_json::Value,
) -> Result<serde_json::Value, ToolError> {
    let parsed: CallResult = match serde_json::from_value(raw.clone()) {
        Ok(p) => p,
        // Servers that return plain JSON instead of the content envelope.
        Err(_) => return Ok(raw),
    };

    let text = parsed
        .content
        .iter()
        .filter_map(|c| c.text.as_deref())
        .collect::<Vec<_>>()
        .join("\n");

    if parsed.is_error {
        return Err(ToolError::Business {
            tool: tool.to_string(),
            message: text,
        });
    }

    // Single text part: try JSON first, fall back to a plain string.
    match serde_json::from_str(&text) {
        Ok(v) => Ok(v),
        Err(_) => Ok(serde_json::Value::String(text)),
    }
}
