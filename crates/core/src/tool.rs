//! Callable tool abstractions.
//!
//! Every tool the model can invoke — whether discovered from an external
//! tool server, compiled in as a native skill, or imported from a skill
//! package — is wrapped in the same `Callable` contract: take JSON arguments,
//! return a `ToolResult` or a structured `ToolError`. Nothing may panic
//! across this boundary; the execution loop treats every call as total.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ToolError;
use crate::provider::ToolDefinition;

/// A request to execute a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique call ID (matches the model's tool_call id)
    pub id: String,

    /// Qualified name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    pub arguments: serde_json::Value,
}

/// What the loop should do after a tool call completes.
///
/// Tools that compose whole workflows can return `HaltWithOutput` to make
/// their result the conversation's final answer without another model
/// round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoopSignal {
    /// Append the result and go back to the model.
    #[default]
    Continue,
    /// Stop the loop; `output` is the final assistant answer.
    HaltWithOutput { output: String },
}

/// The result of a tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// The call ID this result is for
    pub call_id: String,

    /// Whether the tool executed successfully
    pub success: bool,

    /// The output content (what the model sees)
    pub output: String,

    /// Optional structured data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Loop control signal
    #[serde(default)]
    pub signal: LoopSignal,
}

impl ToolResult {
    /// A successful result carrying `output`.
    pub fn ok(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            output: output.into(),
            data: None,
            signal: LoopSignal::Continue,
        }
    }

    /// A failed result the model can react to.
    pub fn error(call_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            output: message.into(),
            data: None,
            signal: LoopSignal::Continue,
        }
    }

    /// Attach structured data.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Mark this result as the conversation's final answer.
    pub fn halting(mut self, output: impl Into<String>) -> Self {
        self.signal = LoopSignal::HaltWithOutput {
            output: output.into(),
        };
        self
    }
}

/// The uniform invocation contract for every tool in the registry.
///
/// Implementations must convert internal failures into `ToolError` (or a
/// `ToolResult` with `success = false` for business-level errors) rather
/// than panicking.
#[async_trait]
pub trait Callable: Send + Sync {
    /// The qualified, registry-unique name of this tool.
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Invoke the tool with the given arguments.
    async fn invoke(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError>;

    /// Convert this tool into a ToolDefinition for the model-facing tool list.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}
