//! Clock skill — tells the model the current date and time.
//!
//! Models have no reliable sense of "now"; scheduling and email-drafting
//! requests almost always need it.

use async_trait::async_trait;
use chrono::Utc;

use toolmesh_core::error::ToolError;
use toolmesh_core::tool::{Callable, ToolResult};

pub struct ClockSkill;

#[async_trait]
impl Callable for ClockSkill {
    fn name(&self) -> &str {
        "clock"
    }

    fn description(&self) -> &str {
        "Get the current date and time (UTC). Use before scheduling anything or referring to 'today'."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "format": {
                    "type": "string",
                    "enum": ["iso8601", "unix", "human"],
                    "description": "Output format (default: iso8601)"
                }
            }
        })
    }

    async fn invoke(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let now = Utc::now();
        let format = arguments["format"].as_str().unwrap_or("iso8601");
        let output = match format {
            "iso8601" => now.to_rfc3339(),
            "unix" => now.timestamp().to_string(),
            "human" => now.format("%A, %B %e %Y, %H:%M UTC").to_string(),
            other => {
                return Err(ToolError::InvalidArguments(format!(
                    "unknown format '{other}'"
                )))
            }
        };
        Ok(ToolResult::ok("", output))
    }
}
