//! Workflow definition documents.
//!
//! A workflow is a saved, named, ordered list of typed steps executed
//! against a shared variable environment — independent of any live chat.
//! Definitions are persisted as versioned documents keyed by UUID and
//! soft-deleted by clearing `active`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use toolmesh_core::error::WorkflowError;

/// Status of a definition's most recent (re)build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BuildStatus {
    /// Under construction; not yet runnable.
    #[default]
    Draft,
    /// Validated and runnable.
    Ready,
    /// The last build failed.
    Failed { message: String },
}

/// One typed step in a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowStep {
    /// Seeds the initial variable environment. Always first, always unique.
    Start {
        #[serde(default)]
        variables: serde_json::Map<String, serde_json::Value>,
    },

    /// Sends a templated instruction through the execution loop and stores
    /// the resulting text.
    LlmInstruction {
        instruction: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_variable: Option<String>,
        /// When set, the step's text becomes the whole workflow's output
        /// and execution short-circuits.
        #[serde(default)]
        direct_output: bool,
    },

    /// Resolves and invokes a named tool directly, bypassing the model.
    ToolCall {
        tool: String,
        #[serde(default)]
        params: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result_variable: Option<String>,
    },
}

impl WorkflowStep {
    /// Short label for step results and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowStep::Start { .. } => "start",
            WorkflowStep::LlmInstruction { .. } => "llm_instruction",
            WorkflowStep::ToolCall { .. } => "tool_call",
        }
    }
}

/// A persisted workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub uuid: Uuid,
    pub name: String,

    /// Cleared instead of deleting the document ("soft delete").
    pub active: bool,

    pub steps: Vec<WorkflowStep>,

    #[serde(default)]
    pub build_status: BuildStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Create a new active definition with the given steps.
    pub fn new(name: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        let now = Utc::now();
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            active: true,
            steps,
            build_status: BuildStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    /// Validate the step list: exactly one `start` step, and it comes first.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.steps.is_empty() {
            return Err(WorkflowError::InvalidDefinition(
                "workflow has no steps".into(),
            ));
        }
        if !matches!(self.steps[0], WorkflowStep::Start { .. }) {
            return Err(WorkflowError::InvalidDefinition(
                "first step must be 'start'".into(),
            ));
        }
        let starts = self
            .steps
            .iter()
            .filter(|s| matches!(s, WorkflowStep::Start { .. }))
            .count();
        if starts != 1 {
            return Err(WorkflowError::InvalidDefinition(format!(
                "expected exactly one 'start' step, found {starts}"
            )));
        }
        Ok(())
    }

    /// Validate and record the outcome in `build_status`.
    pub fn rebuild(&mut self) {
        self.build_status = match self.validate() {
            Ok(()) => BuildStatus::Ready,
            Err(e) => BuildStatus::Failed {
                message: e.to_string(),
            },
        };
        self.updated_at = Utc::now();
    }
}

/// The outcome of one step during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub index: usize,
    pub step: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-run execution record; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecutionResult {
    pub workflow: Uuid,
    pub success: bool,
    pub step_results: Vec<StepResult>,
    /// Final variable environment — successful steps' writes are retained
    /// even when a later step fails (workflows are not transactional).
    pub variables: serde_json::Map<String, serde_json::Value>,
    /// Set when a `direct_output` step short-circuited the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start_step() -> WorkflowStep {
        WorkflowStep::Start {
            variables: serde_json::Map::new(),
        }
    }

    #[test]
    fn valid_definition_passes() {
        let def = WorkflowDefinition::new(
            "daily-digest",
            vec![
                start_step(),
                WorkflowStep::LlmInstruction {
                    instruction: "Summarize {{topic}}".into(),
                    result_variable: Some("summary".into()),
                    direct_output: false,
                },
            ],
        );
        assert!(def.validate().is_ok());
    }

    #[test]
    fn empty_steps_rejected() {
        let def = WorkflowDefinition::new("empty", vec![]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn start_must_come_first() {
        let def = WorkflowDefinition::new(
            "bad",
            vec![
                WorkflowStep::ToolCall {
                    tool: "clock".into(),
                    params: serde_json::json!({}),
                    result_variable: None,
                },
                start_step(),
            ],
        );
        assert!(def.validate().is_err());
    }

    #[test]
    fn duplicate_start_rejected() {
        let def = WorkflowDefinition::new("bad", vec![start_step(), start_step()]);
        assert!(def.validate().is_err());
    }

    #[test]
    fn rebuild_records_status() {
        let mut good = WorkflowDefinition::new("ok", vec![start_step()]);
        good.rebuild();
        assert_eq!(good.build_status, BuildStatus::Ready);

        let mut bad = WorkflowDefinition::new("bad", vec![]);
        bad.rebuild();
        assert!(matches!(bad.build_status, BuildStatus::Failed { .. }));
    }

    #[test]
    fn step_serialization_uses_type_tags() {
        let step = WorkflowStep::ToolCall {
            tool: "gmail__send_email".into(),
            params: serde_json::json!({"to": "{{recipient}}"}),
            result_variable: Some("send_result".into()),
        };
        let json = serde_json::to_string(&step).unwrap();
        assert!(json.contains(r#""type":"tool_call""#));

        let parsed: WorkflowStep = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.kind(), "tool_call");
    }

    #[test]
    fn definition_roundtrip() {
        let def = WorkflowDefinition::new("roundtrip", vec![start_step()]);
        let json = serde_json::to_string(&def).unwrap();
        let parsed: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.uuid, def.uuid);
        assert_eq!(parsed.name, "roundtrip");
        assert!(parsed.active);
    }
}
