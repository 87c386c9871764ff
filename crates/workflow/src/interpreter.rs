//! Workflow step interpreter.
//!
//! Executes a definition by walking its steps in order against a shared
//! variable environment. `llm_instruction` steps go through the execution
//! loop; `tool_call` steps invoke registry tools directly, bypassing the
//! model. The first failing step halts the run — earlier steps' variable
//! writes are retained, never rolled back.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, warn};

use toolmesh_agent::{ExecutionLoop, LoopOutcome};
use toolmesh_core::message::{Conversation, Message};
use toolmesh_registry::ToolRegistry;

use crate::definition::{
    StepResult, WorkflowDefinition, WorkflowExecutionResult, WorkflowStep,
};

type Variables = serde_json::Map<String, serde_json::Value>;

/// Substitute `{{name}}` placeholders in a template string.
///
/// Unknown placeholders are left untouched so the failure is visible in the
/// produced text rather than silently blanked.
pub fn substitute(template: &str, variables: &Variables) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str("{{");
            rest = after;
            continue;
        };
        let key = after[..end].trim();
        match variables.get(key) {
            Some(serde_json::Value::String(s)) => out.push_str(s),
            Some(value) => out.push_str(&value.to_string()),
            None => {
                out.push_str("{{");
                out.push_str(&after[..end]);
                out.push_str("}}");
            }
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

/// Substitute placeholders throughout a JSON params tree.
///
/// A string that is exactly one placeholder (`"{{var}}"`) is replaced by the
/// variable's JSON value, preserving its type; mixed strings substitute
/// textually.
pub fn substitute_params(params: &serde_json::Value, variables: &Variables) -> serde_json::Value {
    match params {
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            if let Some(key) = trimmed
                .strip_prefix("{{")
                .and_then(|k| k.strip_suffix("}}"))
            {
                if let Some(value) = variables.get(key.trim()) {
                    return value.clone();
                }
            }
            serde_json::Value::String(substitute(s, variables))
        }
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items.iter().map(|v| substitute_params(v, variables)).collect(),
        ),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_params(v, variables)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Executes workflow definitions against the registry and execution loop.
pub struct WorkflowInterpreter {
    registry: Arc<ToolRegistry>,
    loop_runner: Arc<ExecutionLoop>,
}

impl WorkflowInterpreter {
    pub fn new(registry: Arc<ToolRegistry>, loop_runner: Arc<ExecutionLoop>) -> Self {
        Self {
            registry,
            loop_runner,
        }
    }

    /// Run a definition with the given seed variables.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        seed: Variables,
    ) -> WorkflowExecutionResult {
        let mut result = WorkflowExecutionResult {
            workflow: definition.uuid,
            success: false,
            step_results: Vec::new(),
            variables: Variables::new(),
            output: None,
        };

        if let Err(e) = definition.validate() {
            warn!(workflow = %definition.uuid, error = %e, "Refusing to run invalid workflow");
            result.step_results.push(StepResult {
                index: 0,
                step: "start".into(),
                success: false,
                value: None,
                error: Some(e.to_string()),
            });
            return result;
        }

        debug!(workflow = %definition.uuid, name = %definition.name, steps = definition.steps.len(), "Executing workflow");

        for (index, step) in definition.steps.iter().enumerate() {
            let step_outcome = self.run_step(step, &seed, &mut result.variables).await;
            match step_outcome {
                StepOutcome::Ok(value) => {
                    result.step_results.push(StepResult {
                        index,
                        step: step.kind().into(),
                        success: true,
                        value,
                        error: None,
                    });
                }
                StepOutcome::Direct(text) => {
                    result.step_results.push(StepResult {
                        index,
                        step: step.kind().into(),
                        success: true,
                        value: Some(serde_json::Value::String(text.clone())),
                        error: None,
                    });
                    result.output = Some(text);
                    result.success = true;
                    return result;
                }
                StepOutcome::Failed(message) => {
                    warn!(
                        workflow = %definition.uuid,
                        step = index,
                        error = %message,
                        "Workflow step failed, halting"
                    );
                    result.step_results.push(StepResult {
                        index,
                        step: step.kind().into(),
                        success: false,
                        value: None,
                        error: Some(message),
                    });
                    return result;
                }
            }
        }

        result.success = true;
        result
    }

    async fn run_step(
        &self,
        step: &WorkflowStep,
        seed: &Variables,
        variables: &mut Variables,
    ) -> StepOutcome {
        match step {
            WorkflowStep::Start {
                variables: initial,
            } => {
                // Definition defaults first, then scheduler-provided seed
                // values override them.
                for (k, v) in initial {
                    variables.insert(k.clone(), v.clone());
                }
                for (k, v) in seed {
                    variables.insert(k.clone(), v.clone());
                }
                StepOutcome::Ok(None)
            }

            WorkflowStep::LlmInstruction {
                instruction,
                result_variable,
                direct_output,
            } => {
                let prompt = substitute(instruction, variables);
                let mut conversation = Conversation::new();
                conversation.push(Message::user(&prompt));

                let (_cancel_tx, cancel_rx) = watch::channel(false);
                let text = match self.loop_runner.run(&mut conversation, cancel_rx).await {
                    Ok(LoopOutcome::Completed { text }) => text,
                    Ok(LoopOutcome::TurnLimitReached { turns }) => {
                        return StepOutcome::Failed(format!(
                            "instruction did not complete within {turns} turns"
                        ));
                    }
                    Ok(LoopOutcome::Cancelled) => {
                        return StepOutcome::Failed("instruction was cancelled".into());
                    }
                    Err(e) => return StepOutcome::Failed(e.to_string()),
                };

                if let Some(name) = result_variable {
                    variables.insert(name.clone(), serde_json::Value::String(text.clone()));
                }
                if *direct_output {
                    return StepOutcome::Direct(text);
                }
                StepOutcome::Ok(Some(serde_json::Value::String(text)))
            }

            WorkflowStep::ToolCall {
                tool,
                params,
                result_variable,
            } => {
                let Some(callable) = self.registry.resolve(tool).await else {
                    return StepOutcome::Failed(format!("tool '{tool}' not found"));
                };
                let arguments = substitute_params(params, variables);

                match callable.invoke(arguments).await {
                    Ok(tool_result) if tool_result.success => {
                        let value = tool_result
                            .data
                            .clone()
                            .unwrap_or(serde_json::Value::String(tool_result.output.clone()));
                        if let Some(name) = result_variable {
                            variables.insert(name.clone(), value.clone());
                        }
                        StepOutcome::Ok(Some(value))
                    }
                    Ok(tool_result) => StepOutcome::Failed(format!(
                        "tool '{tool}' reported failure: {}",
                        tool_result.output
                    )),
                    Err(e) => StepOutcome::Failed(e.to_string()),
                }
            }
        }
    }
}

enum StepOutcome {
    Ok(Option<serde_json::Value>),
    Direct(String),
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use toolmesh_core::error::{ProviderError, ToolError};
    use toolmesh_core::event::EventBus;
    use toolmesh_core::provider::{ModelProvider, ModelRequest, ModelResponse};
    use toolmesh_core::tool::{Callable, ToolResult};

    struct ScriptedProvider {
        script: Mutex<VecDeque<String>>,
        calls: AtomicU32,
        last_prompt: Mutex<String>,
    }

    impl ScriptedProvider {
        fn new(responses: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(responses.iter().map(|s| s.to_string()).collect()),
                calls: AtomicU32::new(0),
                last_prompt: Mutex::new(String::new()),
            })
        }
    }

    #[async_trait]
    impl ModelProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn send(&self, request: ModelRequest) -> Result<ModelResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(user) = request.messages.iter().rev().find(|m| {
                m.role == toolmesh_core::message::Role::User
            }) {
                *self.last_prompt.lock().unwrap() = user.content.clone();
            }
            let text = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "fallback".into());
            Ok(ModelResponse {
                text,
                tool_call: None,
                model: "scripted".into(),
                usage: None,
            })
        }
    }

    struct FlakySkill {
        name: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl Callable for FlakySkill {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "test"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }
        async fn invoke(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
            if self.fail {
                return Ok(ToolResult::error("", "simulated failure"));
            }
            Ok(ToolResult::ok("", "tool output").with_data(serde_json::json!({
                "echo": arguments
            })))
        }
    }

    async fn interpreter_with(
        provider: Arc<ScriptedProvider>,
        skills: Vec<Arc<dyn Callable>>,
    ) -> WorkflowInterpreter {
        let registry = Arc::new(ToolRegistry::new(
            None,
            skills,
            vec![],
            Duration::from_secs(5),
        ));
        registry.rebuild().await;
        let loop_runner = Arc::new(ExecutionLoop::new(
            provider,
            registry.clone(),
            Arc::new(EventBus::default()),
            "test-model",
            "system",
        ));
        WorkflowInterpreter::new(registry, loop_runner)
    }

    fn start_with(vars: serde_json::Value) -> WorkflowStep {
        WorkflowStep::Start {
            variables: vars.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn substitute_replaces_known_keys() {
        let mut vars = Variables::new();
        vars.insert("name".into(), serde_json::json!("Ada"));
        vars.insert("count".into(), serde_json::json!(3));
        assert_eq!(
            substitute("Hello {{name}}, you have {{count}} tasks", &vars),
            "Hello Ada, you have 3 tasks"
        );
    }

    #[test]
    fn substitute_leaves_unknown_keys_visible() {
        let vars = Variables::new();
        assert_eq!(substitute("Hi {{who}}", &vars), "Hi {{who}}");
    }

    #[test]
    fn substitute_params_preserves_value_types() {
        let mut vars = Variables::new();
        vars.insert("ids".into(), serde_json::json!([1, 2, 3]));
        vars.insert("name".into(), serde_json::json!("Ada"));

        let params = serde_json::json!({
            "targets": "{{ids}}",
            "label": "for {{name}}"
        });
        let out = substitute_params(&params, &vars);
        assert_eq!(out["targets"], serde_json::json!([1, 2, 3]));
        assert_eq!(out["label"], "for Ada");
    }

    #[tokio::test]
    async fn three_step_workflow_halts_on_middle_failure() {
        let provider = ScriptedProvider::new(&[]);
        let interpreter = interpreter_with(
            provider,
            vec![
                Arc::new(FlakySkill {
                    name: "broken",
                    fail: true,
                }),
                Arc::new(FlakySkill {
                    name: "never_reached",
                    fail: false,
                }),
            ],
        )
        .await;

        let definition = WorkflowDefinition::new(
            "halts",
            vec![
                start_with(serde_json::json!({"greeting": "hello"})),
                WorkflowStep::ToolCall {
                    tool: "broken".into(),
                    params: serde_json::json!({}),
                    result_variable: Some("broken_result".into()),
                },
                WorkflowStep::ToolCall {
                    tool: "never_reached".into(),
                    params: serde_json::json!({}),
                    result_variable: None,
                },
            ],
        );

        let result = interpreter.execute(&definition, Variables::new()).await;

        assert!(!result.success);
        // Start plus the failing step; step 3 never ran.
        assert_eq!(result.step_results.len(), 2);
        assert_eq!(result.step_results[1].index, 1);
        assert!(result.step_results[1]
            .error
            .as_deref()
            .unwrap()
            .contains("simulated failure"));
        // Step 1's variable writes survive the failure.
        assert_eq!(result.variables["greeting"], "hello");
        assert!(!result.variables.contains_key("broken_result"));
    }

    #[tokio::test]
    async fn llm_step_substitutes_and_stores_result() {
        let provider = ScriptedProvider::new(&["Rust is a systems language."]);
        let interpreter = interpreter_with(provider.clone(), vec![]).await;

        let definition = WorkflowDefinition::new(
            "summarize",
            vec![
                start_with(serde_json::json!({})),
                WorkflowStep::LlmInstruction {
                    instruction: "Summarize {{topic}} in one line".into(),
                    result_variable: Some("summary".into()),
                    direct_output: false,
                },
            ],
        );

        let mut seed = Variables::new();
        seed.insert("topic".into(), serde_json::json!("Rust"));
        let result = interpreter.execute(&definition, seed).await;

        assert!(result.success);
        assert_eq!(result.variables["summary"], "Rust is a systems language.");
        assert_eq!(
            *provider.last_prompt.lock().unwrap(),
            "Summarize Rust in one line"
        );
    }

    #[tokio::test]
    async fn direct_output_short_circuits() {
        let provider = ScriptedProvider::new(&["The final report."]);
        let interpreter = interpreter_with(provider.clone(), vec![]).await;

        let definition = WorkflowDefinition::new(
            "report",
            vec![
                start_with(serde_json::json!({})),
                WorkflowStep::LlmInstruction {
                    instruction: "Write the report".into(),
                    result_variable: None,
                    direct_output: true,
                },
                WorkflowStep::LlmInstruction {
                    instruction: "This never runs".into(),
                    result_variable: None,
                    direct_output: false,
                },
            ],
        );

        let result = interpreter.execute(&definition, Variables::new()).await;

        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("The final report."));
        assert_eq!(result.step_results.len(), 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tool_step_receives_substituted_params() {
        let provider = ScriptedProvider::new(&[]);
        let interpreter = interpreter_with(
            provider,
            vec![Arc::new(FlakySkill {
                name: "echo",
                fail: false,
            })],
        )
        .await;

        let definition = WorkflowDefinition::new(
            "echoer",
            vec![
                start_with(serde_json::json!({"who": "ada@example.com"})),
                WorkflowStep::ToolCall {
                    tool: "echo".into(),
                    params: serde_json::json!({"to": "{{who}}"}),
                    result_variable: Some("echoed".into()),
                },
            ],
        );

        let result = interpreter.execute(&definition, Variables::new()).await;
        assert!(result.success);
        assert_eq!(
            result.variables["echoed"]["echo"]["to"],
            "ada@example.com"
        );
    }

    #[tokio::test]
    async fn unknown_tool_fails_the_step() {
        let provider = ScriptedProvider::new(&[]);
        let interpreter = interpreter_with(provider, vec![]).await;

        let definition = WorkflowDefinition::new(
            "missing",
            vec![
                start_with(serde_json::json!({})),
                WorkflowStep::ToolCall {
                    tool: "ghost".into(),
                    params: serde_json::json!({}),
                    result_variable: None,
                },
            ],
        );

        let result = interpreter.execute(&definition, Variables::new()).await;
        assert!(!result.success);
        assert!(result.step_results[1]
            .error
            .as_deref()
            .unwrap()
            .contains("ghost"));
    }

    #[tokio::test]
    async fn invalid_definition_refused() {
        let provider = ScriptedProvider::new(&[]);
        let interpreter = interpreter_with(provider, vec![]).await;

        let definition = WorkflowDefinition::new("no-start", vec![]);
        let result = interpreter.execute(&definition, Variables::new()).await;
        assert!(!result.success);
        assert_eq!(result.step_results.len(), 1);
        assert!(!result.step_results[0].success);
    }

    #[tokio::test]
    async fn seed_overrides_start_defaults() {
        let provider = ScriptedProvider::new(&[]);
        let interpreter = interpreter_with(provider, vec![]).await;

        let definition = WorkflowDefinition::new(
            "defaults",
            vec![start_with(
                serde_json::json!({"region": "eu", "tier": "free"}),
            )],
        );

        let mut seed = Variables::new();
        seed.insert("region".into(), serde_json::json!("us"));
        let result = interpreter.execute(&definition, seed).await;

        assert!(result.success);
        assert_eq!(result.variables["region"], "us");
        assert_eq!(result.variables["tier"], "free");
    }
}
