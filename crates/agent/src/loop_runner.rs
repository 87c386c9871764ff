//! The conversation execution loop.
//!
//! A turn-by-turn state machine: send the history and available tools to the
//! model, execute any requested tool call, append the result, decide whether
//! to keep looping. Terminal conditions, in priority order:
//!
//! 1. the model answers with plain text (normal completion),
//! 2. a tool signals `HaltWithOutput` (final answer without another model
//!    round-trip),
//! 3. the turn ceiling is hit (fatal, surfaced as an incomplete-task
//!    outcome — never silently dropped),
//! 4. the surrounding request is cancelled (checked between turns only; an
//!    in-flight tool call is never forcibly interrupted).
//!
//! Messages are strictly appended in call order; the loop runs one tool call
//! at a time per conversation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use toolmesh_core::error::{Error, ToolError};
use toolmesh_core::event::{EventBus, LoopEvent};
use toolmesh_core::message::{Conversation, Message, Role};
use toolmesh_core::provider::{ModelProvider, ModelRequest};
use toolmesh_core::tool::{LoopSignal, ToolCall};
use toolmesh_registry::ToolRegistry;

use crate::continuation::enhance;

/// How a conversation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The model produced a final text answer.
    Completed { text: String },
    /// The turn ceiling was reached before the request was satisfied.
    TurnLimitReached { turns: u32 },
    /// The surrounding request was cancelled between turns.
    Cancelled,
}

/// The loop's explicit state. `Done` carries the outcome out of the machine.
enum LoopState {
    AwaitingModel,
    ExecutingTool { call: ToolCall },
    Done(LoopOutcome),
}

/// The turn-by-turn execution loop for one conversation at a time.
pub struct ExecutionLoop {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<ToolRegistry>,
    events: Arc<EventBus>,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    max_turns: u32,
    tool_timeout: Duration,
    system_prompt: String,
}

impl ExecutionLoop {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<ToolRegistry>,
        events: Arc<EventBus>,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            registry,
            events,
            model: model.into(),
            temperature: 0.7,
            max_tokens: None,
            max_turns: 25,
            tool_timeout: Duration::from_secs(60),
            system_prompt: system_prompt.into(),
        }
    }

    /// Set the maximum number of turns per user request.
    pub fn with_max_turns(mut self, max: u32) -> Self {
        self.max_turns = max;
        self
    }

    /// Set the per-tool-call timeout.
    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the max tokens per model response.
    pub fn with_max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    /// Run the loop to completion for one conversation.
    ///
    /// Tool-level failures are recovered into the conversation; only
    /// provider unavailability propagates as `Err`.
    pub async fn run(
        &self,
        conversation: &mut Conversation,
        cancel: watch::Receiver<bool>,
    ) -> Result<LoopOutcome, Error> {
        info!(
            conversation_id = %conversation.id,
            messages = conversation.messages.len(),
            "Running conversation"
        );

        // Ensure the system prompt leads the history.
        if conversation
            .messages
            .first()
            .map(|m| m.role != Role::System)
            .unwrap_or(true)
        {
            conversation
                .messages
                .insert(0, Message::system(&self.system_prompt));
        }

        let tool_definitions = self.registry.definitions().await;
        let mut state = LoopState::AwaitingModel;

        loop {
            state = match state {
                LoopState::AwaitingModel => {
                    // Turn boundary: the only safe points for cancellation
                    // and ceiling checks.
                    if *cancel.borrow() {
                        debug!(conversation_id = %conversation.id, "Conversation cancelled");
                        conversation.terminated = true;
                        LoopState::Done(LoopOutcome::Cancelled)
                    } else if conversation.turn_count >= self.max_turns {
                        warn!(
                            conversation_id = %conversation.id,
                            turns = conversation.turn_count,
                            "Turn ceiling reached before completion"
                        );
                        self.events.publish(LoopEvent::TurnLimitReached {
                            turns: conversation.turn_count,
                            timestamp: Utc::now(),
                        });
                        conversation.terminated = true;
                        LoopState::Done(LoopOutcome::TurnLimitReached {
                            turns: conversation.turn_count,
                        })
                    } else {
                        conversation.turn_count += 1;
                        self.await_model(conversation, &tool_definitions).await?
                    }
                }
                LoopState::ExecutingTool { call } => {
                    self.execute_tool(conversation, call).await
                }
                LoopState::Done(outcome) => {
                    conversation.terminated = true;
                    return Ok(outcome);
                }
            };
        }
    }

    /// One `AWAITING_MODEL` step: ask the model what to do next.
    async fn await_model(
        &self,
        conversation: &mut Conversation,
        tool_definitions: &[toolmesh_core::provider::ToolDefinition],
    ) -> Result<LoopState, Error> {
        debug!(
            conversation_id = %conversation.id,
            turn = conversation.turn_count,
            "Requesting model response"
        );

        let request = ModelRequest {
            model: self.model.clone(),
            messages: conversation.messages.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            tools: tool_definitions.to_vec(),
        };

        // Provider failure is loop-fatal: there is no conversation to have
        // without a model.
        let response = match self.provider.send(request).await {
            Ok(response) => response,
            Err(e) => {
                self.events.publish(LoopEvent::ErrorOccurred {
                    context: "model provider".into(),
                    error_message: e.to_string(),
                    timestamp: Utc::now(),
                });
                return Err(Error::Provider(e));
            }
        };

        match response.tool_call {
            Some(call) => {
                conversation.push(Message::assistant_tool_call(response.text, call.clone()));
                Ok(LoopState::ExecutingTool { call })
            }
            None => {
                let text = response.text;
                conversation.push(Message::assistant(&text));
                self.events.publish(LoopEvent::AssistantText {
                    content: text.clone(),
                    timestamp: Utc::now(),
                });
                Ok(LoopState::Done(LoopOutcome::Completed { text }))
            }
        }
    }

    /// One `EXECUTING_TOOL` step: resolve, invoke, append the result.
    async fn execute_tool(&self, conversation: &mut Conversation, call: ToolCall) -> LoopState {
        self.events.publish(LoopEvent::ToolStarted {
            tool_name: call.name.clone(),
            arguments: call.arguments.clone(),
            timestamp: Utc::now(),
        });
        let started = std::time::Instant::now();

        let Some(tool) = self.registry.resolve(&call.name).await else {
            // Unknown tool: tell the model instead of crashing the turn.
            warn!(tool = %call.name, "Model requested an unknown tool");
            conversation.push(Message::function_result(
                &call.id,
                format!(
                    "Error: tool '{}' is not available. Choose one of the listed tools.",
                    call.name
                ),
            ));
            self.publish_completed(&call.name, false, started);
            return LoopState::AwaitingModel;
        };

        let invocation = tokio::time::timeout(self.tool_timeout, tool.invoke(call.arguments.clone()));
        let result = match invocation.await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                tool: call.name.clone(),
                timeout_secs: self.tool_timeout.as_secs(),
            }),
        };

        match result {
            Ok(tool_result) => {
                if let LoopSignal::HaltWithOutput { output } = &tool_result.signal {
                    // The tool already produced the final answer; skip the
                    // extra model round-trip.
                    debug!(tool = %call.name, "Tool signalled halt with output");
                    conversation.push(Message::function_result(&call.id, &tool_result.output));
                    let text = output.clone();
                    conversation.push(Message::assistant(&text));
                    self.publish_completed(&call.name, tool_result.success, started);
                    self.events.publish(LoopEvent::AssistantText {
                        content: text.clone(),
                        timestamp: Utc::now(),
                    });
                    return LoopState::Done(LoopOutcome::Completed { text });
                }

                let enhanced =
                    enhance(&tool_result.output, conversation, &call.name, &call.arguments)
                        .into_owned();
                conversation.push(Message::function_result(&call.id, enhanced));
                self.publish_completed(&call.name, tool_result.success, started);
            }
            Err(e) => {
                // Call errors become conversation content the model can
                // react to: retry differently, pick another tool, apologize.
                warn!(tool = %call.name, error = %e, "Tool invocation failed");
                conversation.push(Message::function_result(&call.id, format!("Error: {e}")));
                self.publish_completed(&call.name, false, started);
            }
        }

        LoopState::AwaitingModel
    }

    fn publish_completed(&self, tool_name: &str, success: bool, started: std::time::Instant) {
        self.events.publish(LoopEvent::ToolCompleted {
            tool_name: tool_name.to_string(),
            success,
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: Utc::now(),
        });
    }
}
