//! End-to-end integration tests for the Toolmesh orchestration engine.
//!
//! These exercise the full pipeline — tool server boot, registry merge,
//! execution loop, continuation heuristic, and workflow interpretation —
//! with scripted providers and in-memory transports standing in for the
//! external world.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use toolmesh_agent::{ExecutionLoop, LoopOutcome};
use toolmesh_config::{AppConfig, HypervisorConfig, ToolServerConfig, TransportConfig};
use toolmesh_core::error::{ConnectError, ProviderError, ToolError};
use toolmesh_core::event::{EventBus, LoopEvent};
use toolmesh_core::message::{Conversation, Message, Role};
use toolmesh_core::provider::{ModelProvider, ModelRequest, ModelResponse};
use toolmesh_core::tool::ToolCall;
use toolmesh_hypervisor::{Hypervisor, ServerState};
use toolmesh_registry::ToolRegistry;
use toolmesh_transport::{RemoteToolSpec, ToolTransport};
use toolmesh_workflow::{
    MemoryWorkflowStore, WorkflowDefinition, WorkflowInterpreter, WorkflowStep, WorkflowStore,
};

// ── Scripted provider ────────────────────────────────────────────────────

struct ScriptedProvider {
    script: Mutex<VecDeque<ModelResponse>>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    fn new(script: Vec<ModelResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "e2e_scripted"
    }

    async fn send(&self, _request: ModelRequest) -> Result<ModelResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::NotConfigured("script exhausted".into()))
    }
}

fn text(content: &str) -> ModelResponse {
    ModelResponse {
        text: content.into(),
        tool_call: None,
        model: "scripted".into(),
        usage: None,
    }
}

fn call(id: &str, name: &str, args: serde_json::Value) -> ModelResponse {
    ModelResponse {
        text: String::new(),
        tool_call: Some(ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }),
        model: "scripted".into(),
        usage: None,
    }
}

// ── In-memory tool server transports ─────────────────────────────────────

/// A healthy server exposing a `send_email` tool; records every invocation.
struct MailServer {
    sent: Arc<Mutex<Vec<serde_json::Value>>>,
}

#[async_trait::async_trait]
impl ToolTransport for MailServer {
    fn kind(&self) -> &'static str {
        "mock"
    }
    async fn connect(&self) -> Result<(), ConnectError> {
        Ok(())
    }
    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, ToolError> {
        Ok(vec![RemoteToolSpec {
            name: "send_email".into(),
            description: "Send an email".into(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "to": {"type": "string"},
                    "body": {"type": "string"}
                },
                "required": ["to"]
            }),
        }])
    }
    async fn call_tool(
        &self,
        _name: &str,
        arguments: serde_json::Value,
        _timeout: Duration,
    ) -> Result<serde_json::Value, ToolError> {
        self.sent.lock().unwrap().push(arguments);
        Ok(serde_json::json!("Email sent successfully"))
    }
    async fn probe(&self) -> bool {
        true
    }
    async fn close(&self) {}
}

/// A server whose process dies before it can ever handshake.
struct DeadServer;

#[async_trait::async_trait]
impl ToolTransport for DeadServer {
    fn kind(&self) -> &'static str {
        "mock"
    }
    async fn connect(&self) -> Result<(), ConnectError> {
        Err(ConnectError::HandshakeFailed {
            server: "crashy".into(),
            reason: "process exited immediately".into(),
        })
    }
    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, ToolError> {
        Err(ToolError::ServerUnavailable {
            server: "crashy".into(),
            state: "stopped".into(),
        })
    }
    async fn call_tool(
        &self,
        name: &str,
        _arguments: serde_json::Value,
        _timeout: Duration,
    ) -> Result<serde_json::Value, ToolError> {
        Err(ToolError::Transport {
            tool: name.into(),
            reason: "dead".into(),
        })
    }
    async fn probe(&self) -> bool {
        false
    }
    async fn close(&self) {}
}

fn server_config(name: &str) -> ToolServerConfig {
    ToolServerConfig {
        name: name.into(),
        transport: TransportConfig::Stdio {
            command: "mock".into(),
            args: vec![],
            env: Default::default(),
        },
        capabilities: vec![],
    }
}

fn hypervisor_settings(ceiling: u32) -> HypervisorConfig {
    HypervisorConfig {
        restart_ceiling: ceiling,
        connect_timeout_secs: 1,
    }
}

// ── E2E: multi-target request driven to full completion ──────────────────

#[tokio::test]
async fn e2e_multi_target_email_request_completes_both_sends() {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let sent_for_factory = sent.clone();

    let hypervisor = Arc::new(Hypervisor::with_factory(
        vec![server_config("mailer")],
        &hypervisor_settings(1),
        Box::new(move |_, _| {
            Box::new(MailServer {
                sent: sent_for_factory.clone(),
            })
        }),
    ));
    hypervisor.boot_all().await;

    let registry = Arc::new(ToolRegistry::new(
        Some(hypervisor),
        toolmesh_skills::native_skills(),
        vec![],
        Duration::from_secs(5),
    ));
    registry.rebuild().await;

    // The model sends to a@x.com, sees the progress annotation, sends to
    // b@x.com, then wraps up.
    let provider = ScriptedProvider::new(vec![
        call(
            "call_1",
            "mailer__send_email",
            serde_json::json!({"to": "a@x.com", "body": "hi"}),
        ),
        call(
            "call_2",
            "mailer__send_email",
            serde_json::json!({"to": "b@x.com", "body": "hi"}),
        ),
        text("Both emails are on their way."),
    ]);

    let events = Arc::new(EventBus::default());
    let mut event_rx = events.subscribe();
    let runner = ExecutionLoop::new(
        provider.clone(),
        registry,
        events,
        "test-model",
        "You are an email assistant.",
    );

    let mut conversation = Conversation::new();
    conversation.push(Message::user("send a hello to a@x.com and b@x.com"));

    let (_tx, cancel) = tokio::sync::watch::channel(false);
    let outcome = runner.run(&mut conversation, cancel).await.unwrap();

    assert_eq!(
        outcome,
        LoopOutcome::Completed {
            text: "Both emails are on their way.".into()
        }
    );
    assert_eq!(provider.calls(), 3);

    // Both recipients actually received a call.
    let recipients: Vec<String> = sent
        .lock()
        .unwrap()
        .iter()
        .map(|args| args["to"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(recipients, vec!["a@x.com", "b@x.com"]);

    // The first tool result carried the continuation annotation.
    let first_result = conversation
        .messages
        .iter()
        .find(|m| m.role == Role::Function)
        .unwrap();
    assert!(first_result.content.contains("b@x.com"));

    // Events arrived in turn order: start/complete pairs then final text.
    let mut kinds = Vec::new();
    while let Ok(event) = event_rx.try_recv() {
        kinds.push(match event.as_ref() {
            LoopEvent::ToolStarted { .. } => "start",
            LoopEvent::ToolCompleted { .. } => "done",
            LoopEvent::AssistantText { .. } => "text",
            _ => "other",
        });
    }
    assert_eq!(kinds, vec!["start", "done", "start", "done", "text"]);
}

// ── E2E: partial boot failure leaves the healthy server fully usable ─────

#[tokio::test]
async fn e2e_dead_server_is_isolated_and_eventually_errored() {
    let sent = Arc::new(Mutex::new(Vec::new()));
    let sent_for_factory = sent.clone();

    let hypervisor = Arc::new(Hypervisor::with_factory(
        vec![server_config("crashy"), server_config("mailer")],
        &hypervisor_settings(2),
        Box::new(move |config, _| {
            if config.name == "crashy" {
                Box::new(DeadServer)
            } else {
                Box::new(MailServer {
                    sent: sent_for_factory.clone(),
                })
            }
        }),
    ));

    let outcomes = hypervisor.boot_all().await;
    assert_eq!(outcomes["mailer"].state, ServerState::Running);
    assert_ne!(outcomes["crashy"].state, ServerState::Running);

    // The healthy server's tools are fully listed and callable.
    let snapshot = hypervisor.tools_snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].name, "mailer__send_email");

    let result = hypervisor
        .call(
            "mailer__send_email",
            serde_json::json!({"to": "x@y.com"}),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
    assert_eq!(result, serde_json::json!("Email sent successfully"));

    // Supervision exhausts the restart ceiling and parks the dead server.
    for _ in 0..4 {
        hypervisor.supervise_tick().await;
    }
    let states = hypervisor.states().await;
    assert_eq!(states["crashy"], ServerState::Errored);
    assert_eq!(states["mailer"], ServerState::Running);
}

// ── E2E: workflow run against the registry and the loop ──────────────────

#[tokio::test]
async fn e2e_workflow_mixes_tool_and_llm_steps() {
    let registry = Arc::new(ToolRegistry::new(
        None,
        toolmesh_skills::native_skills(),
        vec![],
        Duration::from_secs(5),
    ));
    registry.rebuild().await;

    let provider = ScriptedProvider::new(vec![text("Subtotal is 35 — all good.")]);
    let runner = Arc::new(ExecutionLoop::new(
        provider.clone(),
        registry.clone(),
        Arc::new(EventBus::default()),
        "test-model",
        "system",
    ));
    let interpreter = WorkflowInterpreter::new(registry, runner);

    let store = MemoryWorkflowStore::new();
    let mut definition = WorkflowDefinition::new(
        "invoice-check",
        vec![
            WorkflowStep::Start {
                variables: serde_json::json!({"items": "5 * 7"})
                    .as_object()
                    .cloned()
                    .unwrap(),
            },
            WorkflowStep::ToolCall {
                tool: "calc".into(),
                params: serde_json::json!({"expression": "{{items}}"}),
                result_variable: Some("subtotal".into()),
            },
            WorkflowStep::LlmInstruction {
                instruction: "Check this subtotal: {{subtotal}}".into(),
                result_variable: Some("verdict".into()),
                direct_output: false,
            },
        ],
    );
    definition.rebuild();
    store.save(&definition).await.unwrap();

    let loaded = store.load(&definition.uuid).await.unwrap();
    let result = interpreter
        .execute(&loaded, serde_json::Map::new())
        .await;

    assert!(result.success);
    assert_eq!(result.step_results.len(), 3);
    assert_eq!(result.variables["subtotal"]["result"], 35.0);
    assert_eq!(result.variables["verdict"], "Subtotal is 35 — all good.");
    assert_eq!(provider.calls(), 1);
}

// ── E2E: the scheduling trigger drives workflow execution ────────────────

#[tokio::test(start_paused = true)]
async fn e2e_scheduled_run_skips_deactivated_workflow() {
    use toolmesh_workflow::{ScheduleEntry, WorkflowScheduler};

    let registry = Arc::new(ToolRegistry::new(
        None,
        toolmesh_skills::native_skills(),
        vec![],
        Duration::from_secs(5),
    ));
    registry.rebuild().await;
    let provider = ScriptedProvider::new(vec![]);
    let runner = Arc::new(ExecutionLoop::new(
        provider,
        registry.clone(),
        Arc::new(EventBus::default()),
        "test-model",
        "system",
    ));
    let interpreter = WorkflowInterpreter::new(registry, runner);

    let store = MemoryWorkflowStore::new();
    let mut active = WorkflowDefinition::new(
        "active",
        vec![
            WorkflowStep::Start {
                variables: serde_json::Map::new(),
            },
            WorkflowStep::ToolCall {
                tool: "calc".into(),
                params: serde_json::json!({"expression": "1 + 1"}),
                result_variable: Some("sum".into()),
            },
        ],
    );
    active.rebuild();
    store.save(&active).await.unwrap();

    let mut inactive = WorkflowDefinition::new(
        "inactive",
        vec![WorkflowStep::Start {
            variables: serde_json::Map::new(),
        }],
    );
    inactive.active = false;
    store.save(&inactive).await.unwrap();

    let scheduler = WorkflowScheduler::new(vec![
        ScheduleEntry {
            workflow: active.uuid,
            cadence_secs: 60,
            seed: serde_json::Map::new(),
        },
        ScheduleEntry {
            workflow: inactive.uuid,
            cadence_secs: 60,
            seed: serde_json::Map::new(),
        },
    ]);
    let (mut runs, handles) = scheduler.start();

    tokio::time::sleep(Duration::from_secs(61)).await;

    // Drain one cadence worth of triggers, executing as the daemon would:
    // load, skip inactive, run.
    let mut executed = Vec::new();
    for _ in 0..2 {
        let run = runs.recv().await.unwrap();
        let definition = store.load(&run.workflow).await.unwrap();
        if !definition.active {
            continue;
        }
        executed.push(interpreter.execute(&definition, run.seed).await);
    }
    for handle in handles {
        handle.abort();
    }

    assert_eq!(executed.len(), 1);
    assert!(executed[0].success);
    assert_eq!(executed[0].variables["sum"]["result"], 2.0);
}

// ── E2E: configuration drives the whole stack ────────────────────────────

#[tokio::test]
async fn e2e_config_declares_servers_and_skill_packages() {
    let packages = tempfile::tempdir().unwrap();
    std::fs::write(
        packages.path().join("crm.json"),
        r#"{
            "name": "crm",
            "skills": [{
                "name": "lookup_contact",
                "description": "Find a contact",
                "parameters": {"type": "object"},
                "endpoint": "https://crm.example.invalid/lookup"
            }]
        }"#,
    )
    .unwrap();

    let raw = format!(
        r#"
        skill_packages = ["{}"]

        [agent]
        max_turns = 7

        [[tool_servers]]
        name = "mailer"
        transport = "stdio"
        command = "mail-server"
        "#,
        packages.path().display()
    );
    let config: AppConfig = toml::from_str(&raw).unwrap();
    assert!(config.validate().is_empty());
    assert_eq!(config.agent.max_turns, 7);

    // Imported skills come straight out of the configured directory.
    let mut imported = Vec::new();
    for dir in &config.skill_packages {
        imported.extend(toolmesh_skills::load_packages_from_dir(dir));
    }
    assert_eq!(imported.len(), 1);

    let registry = Arc::new(ToolRegistry::new(
        None,
        toolmesh_skills::native_skills(),
        imported,
        Duration::from_secs(config.agent.tool_timeout_secs),
    ));
    registry.rebuild().await;

    assert!(registry.resolve("lookup_contact").await.is_some());
    assert!(registry.resolve("clock").await.is_some());
    assert!(registry.resolve("calc").await.is_some());
}
