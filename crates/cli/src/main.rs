//! Toolmesh CLI — the main entry point.
//!
//! Commands:
//! - `run`      — Send one message through the execution loop
//! - `servers`  — Boot configured tool servers and report their status
//! - `workflow` — List or run saved workflows

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::watch;

use toolmesh_agent::{ExecutionLoop, LoopOutcome};
use toolmesh_config::AppConfig;
use toolmesh_core::event::{EventBus, LoopEvent};
use toolmesh_core::message::{Conversation, Message};
use toolmesh_hypervisor::Hypervisor;
use toolmesh_providers::OpenAiCompatProvider;
use toolmesh_registry::ToolRegistry;
use toolmesh_workflow::{FileWorkflowStore, WorkflowInterpreter, WorkflowStore};

#[derive(Parser)]
#[command(
    name = "toolmesh",
    about = "Toolmesh — agent tool-orchestration engine",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the config file (default: ~/.toolmesh/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a single message through the agent
    Run {
        /// The user message
        #[arg(short, long)]
        message: String,
    },

    /// Boot configured tool servers and print their status
    Servers,

    /// Workflow operations
    Workflow {
        #[command(subcommand)]
        command: WorkflowCommands,
    },
}

#[derive(Subcommand)]
enum WorkflowCommands {
    /// List saved workflows
    List {
        /// Include inactive (soft-deleted) workflows
        #[arg(long)]
        all: bool,
    },

    /// Run a workflow by UUID
    Run {
        uuid: uuid::Uuid,

        /// Seed variables as key=value pairs
        #[arg(long = "var")]
        vars: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => AppConfig::load(path).context("loading config")?,
        None => AppConfig::load_or_default(),
    };
    let problems = config.validate();
    if !problems.is_empty() {
        for problem in &problems {
            eprintln!("config error: {problem}");
        }
        bail!("invalid configuration ({} problem(s))", problems.len());
    }

    match cli.command {
        Commands::Run { message } => run_message(&config, &message).await,
        Commands::Servers => show_servers(&config).await,
        Commands::Workflow { command } => match command {
            WorkflowCommands::List { all } => list_workflows(&config, all).await,
            WorkflowCommands::Run { uuid, vars } => run_workflow(&config, uuid, vars).await,
        },
    }
}

/// Boot the hypervisor and build the merged tool registry.
async fn build_registry(config: &AppConfig) -> (Arc<Hypervisor>, Arc<ToolRegistry>) {
    let hypervisor = Arc::new(Hypervisor::new(
        config.tool_servers.clone(),
        &config.hypervisor,
    ));
    let outcomes = hypervisor.boot_all().await;
    for outcome in outcomes.values() {
        if let Some(error) = &outcome.error {
            eprintln!(
                "warning: tool server '{}' ({}) failed to boot: {error}",
                outcome.server, outcome.transport
            );
        }
    }

    let mut imported = Vec::new();
    for dir in &config.skill_packages {
        imported.extend(toolmesh_skills::load_packages_from_dir(dir));
    }

    let registry = Arc::new(ToolRegistry::new(
        Some(hypervisor.clone()),
        toolmesh_skills::native_skills(),
        imported,
        Duration::from_secs(config.agent.tool_timeout_secs),
    ));
    registry.rebuild().await;
    (hypervisor, registry)
}

fn build_loop(
    config: &AppConfig,
    registry: Arc<ToolRegistry>,
    events: Arc<EventBus>,
) -> ExecutionLoop {
    let provider = Arc::new(OpenAiCompatProvider::new(
        "openai-compat",
        &config.provider.base_url,
        config.provider.api_key.clone().unwrap_or_default(),
    ));
    ExecutionLoop::new(
        provider,
        registry,
        events,
        &config.provider.model,
        &config.agent.system_prompt,
    )
    .with_max_turns(config.agent.max_turns)
    .with_tool_timeout(Duration::from_secs(config.agent.tool_timeout_secs))
    .with_temperature(config.provider.temperature)
    .with_max_tokens(config.provider.max_tokens)
}

async fn run_message(config: &AppConfig, message: &str) -> anyhow::Result<()> {
    let (hypervisor, registry) = build_registry(config).await;

    let events = Arc::new(EventBus::default());
    let mut event_rx = events.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            match event.as_ref() {
                LoopEvent::ToolStarted { tool_name, .. } => {
                    println!("⚙ calling {tool_name} ...");
                }
                LoopEvent::ToolCompleted {
                    tool_name,
                    success,
                    duration_ms,
                    ..
                } => {
                    let mark = if *success { "✓" } else { "✗" };
                    println!("{mark} {tool_name} ({duration_ms}ms)");
                }
                _ => {}
            }
        }
    });

    let runner = build_loop(config, registry, events);
    let mut conversation = Conversation::new();
    conversation.push(Message::user(message));

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let outcome = runner.run(&mut conversation, cancel_rx).await;

    printer.abort();
    hypervisor.shutdown().await;

    match outcome? {
        LoopOutcome::Completed { text } => {
            println!("\n{text}");
            Ok(())
        }
        LoopOutcome::TurnLimitReached { turns } => {
            bail!("could not complete the request within {turns} turns")
        }
        LoopOutcome::Cancelled => bail!("request was cancelled"),
    }
}

async fn show_servers(config: &AppConfig) -> anyhow::Result<()> {
    if config.tool_servers.is_empty() {
        println!("no tool servers configured");
        return Ok(());
    }

    let hypervisor = Arc::new(Hypervisor::new(
        config.tool_servers.clone(),
        &config.hypervisor,
    ));
    let mut outcomes: Vec<_> = hypervisor.boot_all().await.into_values().collect();
    outcomes.sort_by(|a, b| a.server.cmp(&b.server));

    println!("{:<20} {:<16} {:<10} {:<6}", "SERVER", "TRANSPORT", "STATE", "TOOLS");
    for outcome in &outcomes {
        println!(
            "{:<20} {:<16} {:<10} {:<6}",
            outcome.server, outcome.transport, outcome.state, outcome.tool_count
        );
        if let Some(error) = &outcome.error {
            println!("    └─ {error}");
        }
    }

    hypervisor.shutdown().await;
    Ok(())
}

async fn list_workflows(config: &AppConfig, all: bool) -> anyhow::Result<()> {
    let store = FileWorkflowStore::new(&config.workflows.storage_dir);
    let workflows = store.list(!all).await?;
    if workflows.is_empty() {
        println!("no workflows found");
        return Ok(());
    }
    for workflow in workflows {
        let marker = if workflow.active { "" } else { " (inactive)" };
        println!(
            "{}  {}{}  [{} steps]",
            workflow.uuid,
            workflow.name,
            marker,
            workflow.steps.len()
        );
    }
    Ok(())
}

async fn run_workflow(
    config: &AppConfig,
    uuid: uuid::Uuid,
    vars: Vec<String>,
) -> anyhow::Result<()> {
    let store = FileWorkflowStore::new(&config.workflows.storage_dir);
    let definition = store.load(&uuid).await?;
    if !definition.active {
        bail!("workflow {uuid} is inactive");
    }

    let mut seed = serde_json::Map::new();
    for var in &vars {
        let Some((key, value)) = var.split_once('=') else {
            bail!("--var expects key=value, got '{var}'");
        };
        seed.insert(key.to_string(), serde_json::Value::String(value.to_string()));
    }

    let (hypervisor, registry) = build_registry(config).await;
    let events = Arc::new(EventBus::default());
    let runner = Arc::new(build_loop(config, registry.clone(), events));
    let interpreter = WorkflowInterpreter::new(registry, runner);

    let result = interpreter.execute(&definition, seed).await;
    hypervisor.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        bail!("workflow failed");
    }
    Ok(())
}
