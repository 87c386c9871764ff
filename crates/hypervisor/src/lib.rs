//! Tool server supervisor ("hypervisor").
//!
//! Owns the full lifecycle of every configured tool server: boots each one
//! through the right transport, caches its discovered tools, monitors
//! liveness, and restarts crashed servers up to a bounded ceiling. One
//! misconfigured server must never take the rest of the tool ecosystem down
//! — every boot and every call is isolated per-server, and failures are
//! reported with enough detail (server name, transport, underlying error)
//! for callers to disable a single tool source.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use toolmesh_config::{HypervisorConfig, ToolServerConfig};
use toolmesh_core::error::ToolError;
use toolmesh_core::provider::ToolDefinition;
use toolmesh_transport::{transport_for, RemoteToolSpec, ToolTransport};

/// Separator between the server prefix and the tool name in a qualified name.
const QUALIFIER: &str = "__";

/// Last-known liveness state of a supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Handshake in progress.
    Booting,
    /// Connected; tools discovered and callable.
    Running,
    /// Failed past the restart ceiling; not retried further.
    Errored,
    /// Not currently connected (initial state, crash, or shutdown).
    Stopped,
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServerState::Booting => "booting",
            ServerState::Running => "running",
            ServerState::Errored => "errored",
            ServerState::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// Per-server result of `boot_all`.
#[derive(Debug, Clone)]
pub struct BootOutcome {
    pub server: String,
    pub transport: &'static str,
    pub state: ServerState,
    pub tool_count: usize,
    pub error: Option<String>,
}

/// Runtime record for one supervised server. Mutated only by the hypervisor.
struct ServerHandle {
    config: ToolServerConfig,
    transport: Arc<dyn ToolTransport>,
    state: ServerState,
    tools: Vec<RemoteToolSpec>,
    restart_attempts: u32,
    last_error: Option<String>,
}

/// Builds a transport for a server declaration; swappable for tests.
pub type TransportFactory =
    Box<dyn Fn(&ToolServerConfig, Duration) -> Box<dyn ToolTransport> + Send + Sync>;

/// The tool server supervisor.
pub struct Hypervisor {
    servers: RwLock<HashMap<String, ServerHandle>>,
    restart_ceiling: u32,
    connect_timeout: Duration,
}

impl Hypervisor {
    /// Create a hypervisor over the given server declarations.
    pub fn new(configs: Vec<ToolServerConfig>, settings: &HypervisorConfig) -> Self {
        Self::with_factory(configs, settings, Box::new(transport_for))
    }

    /// Create a hypervisor with a custom transport factory (used by tests).
    pub fn with_factory(
        configs: Vec<ToolServerConfig>,
        settings: &HypervisorConfig,
        factory: TransportFactory,
    ) -> Self {
        let connect_timeout = Duration::from_secs(settings.connect_timeout_secs);
        let servers = configs
            .into_iter()
            .map(|config| {
                let transport: Arc<dyn ToolTransport> =
                    Arc::from(factory(&config, connect_timeout));
                (
                    config.name.clone(),
                    ServerHandle {
                        config,
                        transport,
                        state: ServerState::Stopped,
                        tools: Vec::new(),
                        restart_attempts: 0,
                        last_error: None,
                    },
                )
            })
            .collect();
        Self {
            servers: RwLock::new(servers),
            restart_ceiling: settings.restart_ceiling,
            connect_timeout,
        }
    }

    /// Boot every configured server independently and concurrently.
    ///
    /// A slow or broken server delays or disables only itself.
    pub async fn boot_all(&self) -> HashMap<String, BootOutcome> {
        let names: Vec<String> = self.servers.read().await.keys().cloned().collect();
        let outcomes =
            futures::future::join_all(names.iter().map(|name| self.boot_server(name))).await;
        names.into_iter().zip(outcomes).collect()
    }

    /// Boot (or re-boot) a single server: connect, handshake, discover tools.
    async fn boot_server(&self, name: &str) -> BootOutcome {
        let (transport, kind) = {
            let mut servers = self.servers.write().await;
            let Some(handle) = servers.get_mut(name) else {
                return BootOutcome {
                    server: name.to_string(),
                    transport: "unknown",
                    state: ServerState::Errored,
                    tool_count: 0,
                    error: Some("server not configured".into()),
                };
            };
            handle.state = ServerState::Booting;
            (handle.transport.clone(), handle.transport.kind())
        };

        // Handshake and discovery happen outside the table lock so one
        // server's slow boot never blocks another's.
        let booted = async {
            transport
                .connect()
                .await
                .map_err(|e| e.to_string())?;
            transport.list_tools().await.map_err(|e| e.to_string())
        }
        .await;

        let mut servers = self.servers.write().await;
        let handle = servers.get_mut(name).expect("handle exists");
        match booted {
            Ok(tools) => {
                info!(server = %name, transport = kind, tools = tools.len(), "Tool server booted");
                handle.state = ServerState::Running;
                handle.tools = tools;
                handle.last_error = None;
                BootOutcome {
                    server: name.to_string(),
                    transport: kind,
                    state: ServerState::Running,
                    tool_count: handle.tools.len(),
                    error: None,
                }
            }
            Err(reason) => {
                warn!(server = %name, transport = kind, error = %reason, "Tool server failed to boot");
                handle.state = ServerState::Stopped;
                handle.last_error = Some(reason.clone());
                BootOutcome {
                    server: name.to_string(),
                    transport: kind,
                    state: ServerState::Stopped,
                    tool_count: 0,
                    error: Some(reason),
                }
            }
        }
    }

    /// The merged, server-prefixed tool list across all `Running` servers.
    ///
    /// Reads only cached discovery results — never blocks on a server that
    /// is booting or errored.
    pub async fn tools_snapshot(&self) -> Vec<ToolDefinition> {
        let servers = self.servers.read().await;
        let mut defs = Vec::new();
        for (name, handle) in servers.iter() {
            if handle.state != ServerState::Running {
                continue;
            }
            for spec in &handle.tools {
                defs.push(ToolDefinition {
                    name: qualify(name, &spec.name),
                    description: spec.description.clone(),
                    parameters: spec.input_schema.clone(),
                });
            }
        }
        defs
    }

    /// Invoke a tool by its qualified (`server__tool`) name.
    pub async fn call(
        &self,
        qualified_name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, ToolError> {
        let (server, tool) = split_qualified(qualified_name)
            .ok_or_else(|| ToolError::NotFound(qualified_name.to_string()))?;

        let transport = {
            let servers = self.servers.read().await;
            let handle = servers
                .get(server)
                .ok_or_else(|| ToolError::NotFound(qualified_name.to_string()))?;
            if handle.state != ServerState::Running {
                return Err(ToolError::ServerUnavailable {
                    server: server.to_string(),
                    state: handle.state.to_string(),
                });
            }
            handle.transport.clone()
        };

        transport.call_tool(tool, arguments, timeout).await
    }

    /// One supervision pass: probe running servers, restart crashed ones.
    ///
    /// All restart bookkeeping lives in the per-server handle (`attempts`,
    /// ceiling, `last_error`) and is inspected only here. A server that
    /// exhausts the ceiling is marked `Errored` and never retried.
    pub async fn supervise_tick(&self) {
        let names: Vec<String> = self.servers.read().await.keys().cloned().collect();

        for name in names {
            let (state, attempts, transport) = {
                let servers = self.servers.read().await;
                let Some(handle) = servers.get(&name) else {
                    continue;
                };
                (handle.state, handle.restart_attempts, handle.transport.clone())
            };

            match state {
                ServerState::Errored | ServerState::Booting => continue,
                ServerState::Running => {
                    if transport.probe().await {
                        continue;
                    }
                    let mut servers = self.servers.write().await;
                    if let Some(handle) = servers.get_mut(&name) {
                        warn!(
                            server = %name,
                            transport = handle.config.transport.kind(),
                            "Tool server no longer alive"
                        );
                        handle.state = ServerState::Stopped;
                        handle.tools.clear();
                        handle.last_error = Some("server process exited unexpectedly".into());
                    }
                }
                ServerState::Stopped => {}
            }

            if attempts >= self.restart_ceiling {
                let mut servers = self.servers.write().await;
                if let Some(handle) = servers.get_mut(&name) {
                    if handle.state != ServerState::Errored {
                        warn!(
                            server = %name,
                            attempts,
                            "Restart ceiling exhausted, marking server errored"
                        );
                        handle.state = ServerState::Errored;
                    }
                }
                continue;
            }

            self.restart_server(&name).await;
        }
    }

    /// Attempt one restart with the original config.
    async fn restart_server(&self, name: &str) {
        let transport = {
            let mut servers = self.servers.write().await;
            let Some(handle) = servers.get_mut(name) else {
                return;
            };
            handle.restart_attempts += 1;
            handle.state = ServerState::Booting;
            debug!(
                server = %name,
                attempt = handle.restart_attempts,
                ceiling = self.restart_ceiling,
                "Restarting tool server"
            );
            handle.transport.clone()
        };

        transport.close().await;
        let result = async {
            transport.connect().await.map_err(|e| e.to_string())?;
            transport.list_tools().await.map_err(|e| e.to_string())
        }
        .await;

        let mut servers = self.servers.write().await;
        let Some(handle) = servers.get_mut(name) else {
            return;
        };
        match result {
            Ok(tools) => {
                // Reconnect invalidates the old cache; re-discovered tools
                // replace it wholesale.
                info!(server = %name, tools = tools.len(), "Tool server restarted");
                handle.state = ServerState::Running;
                handle.tools = tools;
                handle.last_error = None;
            }
            Err(reason) => {
                handle.last_error = Some(reason.clone());
                if handle.restart_attempts >= self.restart_ceiling {
                    warn!(server = %name, error = %reason, "Restart failed, ceiling exhausted");
                    handle.state = ServerState::Errored;
                } else {
                    warn!(server = %name, error = %reason, "Restart failed, will retry");
                    handle.state = ServerState::Stopped;
                }
            }
        }
    }

    /// Current state of every configured server.
    pub async fn states(&self) -> HashMap<String, ServerState> {
        self.servers
            .read()
            .await
            .iter()
            .map(|(name, handle)| (name.clone(), handle.state))
            .collect()
    }

    /// Last recorded error for a server, if any.
    pub async fn last_error(&self, name: &str) -> Option<String> {
        self.servers
            .read()
            .await
            .get(name)
            .and_then(|h| h.last_error.clone())
    }

    /// Shut every server down and mark it stopped.
    pub async fn shutdown(&self) {
        let mut servers = self.servers.write().await;
        for (name, handle) in servers.iter_mut() {
            handle.transport.close().await;
            handle.state = ServerState::Stopped;
            handle.tools.clear();
            debug!(server = %name, "Tool server shut down");
        }
    }

    /// The configured connect timeout (exposed for callers building their
    /// own transports against the same settings).
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

/// Prefix a tool name with its owning server.
pub fn qualify(server: &str, tool: &str) -> String {
    format!("{server}{QUALIFIER}{tool}")
}

/// Split a qualified name back into `(server, tool)`.
pub fn split_qualified(qualified: &str) -> Option<(&str, &str)> {
    qualified.split_once(QUALIFIER)
}
