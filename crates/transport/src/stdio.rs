//! Subprocess transport: a child process speaking newline-delimited JSON-RPC
//! over its standard input/output.
//!
//! The child's environment is scrubbed down to a handful of system variables
//! plus whatever the server config declares, so host secrets never leak into
//! tool processes. Unexpected EOF on the child's stdout is a connection
//! fault; the hypervisor notices the dead process on its next probe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use toolmesh_core::error::{ConnectError, ToolError};

use crate::protocol::*;
use crate::ToolTransport;

/// Environment variables forwarded into every tool subprocess.
const PASSTHROUGH_ENV: &[&str] = &["PATH", "HOME", "USER", "LANG", "TERM"];

struct Pipes {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Transport for a subprocess-backed tool server.
pub struct StdioTransport {
    server: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    connect_timeout: Duration,
    next_id: AtomicU64,
    pipes: Mutex<Option<Pipes>>,
}

impl StdioTransport {
    pub fn new(
        server: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        env: HashMap<String, String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            server: server.into(),
            command: command.into(),
            args,
            env,
            connect_timeout,
            next_id: AtomicU64::new(1),
            pipes: Mutex::new(None),
        }
    }

    fn spawn_child(&self) -> Result<Pipes, ConnectError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null());

        // Scrubbed environment: essentials plus configured vars only.
        cmd.env_clear();
        for key in PASSTHROUGH_ENV {
            if let Ok(val) = std::env::var(key) {
                cmd.env(key, val);
            }
        }
        for (k, v) in &self.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| ConnectError::SpawnFailed {
            command: self.command.clone(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| ConnectError::SpawnFailed {
            command: self.command.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectError::SpawnFailed {
                command: self.command.clone(),
                reason: "failed to capture stdout".into(),
            })?;

        Ok(Pipes {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        })
    }

    /// Send one request and wait for the matching response.
    ///
    /// The pipes lock is held for the full exchange: tool servers are
    /// single-call-at-a-time by contract, so there is nothing to interleave.
    async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(id, method, params);
        let mut line = serde_json::to_string(&request).map_err(|e| ToolError::Transport {
            tool: method.to_string(),
            reason: e.to_string(),
        })?;
        line.push('\n');

        let mut guard = self.pipes.lock().await;
        let pipes = guard.as_mut().ok_or_else(|| ToolError::ServerUnavailable {
            server: self.server.clone(),
            state: "disconnected".into(),
        })?;

        let exchange = async {
            pipes
                .stdin
                .write_all(line.as_bytes())
                .await
                .map_err(|e| io_fault(method, e))?;
            pipes.stdin.flush().await.map_err(|e| io_fault(method, e))?;

            let mut buf = String::new();
            loop {
                buf.clear();
                let n = pipes
                    .stdout
                    .read_line(&mut buf)
                    .await
                    .map_err(|e| io_fault(method, e))?;
                if n == 0 {
                    return Err(ToolError::Transport {
                        tool: method.to_string(),
                        reason: "server closed stdout".into(),
                    });
                }
                let trimmed = buf.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<RpcResponse>(trimmed) {
                    Ok(resp) if resp.id == Some(id) => return resp.into_result(method),
                    Ok(resp) => {
                        debug!(server = %self.server, id = ?resp.id, "skipping non-matching message");
                    }
                    Err(_) => {
                        // Server-side notification or stray log line.
                        debug!(server = %self.server, line = trimmed, "ignoring non-response line");
                    }
                }
            }
        };

        // A timed-out call releases the lock and leaves the process alone;
        // whether the server is still healthy is the next probe's problem.
        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                tool: method.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }

    async fn send_notification(&self, method: &str) -> Result<(), ToolError> {
        let notif = RpcNotification::new(method);
        let mut line = serde_json::to_string(&notif).map_err(|e| ToolError::Transport {
            tool: method.to_string(),
            reason: e.to_string(),
        })?;
        line.push('\n');

        let mut guard = self.pipes.lock().await;
        let pipes = guard.as_mut().ok_or_else(|| ToolError::ServerUnavailable {
            server: self.server.clone(),
            state: "disconnected".into(),
        })?;
        pipes
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| io_fault(method, e))?;
        pipes.stdin.flush().await.map_err(|e| io_fault(method, e))
    }
}

fn io_fault(method: &str, e: std::io::Error) -> ToolError {
    ToolError::Transport {
        tool: method.to_string(),
        reason: e.to_string(),
    }
}

#[async_trait]
impl ToolTransport for StdioTransport {
    fn kind(&self) -> &'static str {
        "stdio"
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        {
            let mut guard = self.pipes.lock().await;
            if guard.is_some() {
                return Ok(());
            }
            *guard = Some(self.spawn_child()?);
        }

        let handshake = async {
            let params = serde_json::to_value(InitializeParams::current())
                .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
            self.send_request("initialize", Some(params), self.connect_timeout)
                .await?;
            self.send_notification("notifications/initialized").await
        };

        match tokio::time::timeout(self.connect_timeout, handshake).await {
            Ok(Ok(())) => {
                debug!(server = %self.server, command = %self.command, "stdio server initialized");
                Ok(())
            }
            Ok(Err(e)) => {
                self.close().await;
                Err(ConnectError::HandshakeFailed {
                    server: self.server.clone(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                self.close().await;
                Err(ConnectError::Timeout {
                    server: self.server.clone(),
                    timeout_secs: self.connect_timeout.as_secs(),
                })
            }
        }
    }

    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, ToolError> {
        let result = self
            .send_request("tools/list", None, self.connect_timeout)
            .await?;
        let tools = result
            .get("tools")
            .cloned()
            .unwrap_or(serde_json::Value::Array(vec![]));
        serde_json::from_value(tools).map_err(|e| ToolError::Transport {
            tool: "tools/list".into(),
            reason: format!("failed to parse tool list: {e}"),
        })
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, ToolError> {
        let params = CallParams {
            name: name.to_string(),
            arguments,
        };
        let raw = self
            .send_request(
                "tools/call",
                Some(serde_json::to_value(&params).map_err(|e| ToolError::Transport {
                    tool: name.to_string(),
                    reason: e.to_string(),
                })?),
                timeout,
            )
            .await?;
        interpret_call_result(name, raw)
    }

    async fn probe(&self) -> bool {
        let mut guard = self.pipes.lock().await;
        match guard.as_mut() {
            Some(pipes) => match pipes.child.try_wait() {
                Ok(None) => true,
                Ok(Some(status)) => {
                    warn!(server = %self.server, %status, "tool server process exited");
                    false
                }
                Err(e) => {
                    warn!(server = %self.server, error = %e, "failed to poll tool server process");
                    false
                }
            },
            None => false,
        }
    }

    async fn close(&self) {
        let mut guard = self.pipes.lock().await;
        if let Some(mut pipes) = guard.take() {
            let _ = pipes.child.kill().await;
            let _ = pipes.child.wait().await;
        }
    }
}
