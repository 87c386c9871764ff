//! Tool transport adapters.
//!
//! A `ToolTransport` speaks one wire protocol to a single external tool
//! server and exposes the uniform `connect` / `list_tools` / `call_tool`
//! surface the hypervisor builds on. Three protocols are supported:
//!
//! - **stdio** — child process, newline-delimited JSON-RPC over stdin/stdout
//! - **sse** — long-lived server-push stream with a companion POST endpoint
//! - **streamable HTTP** — one independent request/response per call
//!
//! Failure semantics are shared across all three: handshake problems are
//! `ConnectError`s, mid-call faults are `ToolError::Transport`, and a result
//! the tool itself flags as an error is `ToolError::Business`. Timeouts
//! cancel the in-flight call without retrying — retry policy belongs to the
//! caller.

pub mod http;
pub mod protocol;
pub mod sse;
pub mod stdio;

use std::time::Duration;

use async_trait::async_trait;

use toolmesh_config::{ToolServerConfig, TransportConfig};
use toolmesh_core::error::{ConnectError, ToolError};

pub use http::StreamableHttpTransport;
pub use protocol::RemoteToolSpec;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// One wire connection to one external tool server.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    /// Short transport label for logs and error reports.
    fn kind(&self) -> &'static str;

    /// Establish the connection and perform the protocol handshake.
    async fn connect(&self) -> Result<(), ConnectError>;

    /// Discover the tools this server exposes.
    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, ToolError>;

    /// Invoke a tool under the given timeout.
    ///
    /// A timed-out call releases its resources but is never retried here;
    /// for subprocess servers it also never kills the process — liveness is
    /// the supervisor's concern.
    async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, ToolError>;

    /// Cheap liveness probe, used by the supervisor tick.
    async fn probe(&self) -> bool;

    /// Tear the connection down.
    async fn close(&self);
}

/// Build the right transport for a server declaration.
pub fn transport_for(
    config: &ToolServerConfig,
    connect_timeout: Duration,
) -> Box<dyn ToolTransport> {
    match &config.transport {
        TransportConfig::Stdio { command, args, env } => Box::new(StdioTransport::new(
            &config.name,
            command,
            args.clone(),
            env.clone(),
            connect_timeout,
        )),
        TransportConfig::Sse { url } => {
            Box::new(SseTransport::new(&config.name, url, connect_timeout))
        }
        TransportConfig::StreamableHttp { url } => Box::new(StreamableHttpTransport::new(
            &config.name,
            url,
            connect_timeout,
        )),
    }
}
