//! Streamable-HTTP transport: every JSON-RPC call is an independent
//! request/response pair against a single URL.
//!
//! There is no persistent connection to monitor, so `probe()` is always
//! true once the handshake has succeeded.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use toolmesh_core::error::{ConnectError, ToolError};

use crate::protocol::*;
use crate::ToolTransport;

/// Transport for a streamable-HTTP tool server.
pub struct StreamableHttpTransport {
    server: String,
    url: String,
    client: reqwest::Client,
    connect_timeout: Duration,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl StreamableHttpTransport {
    pub fn new(server: impl Into<String>, url: impl Into<String>, connect_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            server: server.into(),
            url: url.into(),
            client,
            connect_timeout,
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        }
    }

    async fn post_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest::new(id, method, params);

        let exchange = async {
            let response = self
                .client
                .post(&self.url)
                .header("Accept", "application/json")
                .json(&request)
                .send()
                .await
                .map_err(|e| ToolError::Transport {
                    tool: method.to_string(),
                    reason: e.to_string(),
                })?;

            let status = response.status();
            if !status.is_success() {
                return Err(ToolError::Transport {
                    tool: method.to_string(),
                    reason: format!("server returned {status}"),
                });
            }

            let rpc: RpcResponse = response.json().await.map_err(|e| ToolError::Transport {
                tool: method.to_string(),
                reason: format!("invalid response body: {e}"),
            })?;
            rpc.into_result(method)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                tool: method.to_string(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

#[async_trait]
impl ToolTransport for StreamableHttpTransport {
    fn kind(&self) -> &'static str {
        "streamable_http"
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        let params = serde_json::to_value(InitializeParams::current()).map_err(|e| {
            ConnectError::InvalidConfig {
                server: self.server.clone(),
                reason: e.to_string(),
            }
        })?;
        self.post_request("initialize", Some(params), self.connect_timeout)
            .await
            .map_err(|e| ConnectError::HandshakeFailed {
                server: self.server.clone(),
                reason: e.to_string(),
            })?;
        self.connected.store(true, Ordering::Release);
        debug!(server = %self.server, url = %self.url, "streamable-http server initialized");
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<RemoteToolSpec>, ToolError> {
        let result = self
            .post_request("tools/list", None, self.connect_timeout)
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
            .post_request(
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
        self.connected.load(Ordering::Acquire)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Release);
    }
}
