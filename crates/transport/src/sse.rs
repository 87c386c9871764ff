//! Event-stream transport: a long-lived HTTP GET with a server-push body.
//!
//! The server announces a companion message endpoint as the stream's first
//! event; JSON-RPC requests are POSTed there and their responses arrive back
//! on the stream. The connect timeout governs only this endpoint-discovery
//! handshake — an open stream that stays silent afterwards is normal, so no
//! read timeout is applied to the stream itself. Per-call timeouts are
//! applied to each pending request instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use toolmesh_core::error::{ConnectError, ToolError};

use crate::protocol::*;
use crate::ToolTransport;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<RpcResponse>>>>;

struct Session {
    endpoint: String,
    pending: PendingMap,
    reader: JoinHandle<()>,
}

/// Transport for an SSE-backed tool server.
pub struct SseTransport {
    server: String,
    url: String,
    client: reqwest::Client,
    connect_timeout: Duration,
    next_id: AtomicU64,
    session: Mutex<Option<Session>>,
}

impl SseTransport {
    pub fn new(server: impl Into<String>, url: impl Into<String>, connect_timeout: Duration) -> Self {
        // No global request timeout: the GET stream is expected to stay open
        // indefinitely. Only the TCP connect phase is bounded here.
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
            session: Mutex::new(None),
        }
    }

    async fn send_request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, ToolError> {
        let (endpoint, pending) = {
            let guard = self.session.lock().await;
            let session = guard.as_ref().ok_or_else(|| ToolError::ServerUnavailable {
                server: self.server.clone(),
                state: "disconnected".into(),
            })?;
            (session.endpoint.clone(), session.pending.clone())
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(id, tx);

        let request = RpcRequest::new(id, method, params);
        let posted = self
            .client
            .post(&endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| ToolError::Transport {
                tool: method.to_string(),
                reason: e.to_string(),
            });
        if let Err(e) = posted {
            pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(resp)) => resp.into_result(method),
            Ok(Err(_)) => {
                // Reader task dropped our sender: stream is gone.
                Err(ToolError::Transport {
                    tool: method.to_string(),
                    reason: "event stream closed while awaiting response".into(),
                })
            }
            Err(_) => {
                pending.lock().await.remove(&id);
                Err(ToolError::Timeout {
                    tool: method.to_string(),
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }

    async fn post_notification(&self, method: &str) -> Result<(), ToolError> {
        let endpoint = {
            let guard = self.session.lock().await;
            guard
                .as_ref()
                .map(|s| s.endpoint.clone())
                .ok_or_else(|| ToolError::ServerUnavailable {
                    server: self.server.clone(),
                    state: "disconnected".into(),
                })?
        };
        self.client
            .post(&endpoint)
            .json(&RpcNotification::new(method))
            .send()
            .await
            .map(|_| ())
            .map_err(|e| ToolError::Transport {
                tool: method.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Resolve a possibly-relative endpoint path against the stream URL's origin.
fn resolve_endpoint(base: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    let origin_end = base
        .find("://")
        .map(|i| i + 3)
        .and_then(|start| base[start..].find('/').map(|i| start + i))
        .unwrap_or(base.len());
    format!("{}{}", &base[..origin_end], endpoint)
}

/// Drive the SSE byte stream: parse events, hand the endpoint announcement
/// to the connect handshake, route JSON-RPC responses to pending callers.
async fn run_reader(
    server: String,
    response: reqwest::Response,
    pending: PendingMap,
    endpoint_tx: oneshot::Sender<String>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut stream = response.bytes_stream();
    let mut buffer = String::new();
    let mut event_name = String::new();
    let mut event_data = String::new();

    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                warn!(server = %server, error = %e, "event stream read failed");
                break;
            }
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk));

        while let Some(newline) = buffer.find('\n') {
            let line = buffer[..newline].trim_end_matches('\r').to_string();
            buffer.drain(..=newline);

            if let Some(name) = line.strip_prefix("event:") {
                event_name = name.trim().to_string();
            } else if let Some(data) = line.strip_prefix("data:") {
                if !event_data.is_empty() {
                    event_data.push('\n');
                }
                event_data.push_str(data.trim());
            } else if line.is_empty() && !event_data.is_empty() {
                dispatch_event(&server, &event_name, &event_data, &pending, &mut endpoint_tx)
                    .await;
                event_name.clear();
                event_data.clear();
            }
        }
    }

    // Stream ended: fail every caller still waiting.
    pending.lock().await.clear();
    debug!(server = %server, "event stream reader finished");
}

async fn dispatch_event(
    server: &str,
    name: &str,
    data: &str,
    pending: &PendingMap,
    endpoint_tx: &mut Option<oneshot::Sender<String>>,
) {
    if name == "endpoint" {
        if let Some(tx) = endpoint_tx.take() {
            let _ = tx.send(data.to_string());
        }
        return;
    }
    match serde_json::from_str::<RpcResponse>(data) {
        Ok(resp) => {
            if let Some(id) = resp.id {
                if let Some(tx) = pending.lock().await.remove(&id) {
                    let _ = tx.send(resp);
                } else {
                    debug!(server = %server, id, "response for unknown request id");
                }
            }
        }
        Err(_) => {
            debug!(server = %server, data, "ignoring non-response event");
        }
    }
}

#[async_trait]
impl ToolTransport for SseTransport {
    fn kind(&self) -> &'static str {
        "sse"
    }

    async fn connect(&self) -> Result<(), ConnectError> {
        if self.session.lock().await.is_some() {
            return Ok(());
        }

        let response = self
            .client
            .get(&self.url)
            .header("Accept", "text/event-stream")
            .send()
            .await
            .map_err(|e| ConnectError::HandshakeFailed {
                server: self.server.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ConnectError::HandshakeFailed {
                server: self.server.clone(),
                reason: format!("stream request returned {}", response.status()),
            });
        }

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(run_reader(
            self.server.clone(),
            response,
            pending.clone(),
            endpoint_tx,
        ));

        // Endpoint discovery is the handshake; only this phase gets the
        // connect timeout.
        let endpoint = match tokio::time::timeout(self.connect_timeout, endpoint_rx).await {
            Ok(Ok(path)) => resolve_endpoint(&self.url, &path),
            Ok(Err(_)) => {
                reader.abort();
                return Err(ConnectError::HandshakeFailed {
                    server: self.server.clone(),
                    reason: "stream closed before endpoint announcement".into(),
                });
            }
            Err(_) => {
                reader.abort();
                return Err(ConnectError::Timeout {
                    server: self.server.clone(),
                    timeout_secs: self.connect_timeout.as_secs(),
                });
            }
        };

        *self.session.lock().await = Some(Session {
            endpoint,
            pending,
            reader,
        });

        let init = async {
            let params = serde_json::to_value(InitializeParams::current())
                .map_err(|e| ToolError::InvalidArguments(e.to_string()))?;
            self.send_request("initialize", Some(params), self.connect_timeout)
                .await?;
            self.post_notification("notifications/initialized").await
        };
        if let Err(e) = init.await {
            self.close().await;
            return Err(ConnectError::HandshakeFailed {
                server: self.server.clone(),
                reason: e.to_string(),
            });
        }

        debug!(server = %self.server, url = %self.url, "sse server initialized");
        Ok(())
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
        let guard = self.session.lock().await;
        match guard.as_ref() {
            Some(session) => !session.reader.is_finished(),
            None => false,
        }
    }

    async fn close(&self) {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.take() {
            session.reader.abort();
            session.pending.lock().await.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_relative_endpoint() {
        assert_eq!(
            resolve_endpoint("https://tools.example.com/sse", "/messages?session=1"),
            "https://tools.example.com/messages?session=1"
        );
    }

    #[test]
    fn resolve_absolute_endpoint_untouched() {
        assert_eq!(
            resolve_endpoint("https://a.example.com/sse", "https://b.example.com/msg"),
            "https://b.example.com/msg"
        );
    }

    #[test]
    fn resolve_endpoint_with_port() {
        assert_eq!(
            resolve_endpoint("http://localhost:8931/sse", "/messages"),
            "http://localhost:8931/messages"
        );
    }

    #[tokio::test]
    async fn call_without_connect_is_unavailable() {
        let t = SseTransport::new("t", "https://example.invalid/sse", Duration::from_secs(1));
        let err = t
            .call_tool("x", serde_json::json!({}), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ServerUnavailable { .. }));
    }

    #[tokio::test]
    async fn connect_to_unreachable_host_is_connect_error() {
        let t = SseTransport::new(
            "t",
            "http://127.0.0.1:1/sse", // nothing listens on port 1
            Duration::from_millis(500),
        );
        let err = t.connect().await.unwrap_err();
        assert!(matches!(
            err,
            ConnectError::HandshakeFailed { .. } | ConnectError::Timeout { .. }
        ));
    }
}
