//! MCP streamable HTTP transport.
//!
//! HTTP client for remote MCP servers:
//! - JSON-RPC requests as HTTP POST to the server's `/mcp` endpoint
//! - Responses as plain JSON or as an SSE event stream
//! - Session tracking via the `Mcp-Session-Id` header
//! - Bearer auth from the server descriptor

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use switchboard_types::errors::SwitchboardError;
use switchboard_types::messages::JsonRpcMessage;
use switchboard_types::traits::McpTransport;

/// Configuration for the HTTP transport, derived from an MCP descriptor.
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Base URL of the server; `/mcp` is appended if missing.
    pub base_url: String,
    /// Bearer token, if the server requires auth.
    pub auth_token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl HttpTransportConfig {
    pub fn new(base_url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            base_url: base_url.into(),
            auth_token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token;
        self
    }
}

/// A parsed SSE event from a `text/event-stream` body.
#[derive(Debug, Clone, Default)]
struct SseEvent {
    event: Option<String>,
    data: String,
}

/// Parse a raw SSE body into events. Events are separated by blank lines;
/// multiple `data:` lines within one event are joined with newlines.
fn parse_sse_events(body: &str) -> Vec<SseEvent> {
    let mut events = Vec::new();
    for raw in body.split("\n\n") {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        let mut event = SseEvent::default();
        let mut has_data = false;
        for line in raw.lines() {
            if line.starts_with(':') {
                continue; // comment
            }
            let (field, value) = match line.find(':') {
                Some(pos) => (&line[..pos], line[pos + 1..].strip_prefix(' ').unwrap_or(&line[pos + 1..])),
                None => (line, ""),
            };
            match field {
                "event" => event.event = Some(value.to_string()),
                "data" => {
                    if has_data {
                        event.data.push('\n');
                    }
                    event.data.push_str(value);
                    has_data = true;
                }
                _ => {}
            }
        }
        if has_data {
            events.push(event);
        }
    }
    events
}

struct HttpState {
    session_id: Option<String>,
    connected: bool,
    recv_buffer: Vec<JsonRpcMessage>,
}

/// HTTP/SSE transport for remote MCP servers.
///
/// `send()` POSTs the message and buffers whatever the server answers —
/// a single JSON body or a batch of SSE events — for `recv()` to drain.
pub struct McpHttpTransport {
    config: HttpTransportConfig,
    client: reqwest::Client,
    state: Arc<Mutex<HttpState>>,
}

impl McpHttpTransport {
    pub fn new(config: HttpTransportConfig) -> Result<Self, SwitchboardError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| {
                SwitchboardError::McpTransport(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self {
            config,
            client,
            state: Arc::new(Mutex::new(HttpState {
                session_id: None,
                connected: true,
                recv_buffer: Vec::new(),
            })),
        })
    }

    fn endpoint_url(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        if base.ends_with("/mcp") {
            base.to_string()
        } else {
            format!("{base}/mcp")
        }
    }

    async fn build_headers(&self) -> reqwest::header::HeaderMap {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("text/event-stream, application/json"),
        );

        if let Some(token) = &self.config.auth_token {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}")) {
                headers.insert(reqwest::header::AUTHORIZATION, value);
            }
        }

        let state = self.state.lock().await;
        if let Some(session_id) = &state.session_id {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(session_id) {
                headers.insert(
                    reqwest::header::HeaderName::from_static("mcp-session-id"),
                    value,
                );
            }
        }

        headers
    }

    async fn capture_session_id(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(value) = headers
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            let mut state = self.state.lock().await;
            state.session_id = Some(value.to_string());
            tracing::debug!(session_id = value, "captured MCP session id");
        }
    }

    /// Extract JSON-RPC messages from an SSE body into the receive buffer.
    async fn buffer_sse_body(&self, body: &str) {
        let events = parse_sse_events(body);
        let mut state = self.state.lock().await;
        for event in events {
            // Default SSE event type is "message".
            let is_message = event.event.as_deref().map(|e| e == "message").unwrap_or(true);
            if !is_message || event.data.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonRpcMessage>(&event.data) {
                Ok(msg) => state.recv_buffer.push(msg),
                Err(e) => {
                    tracing::warn!(error = %e, "unparseable SSE event data, skipping");
                }
            }
        }
    }
}

#[async_trait]
impl McpTransport for McpHttpTransport {
    async fn send(&mut self, message: JsonRpcMessage) -> Result<(), SwitchboardError> {
        {
            let state = self.state.lock().await;
            if !state.connected {
                return Err(SwitchboardError::McpTransport(
                    "transport is closed".to_string(),
                ));
            }
        }

        let url = self.endpoint_url();
        let headers = self.build_headers().await;

        tracing::debug!(url = %url, method = ?message.method, id = ?message.id, "POST JSON-RPC");

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(&message)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    SwitchboardError::McpTransport(format!("request timed out: {e}"))
                } else if e.is_connect() {
                    SwitchboardError::McpTransport(format!("connect failed: {e}"))
                } else {
                    SwitchboardError::McpTransport(format!("request failed: {e}"))
                }
            })?;

        self.capture_session_id(response.headers()).await;

        let status = response.status();
        if !status.is_success() {
            return Err(SwitchboardError::McpTransport(format!(
                "server returned HTTP {status}"
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = response.text().await.map_err(|e| {
            SwitchboardError::McpTransport(format!("failed to read response body: {e}"))
        })?;

        // Notification acknowledgements come back empty.
        if body.is_empty() {
            return Ok(());
        }

        if content_type.contains("text/event-stream") {
            self.buffer_sse_body(&body).await;
        } else {
            match serde_json::from_str::<JsonRpcMessage>(&body) {
                Ok(msg) => self.state.lock().await.recv_buffer.push(msg),
                Err(e) => {
                    return Err(SwitchboardError::McpTransport(format!(
                        "unparseable JSON-RPC response: {e}"
                    )));
                }
            }
        }

        Ok(())
    }

    async fn recv(&mut self) -> Result<JsonRpcMessage, SwitchboardError> {
        let mut state = self.state.lock().await;
        if !state.recv_buffer.is_empty() {
            return Ok(state.recv_buffer.remove(0));
        }
        Err(SwitchboardError::McpTransport(
            "no buffered messages; send() a request first".to_string(),
        ))
    }

    async fn close(&mut self) -> Result<(), SwitchboardError> {
        let mut state = self.state.lock().await;
        state.connected = false;
        state.recv_buffer.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        match self.state.try_lock() {
            Ok(state) => state.connected,
            // Lock held means the transport is mid-operation, hence alive.
            Err(_) => true,
        }
    }
}
