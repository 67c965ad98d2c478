//! Per-server MCP client.
//!
//! Wraps one transport with the MCP session protocol:
//! - `initialize` handshake + `notifications/initialized`
//! - request id allocation and response correlation
//! - `tools/list` and `tools/call` with result parsing
//!
//! Tool-level failures (JSON-RPC errors, `isError` results) are returned as
//! values; only transport problems surface as `Err`, so the registry can
//! tell the two apart for health tracking and retries.

use std::time::{Duration, Instant};

use switchboard_types::config::{McpDescriptor, McpEndpoint};
use switchboard_types::errors::SwitchboardError;
use switchboard_types::messages::{JsonRpcMessage, McpToolDef, ToolOutcome};
use switchboard_types::traits::McpTransport;

use crate::transport_http::{HttpTransportConfig, McpHttpTransport};
use crate::transport_stdio::McpStdioTransport;

/// Client name reported in the MCP `initialize` handshake.
const CLIENT_NAME: &str = "switchboard";
const PROTOCOL_VERSION: &str = "2025-03-26";

/// Upper bound on responses scanned while correlating one request id.
const MAX_CORRELATION_SCAN: usize = 32;

/// An initialized connection to one MCP server.
pub struct McpConnection {
    server_name: String,
    transport: Box<dyn McpTransport>,
    established_at: Instant,
    next_id: u64,
}

impl McpConnection {
    /// Build a transport for the descriptor, connect, and run the
    /// `initialize` handshake.
    pub async fn establish(descriptor: &McpDescriptor) -> Result<Self, SwitchboardError> {
        let transport: Box<dyn McpTransport> = match &descriptor.endpoint {
            McpEndpoint::Http { url } => {
                let config = HttpTransportConfig::new(url.clone(), descriptor.timeout_secs)
                    .with_auth_token(descriptor.auth_token.clone());
                Box::new(McpHttpTransport::new(config)?)
            }
            McpEndpoint::Stdio { command, args } => {
                Box::new(McpStdioTransport::spawn(command, args)?)
            }
        };

        let mut conn = Self {
            server_name: descriptor.name.clone(),
            transport,
            established_at: Instant::now(),
            next_id: 0,
        };
        conn.initialize().await?;
        Ok(conn)
    }

    /// Age of this connection; stale connections are re-established lazily.
    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    pub async fn close(&mut self) {
        let _ = self.transport.close().await;
    }

    async fn initialize(&mut self) -> Result<(), SwitchboardError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": { "name": CLIENT_NAME, "version": env!("CARGO_PKG_VERSION") },
        });
        let reply = self.request("initialize", params).await?;
        if let Some(err) = reply.error {
            return Err(SwitchboardError::Mcp(format!(
                "initialize rejected by '{}': {}",
                self.server_name, err.message
            )));
        }

        self.transport
            .send(JsonRpcMessage::notification(
                "notifications/initialized",
                serde_json::json!({}),
            ))
            .await?;

        tracing::debug!(server = %self.server_name, "MCP session initialized");
        Ok(())
    }

    /// Send one request and return its correlated response.
    async fn request(
        &mut self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<JsonRpcMessage, SwitchboardError> {
        self.next_id += 1;
        let id = self.next_id;
        self.transport
            .send(JsonRpcMessage::request(id, method, params))
            .await?;

        // Responses may be interleaved with server notifications.
        for _ in 0..MAX_CORRELATION_SCAN {
            let msg = self.transport.recv().await?;
            if msg.id == Some(serde_json::json!(id)) {
                return Ok(msg);
            }
            tracing::debug!(
                server = %self.server_name,
                id = ?msg.id,
                method = ?msg.method,
                "skipping uncorrelated message"
            );
        }
        Err(SwitchboardError::McpTransport(format!(
            "no response for request {id} from '{}'",
            self.server_name
        )))
    }

    /// Fetch the server's tool catalog.
    pub async fn list_tools(&mut self) -> Result<Vec<McpToolDef>, SwitchboardError> {
        let reply = self.request("tools/list", serde_json::json!({})).await?;
        if let Some(err) = reply.error {
            return Err(SwitchboardError::Mcp(format!(
                "tools/list failed on '{}': {}",
                self.server_name, err.message
            )));
        }
        let result = reply.result.unwrap_or_default();
        let tools = result.get("tools").cloned().unwrap_or_default();
        serde_json::from_value(tools).map_err(|e| {
            SwitchboardError::Mcp(format!(
                "malformed tools/list result from '{}': {e}",
                self.server_name
            ))
        })
    }

    /// Invoke one tool.
    ///
    /// `Ok(outcome)` covers both success and tool-level failure; `Err` is a
    /// transport problem only.
    pub async fn call_tool(
        &mut self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome, SwitchboardError> {
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let reply = self.request("tools/call", params).await?;

        if let Some(err) = reply.error {
            // The server answered; the call itself was bad. Tool-level.
            return Ok(ToolOutcome::failed(format!(
                "{} ({})",
                err.message, err.code
            )));
        }

        Ok(parse_call_result(reply.result.unwrap_or_default()))
    }
}

/// Parse an MCP `tools/call` result into a [`ToolOutcome`].
///
/// The wire shape is `{content: [{type: "text", text: ...}, ...], isError?}`;
/// text blocks are joined in order. Non-text blocks are passed through as
/// raw JSON so nothing the server said is lost.
fn parse_call_result(result: serde_json::Value) -> ToolOutcome {
    let is_error = result
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let text = match result.get("content").and_then(|c| c.as_array()) {
        Some(blocks) => blocks
            .iter()
            .map(|block| match block.get("text").and_then(|t| t.as_str()) {
                Some(text) => text.to_string(),
                None => block.to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        // No content array: treat the whole result as the payload.
        None => result.to_string(),
    };

    if is_error {
        ToolOutcome::failed(text)
    } else {
        ToolOutcome::ok(serde_json::Value::String(text))
    }
}
