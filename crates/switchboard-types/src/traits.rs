/// Trait contracts for the Switchboard subsystems.
///
/// The bridge loop codes against these interfaces, not against concrete
/// implementations; every trait here has a mock in the bridge's tests and a
/// production implementation in one of the sibling crates.
use async_trait::async_trait;

use crate::errors::SwitchboardError;
use crate::messages::*;

// ============================================================
// LM provider
// ============================================================

/// One upstream language model provider.
///
/// The bridge builds the system context once per request and reuses it on
/// every iteration so the provider can serve the serialized prefix from its
/// prompt cache.
#[async_trait]
pub trait LmProvider: Send + Sync {
    /// Render the user profile and tool surface into a cacheable system
    /// context. The result is stable for the lifetime of a request.
    fn build_system_context(&self, view: &AllowedToolsView, profile: &UserProfile)
        -> SystemContext;

    /// Submit the conversation. Tool declarations come from the same view
    /// the system context was built from; an empty view means no tools are
    /// offered. An empty `tool_requests` in the reply is a final answer.
    async fn invoke(
        &self,
        system: &SystemContext,
        messages: &[LmMessage],
        tools: &AllowedToolsView,
    ) -> Result<LmReply, SwitchboardError>;

    /// USD estimate for the given usage, at this provider's prices.
    fn cost(&self, usage: &TokenUsage) -> f64;
}

// ============================================================
// MCP invocation
// ============================================================

/// The registry surface the bridge sees: catalog snapshots and invocation.
///
/// `call_tool` never returns `Err` for tool-level failures; those come back
/// as failed [`ToolOutcome`]s so the LM can adapt. Transport failures are
/// also folded into error-shaped outcomes after the registry has updated
/// health state and exhausted its retries.
#[async_trait]
pub trait McpInvoker: Send + Sync {
    /// Current per-MCP catalogs in configuration order. Cache-first:
    /// fresh entries are served as-is, expired ones re-fetched, and a
    /// server that is down falls back to its stale catalog.
    async fn catalog_snapshot(&self) -> Vec<McpCatalog>;

    /// Invoke one tool. Preconditions (enabled MCP, permission grant) are
    /// the caller's responsibility.
    async fn call_tool(
        &self,
        mcp_name: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> ToolOutcome;
}

/// MCP transport abstraction — unifies the HTTP/SSE and stdio transports.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Send a JSON-RPC message to the server.
    async fn send(&mut self, message: JsonRpcMessage) -> Result<(), SwitchboardError>;

    /// Receive the next buffered JSON-RPC message.
    async fn recv(&mut self) -> Result<JsonRpcMessage, SwitchboardError>;

    /// Close the connection.
    async fn close(&mut self) -> Result<(), SwitchboardError>;

    fn is_connected(&self) -> bool;
}

// ============================================================
// Audit persistence
// ============================================================

/// Where the bridge hands completed records.
///
/// Implementations must return quickly — the recorder in front of the
/// durable store enqueues and lets a worker do the writing.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// The external persistence collaborator for audit records.
#[async_trait]
pub trait AuditStore: Send + Sync {
    /// Durably insert one record. Records are immutable once written.
    async fn insert(&self, record: &AuditRecord) -> Result<(), SwitchboardError>;

    /// Most recent records, newest first. Read-only; used by dashboards.
    async fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>, SwitchboardError>;
}
