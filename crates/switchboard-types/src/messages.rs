/// Shared data types used across all Switchboard subsystems.
///
/// Every crate in the workspace imports from here; the bridge, the MCP
/// registry, the LM adapter, and the audit recorder all agree on these
/// structures.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Separator between the MCP name and the tool name in LM-facing identifiers.
///
/// The dotted form (`mcp.tool`) is reserved for user-facing prose and audit
/// records; LM tool declarations use the double-underscore form because
/// provider tool-name grammars reject dots.
pub const QUALIFIED_TOOL_SEPARATOR: &str = "__";

/// Tags attached to non-success request terminations.
///
/// Stored in the audit record's `warning` column and surfaced in the
/// response so front-ends can branch on them without string matching.
pub mod tags {
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const TIMEOUT: &str = "timeout";
    pub const LM_ERROR: &str = "lm_error";
    pub const MAX_ITERATIONS_REACHED: &str = "max_iterations_reached";
}

// ============================================================
// Inbound / Outbound
// ============================================================

/// A request entering the bridge from a chat or HTTP front-end.
///
/// Identity is pre-established by the front-end; the bridge treats
/// `user_id` as authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Stable user identifier (e-mail-like string).
    pub user_id: String,
    /// The natural-language message.
    pub message: String,
    /// Conversation identifier for thread context, if the front-end has one.
    #[serde(default)]
    pub conversation_id: Option<String>,
    /// Origin metadata forwarded by the front-end.
    #[serde(default)]
    pub source: Option<SourceContext>,
}

/// Origin metadata for a request (e.g. Slack channel and message ids).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceContext {
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
    /// Front-end identifier, e.g. `slack-bot`, `web-ui`, `api-client`.
    #[serde(default)]
    pub source_tag: Option<String>,
}

/// The bridge's answer to one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub success: bool,
    pub answer: String,
    /// Number of tool invocations executed across all iterations.
    pub tool_calls: u32,
    /// Display names (`mcp.tool`) of the tools that actually ran.
    pub tools_used: Vec<String>,
    /// Completed LM round-trips.
    pub iterations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// USD estimate for the request.
    pub cost_estimate: f64,
    pub usage: TokenUsage,
}

/// Terminal status of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Success,
    Error,
    Warning,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
            RequestStatus::Warning => "warning",
        }
    }
}

// ============================================================
// Tools
// ============================================================

/// A tool discovered from an MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Tool name, unique within its MCP.
    pub name: String,
    /// Human-readable description shown to the LM.
    pub description: String,
    /// JSON Schema for the tool's input.
    pub input_schema: serde_json::Value,
    /// Name of the MCP server hosting this tool.
    pub mcp: String,
}

impl ToolDescriptor {
    /// LM-facing identifier: `<mcp>__<tool>`.
    pub fn qualified_name(&self) -> String {
        format!("{}{}{}", self.mcp, QUALIFIED_TOOL_SEPARATOR, self.name)
    }

    /// User-facing identifier: `<mcp>.<tool>`.
    pub fn display_name(&self) -> String {
        format!("{}.{}", self.mcp, self.name)
    }
}

/// Split a qualified tool name into `(mcp, tool)`.
///
/// Unqualified names have no identity here and are rejected; the same tool
/// name may exist on several MCPs.
pub fn split_qualified_name(qualified: &str) -> Option<(&str, &str)> {
    let (mcp, tool) = qualified.split_once(QUALIFIED_TOOL_SEPARATOR)?;
    if mcp.is_empty() || tool.is_empty() {
        return None;
    }
    Some((mcp, tool))
}

/// The deterministic, ordered set of tools one user may invoke for one
/// request. Computed once at request entry and never updated mid-flight.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AllowedToolsView {
    tools: Vec<ToolDescriptor>,
}

impl AllowedToolsView {
    /// Build a view from an ordered, de-duplicated tool list.
    pub fn new(tools: Vec<ToolDescriptor>) -> Self {
        Self { tools }
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Look up a tool by its LM-facing qualified name.
    pub fn get(&self, qualified: &str) -> Option<&ToolDescriptor> {
        self.tools.iter().find(|t| t.qualified_name() == qualified)
    }

    pub fn contains(&self, qualified: &str) -> bool {
        self.get(qualified).is_some()
    }
}

/// Result of one tool invocation, as fed back to the LM.
///
/// Tool-level failures are values, not errors: the LM is expected to read
/// the failure and adapt its plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn ok(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }
}

// ============================================================
// Permissions
// ============================================================

/// Outcome of evaluating one (user, tool) pair against the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionDecision {
    pub allowed: bool,
    pub reason: PermissionReason,
}

impl PermissionDecision {
    pub fn allow(reason: PermissionReason) -> Self {
        Self {
            allowed: true,
            reason,
        }
    }

    pub fn deny(reason: PermissionReason) -> Self {
        Self {
            allowed: false,
            reason,
        }
    }
}

/// Why a permission decision came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionReason {
    /// Allowed or denied by the role's default MCP access.
    RoleDefault,
    /// Allowed or denied by a per-user override block.
    UserOverride,
    /// The hosting MCP is disabled.
    McpDisabled,
    /// The MCP's own tool policy excludes the tool.
    McpPolicyExcluded,
    /// The user's override patterns exclude the tool.
    UserPolicyExcluded,
    /// The tool is not in any enabled MCP's catalog.
    UnknownTool,
}

// ============================================================
// LM conversation
// ============================================================

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LmRole {
    User,
    Assistant,
}

/// One message in the per-request conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmMessage {
    pub role: LmRole,
    pub payload: MessagePayload,
}

impl LmMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: LmRole::User,
            payload: MessagePayload::Text(text.into()),
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: LmRole::Assistant,
            payload: MessagePayload::Text(text.into()),
        }
    }
}

/// Content of a conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MessagePayload {
    /// Plain text.
    Text(String),
    /// An assistant turn that requested tool invocations, with any text the
    /// model emitted alongside them.
    ToolUse {
        text: String,
        requests: Vec<ToolUseRequest>,
    },
    /// A user turn carrying tool results, paired 1:1 with the preceding
    /// tool-use turn in request order.
    ToolResults(Vec<ToolUseResult>),
}

/// A tool invocation requested by the LM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseRequest {
    /// Provider-assigned id used to pair the result with the request.
    pub id: String,
    /// Qualified tool name as declared to the LM (`mcp__tool`).
    pub name: String,
    pub arguments: serde_json::Value,
}

/// The result paired with one [`ToolUseRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUseResult {
    pub request_id: String,
    /// Qualified tool name the result belongs to.
    pub name: String,
    pub outcome: ToolOutcome,
}

/// The LM's reply to one invocation.
///
/// An empty `tool_requests` means the reply is final text.
#[derive(Debug, Clone)]
pub struct LmReply {
    pub text: String,
    pub tool_requests: Vec<ToolUseRequest>,
    pub model: String,
    pub usage: TokenUsage,
}

impl LmReply {
    pub fn is_final(&self) -> bool {
        self.tool_requests.is_empty()
    }
}

/// Token accounting for one LM call, or accumulated across a request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Non-cached input tokens (cache writes included).
    pub input_tokens: u64,
    /// Generated tokens.
    pub output_tokens: u64,
    /// Input tokens served from the provider's prompt cache.
    pub cached_tokens: u64,
}

impl TokenUsage {
    /// Fold another call's usage into this accumulator.
    pub fn accumulate(&mut self, other: TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
    }
}

/// The resolved identity a request runs as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: String,
    pub name: Option<String>,
    pub role: String,
    /// True when the user fell back to the `default_user` principal.
    pub is_default: bool,
}

/// Opaque system context handed to the LM on every iteration.
///
/// One logical segment whose text is byte-stable for the lifetime of a
/// request, so the provider can bill repeated iterations at the cached rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemContext {
    pub text: String,
}

// ============================================================
// MCP wire protocol
// ============================================================

/// A JSON-RPC 2.0 message exchanged with an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcMessage {
    pub jsonrpc: String,
    /// Request id (absent for notifications).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcMessage {
    /// Build a request with the given id, method, and params.
    pub fn request(id: u64, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(serde_json::Value::Number(id.into())),
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Build a notification (no id, no response expected).
    pub fn notification(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A tool definition as returned by an MCP server's `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// Health of one MCP server as observed by the registry.
///
/// `Unknown → Healthy` on the first successful list; `Healthy → Unhealthy`
/// on a discovery or invocation transport error; `Unhealthy → Healthy` on
/// the next successful list. Tool-level failures never change health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpHealth {
    Unknown,
    Healthy,
    Unhealthy,
}

/// One MCP's catalog as seen by a request at entry.
#[derive(Debug, Clone)]
pub struct McpCatalog {
    pub mcp: String,
    pub health: McpHealth,
    /// Tools in the order the server listed them, post policy filtering.
    pub tools: Vec<ToolDescriptor>,
}

// ============================================================
// Audit
// ============================================================

/// The single durable row summarizing one request. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub user_id: String,
    pub message: String,
    pub iterations: u32,
    pub tool_calls_count: u32,
    /// Display names (`mcp.tool`) of executed tools, in execution order.
    pub tools_used: Vec<String>,
    /// Names of MCPs that served at least one invocation.
    pub mcps_accessed: Vec<String>,
    pub tokens_input: u64,
    pub tokens_output: u64,
    pub tokens_cached: u64,
    pub cost_estimate: f64,
    pub status: RequestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}
