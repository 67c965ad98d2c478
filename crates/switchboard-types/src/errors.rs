/// Unified error type for the Switchboard bridge.
///
/// All crates in the workspace propagate this error across their boundaries.
/// Subsystem-internal errors are converted into the matching variant at the
/// point where they leave the subsystem.
#[derive(Debug, thiserror::Error)]
pub enum SwitchboardError {
    /// A transport-level MCP failure (connect, I/O, protocol framing).
    /// These mark the server unhealthy and are retried where configured.
    #[error("MCP transport error: {0}")]
    McpTransport(String),

    /// An MCP-level protocol or routing problem that is not a transport
    /// failure (unknown server, bad JSON-RPC payload, policy mismatch).
    #[error("MCP error: {0}")]
    Mcp(String),

    /// A tool returned a failure payload. Never retried and never affects
    /// server health; the bridge folds these into tool results for the LM.
    #[error("tool execution error: {0}")]
    ToolExecution(String),

    /// Error from the permission resolver (malformed override, bad pattern).
    #[error("permission error: {0}")]
    Permission(String),

    /// The upstream language model call failed after retries.
    #[error("LM error: {0}")]
    Llm(String),

    /// The LM provider rejected the request for quota reasons (HTTP 429).
    #[error("LM rate limited: {0}")]
    LlmRateLimited(String),

    /// A request-level deadline expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Error loading or validating configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Error from the audit store (insert or query failure).
    #[error("audit error: {0}")]
    Audit(String),

    /// Database error (connection, query, migration).
    #[error("database error: {0}")]
    Database(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Unexpected internal condition.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for SwitchboardError {
    fn from(err: serde_json::Error) -> Self {
        SwitchboardError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for SwitchboardError {
    fn from(err: serde_yaml::Error) -> Self {
        SwitchboardError::Serialization(err.to_string())
    }
}

/// Admission rejection from the rate limiter.
///
/// Carries everything the front-end needs to render a useful message:
/// the ceiling, the observed count, and when the window opens again.
#[derive(Debug, Clone)]
pub struct RateLimitDenied {
    /// The user that was rejected.
    pub user_id: String,
    /// Requests observed in the current window.
    pub current: u32,
    /// The role ceiling that was hit.
    pub limit: u32,
    /// Seconds until the oldest in-window request falls out.
    pub retry_after_secs: u64,
}

impl std::fmt::Display for RateLimitDenied {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "rate limit exceeded for '{}': {}/{} requests this hour, resets in {}s",
            self.user_id, self.current, self.limit, self.retry_after_secs
        )
    }
}

impl std::error::Error for RateLimitDenied {}
