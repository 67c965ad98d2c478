/// Configuration types for the Switchboard bridge.
///
/// Two logical configs are parsed from the config directory: the MCP
/// registry (`mcps.yaml`) and the user registry (`users.yaml`). LM and
/// bridge limits ride along in `bridge.yaml`. Secrets (LM API key, audit
/// database URL) are never read from files; they come from the environment.
use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ============================================================
// MCP registry config
// ============================================================

/// Top-level MCP registry configuration, parsed from `mcps.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpRegistryConfig {
    /// Configured MCP servers, in declaration order. Declaration order is
    /// the ordering contract for tool catalogs and allowed-tool views.
    #[serde(default)]
    pub mcps: Vec<McpDescriptor>,
    /// Fallback retry settings for servers without their own.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Tool-schema cache TTL in seconds.
    #[serde(default = "default_schema_cache_ttl")]
    pub schema_cache_ttl_secs: u64,
}

fn default_schema_cache_ttl() -> u64 {
    300
}

/// One configured MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub endpoint: McpEndpoint,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bearer token sent on every request, if the server requires auth.
    #[serde(default)]
    pub auth_token: Option<String>,
    #[serde(default = "default_mcp_timeout")]
    pub timeout_secs: u64,
    /// Server-side tool policy applied to the discovered catalog.
    #[serde(default)]
    pub tool_policy: ToolPolicy,
    /// Per-server retry override.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_true() -> bool {
    true
}

fn default_mcp_timeout() -> u64 {
    30
}

/// Transport endpoint for an MCP server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum McpEndpoint {
    /// Streamable HTTP (JSON or SSE responses).
    Http { url: String },
    /// Child process speaking line-delimited JSON-RPC on stdio.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// Retry behavior for transport-level failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
    /// Connections older than this are dropped and re-established lazily.
    #[serde(default = "default_connection_max_age")]
    pub connection_max_age_secs: u64,
}

fn default_max_attempts() -> u32 {
    2
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_connection_max_age() -> u64 {
    600
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_retry_delay_ms(),
            connection_max_age_secs: default_connection_max_age(),
        }
    }
}

/// Which of a server's tools are exposed at all.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolPolicy {
    #[serde(default)]
    pub mode: ToolPolicyMode,
    /// Glob patterns interpreted per `mode`. `*` matches any sequence.
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPolicyMode {
    #[default]
    AllowAll,
    AllowOnly,
    AllowAllExcept,
}

// ============================================================
// User registry config
// ============================================================

/// Top-level user registry configuration, parsed from `users.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserRegistryConfig {
    #[serde(default)]
    pub users: Vec<UserEntry>,
    /// Role table: rate ceilings and default MCP access per role.
    #[serde(default)]
    pub roles: HashMap<String, RoleConfig>,
    /// Principal applied to users not present in `users`.
    #[serde(default)]
    pub default_user: DefaultUserConfig,
    /// Create a user entry lazily on first request when true.
    #[serde(default = "default_true")]
    pub auto_provisioning: bool,
}

/// One configured user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    pub role: String,
    /// Per-MCP overrides keyed by MCP name.
    #[serde(default)]
    pub mcp_permissions: HashMap<String, McpOverride>,
}

/// Fallback principal for unknown users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultUserConfig {
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub mcp_permissions: HashMap<String, McpOverride>,
}

fn default_role() -> String {
    "read_only".to_string()
}

impl Default for DefaultUserConfig {
    fn default() -> Self {
        Self {
            role: default_role(),
            mcp_permissions: HashMap::new(),
        }
    }
}

/// A per-user override for one MCP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpOverride {
    #[serde(default)]
    pub mode: OverrideMode,
    /// Allow patterns for `custom` mode.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Deny patterns subtracted after the allow pass.
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideMode {
    /// Every tool on the MCP.
    All,
    /// Only tools matching the override's patterns.
    Custom,
    /// Defer to the MCP's own tool policy.
    #[default]
    Inherit,
    /// No access to the MCP.
    None,
}

/// Per-role settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    pub requests_per_hour: RateCeiling,
    #[serde(default)]
    pub allowed_mcps: McpAccess,
}

/// Requests-per-hour ceiling. YAML accepts a number or `unlimited`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateCeiling {
    Unlimited,
    Limited(u32),
}

impl Serialize for RateCeiling {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RateCeiling::Unlimited => serializer.serialize_str("unlimited"),
            RateCeiling::Limited(n) => serializer.serialize_u32(*n),
        }
    }
}

impl<'de> Deserialize<'de> for RateCeiling {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u32),
            Text(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Num(n) => Ok(RateCeiling::Limited(n)),
            Raw::Text(s) if s == "unlimited" => Ok(RateCeiling::Unlimited),
            Raw::Text(other) => Err(serde::de::Error::custom(format!(
                "expected a number or \"unlimited\", got \"{other}\""
            ))),
        }
    }
}

/// Which MCPs a role may reach by default. YAML accepts `"*"` or a list.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum McpAccess {
    #[default]
    All,
    Named(Vec<String>),
}

impl McpAccess {
    pub fn permits(&self, mcp_name: &str) -> bool {
        match self {
            McpAccess::All => true,
            McpAccess::Named(names) => names.iter().any(|n| n == mcp_name),
        }
    }
}

impl Serialize for McpAccess {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            McpAccess::All => serializer.serialize_str("*"),
            McpAccess::Named(names) => names.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for McpAccess {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            List(Vec<String>),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Text(s) if s == "*" => Ok(McpAccess::All),
            Raw::Text(other) => Err(serde::de::Error::custom(format!(
                "expected \"*\" or a list of MCP names, got \"{other}\""
            ))),
            Raw::List(names) if names.iter().any(|n| n == "*") => Ok(McpAccess::All),
            Raw::List(names) => Ok(McpAccess::Named(names)),
        }
    }
}

// ============================================================
// LM + bridge config
// ============================================================

/// LM adapter configuration, parsed from `bridge.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub pricing: TokenPricing,
}

fn default_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_llm_timeout() -> u64 {
    60
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: None,
            timeout_secs: default_llm_timeout(),
            pricing: TokenPricing::default(),
        }
    }
}

/// USD prices per million tokens.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenPricing {
    #[serde(default = "default_input_price")]
    pub input_per_mtok: f64,
    #[serde(default = "default_output_price")]
    pub output_per_mtok: f64,
    #[serde(default = "default_cached_price")]
    pub cached_per_mtok: f64,
}

fn default_input_price() -> f64 {
    0.80
}

fn default_output_price() -> f64 {
    4.00
}

fn default_cached_price() -> f64 {
    0.08
}

impl Default for TokenPricing {
    fn default() -> Self {
        Self {
            input_per_mtok: default_input_price(),
            output_per_mtok: default_output_price(),
            cached_per_mtok: default_cached_price(),
        }
    }
}

/// Loop and store bounds, parsed from `bridge.yaml`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BridgeLimits {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Bound on messages kept per conversation thread.
    #[serde(default = "default_thread_max_messages")]
    pub thread_max_messages: usize,
    #[serde(default = "default_thread_ttl")]
    pub thread_ttl_secs: u64,
    #[serde(default = "default_permission_cache_ttl")]
    pub permission_cache_ttl_secs: u64,
}

fn default_max_iterations() -> u32 {
    10
}

fn default_request_timeout() -> u64 {
    120
}

fn default_thread_max_messages() -> usize {
    3
}

fn default_thread_ttl() -> u64 {
    86_400
}

fn default_permission_cache_ttl() -> u64 {
    300
}

impl Default for BridgeLimits {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            request_timeout_secs: default_request_timeout(),
            thread_max_messages: default_thread_max_messages(),
            thread_ttl_secs: default_thread_ttl(),
            permission_cache_ttl_secs: default_permission_cache_ttl(),
        }
    }
}

// ============================================================
// Snapshot
// ============================================================

/// An immutable view of all configuration, captured at request entry.
///
/// A request resolves everything against one snapshot; a reload mid-flight
/// never retargets an in-flight request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub mcps: McpRegistryConfig,
    pub users: UserRegistryConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub limits: BridgeLimits,
}

impl ConfigSnapshot {
    pub fn mcp(&self, name: &str) -> Option<&McpDescriptor> {
        self.mcps.mcps.iter().find(|m| m.name == name)
    }

    /// Enabled descriptors in declaration order.
    pub fn enabled_mcps(&self) -> impl Iterator<Item = &McpDescriptor> {
        self.mcps.mcps.iter().filter(|m| m.enabled)
    }

    pub fn user(&self, email: &str) -> Option<&UserEntry> {
        self.users.users.iter().find(|u| u.email == email)
    }

    pub fn role(&self, name: &str) -> Option<&RoleConfig> {
        self.users.roles.get(name)
    }

    /// Retry settings for one server, falling back to the global table.
    pub fn retry_for(&self, mcp_name: &str) -> RetryConfig {
        self.mcp(mcp_name)
            .and_then(|m| m.retry)
            .unwrap_or(self.mcps.retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_ceiling_accepts_number_and_unlimited() {
        let limited: RateCeiling = serde_yaml::from_str("20").unwrap();
        assert_eq!(limited, RateCeiling::Limited(20));

        let unlimited: RateCeiling = serde_yaml::from_str("unlimited").unwrap();
        assert_eq!(unlimited, RateCeiling::Unlimited);

        assert!(serde_yaml::from_str::<RateCeiling>("sometimes").is_err());
    }

    #[test]
    fn mcp_access_accepts_star_and_list() {
        let all: McpAccess = serde_yaml::from_str("\"*\"").unwrap();
        assert_eq!(all, McpAccess::All);

        let named: McpAccess = serde_yaml::from_str("[database_mcp, github_mcp]").unwrap();
        assert!(named.permits("database_mcp"));
        assert!(!named.permits("analytics_mcp"));

        let star_in_list: McpAccess = serde_yaml::from_str("[\"*\"]").unwrap();
        assert_eq!(star_in_list, McpAccess::All);
    }

    #[test]
    fn descriptor_defaults() {
        let yaml = r#"
name: database_mcp
transport: http
url: http://localhost:9100
"#;
        let mcp: McpDescriptor = serde_yaml::from_str(yaml).unwrap();
        assert!(mcp.enabled);
        assert_eq!(mcp.timeout_secs, 30);
        assert_eq!(mcp.tool_policy.mode, ToolPolicyMode::AllowAll);
        assert!(mcp.retry.is_none());
        match mcp.endpoint {
            McpEndpoint::Http { ref url } => assert_eq!(url, "http://localhost:9100"),
            _ => panic!("expected http endpoint"),
        }
    }

    #[test]
    fn stdio_descriptor_parses() {
        let yaml = r#"
name: local_tools
transport: stdio
command: ./tools-server
args: ["--quiet"]
"#;
        let mcp: McpDescriptor = serde_yaml::from_str(yaml).unwrap();
        match mcp.endpoint {
            McpEndpoint::Stdio { ref command, ref args } => {
                assert_eq!(command, "./tools-server");
                assert_eq!(args, &["--quiet".to_string()]);
            }
            _ => panic!("expected stdio endpoint"),
        }
    }

    #[test]
    fn user_registry_parses_overrides() {
        let yaml = r#"
users:
  - email: contractor@ext
    role: contractor
    mcp_permissions:
      database_mcp:
        mode: custom
        tools: ["list_available_databases", "get_database_health"]
roles:
  contractor:
    requests_per_hour: 20
    allowed_mcps: [database_mcp]
  admin:
    requests_per_hour: unlimited
    allowed_mcps: "*"
"#;
        let config: UserRegistryConfig = serde_yaml::from_str(yaml).unwrap();
        let user = &config.users[0];
        assert_eq!(user.role, "contractor");
        let over = &user.mcp_permissions["database_mcp"];
        assert_eq!(over.mode, OverrideMode::Custom);
        assert_eq!(over.tools.len(), 2);

        assert_eq!(
            config.roles["admin"].requests_per_hour,
            RateCeiling::Unlimited
        );
        assert!(config.auto_provisioning);
    }

    #[test]
    fn pricing_defaults() {
        let pricing = TokenPricing::default();
        assert_eq!(pricing.input_per_mtok, 0.80);
        assert_eq!(pricing.output_per_mtok, 4.00);
        assert_eq!(pricing.cached_per_mtok, 0.08);
    }

    #[test]
    fn retry_falls_back_to_global() {
        let snapshot = ConfigSnapshot {
            mcps: McpRegistryConfig {
                mcps: vec![McpDescriptor {
                    name: "db".to_string(),
                    endpoint: McpEndpoint::Http {
                        url: "http://localhost".to_string(),
                    },
                    enabled: true,
                    auth_token: None,
                    timeout_secs: 30,
                    tool_policy: ToolPolicy::default(),
                    retry: None,
                }],
                retry: RetryConfig {
                    max_attempts: 5,
                    delay_ms: 50,
                    connection_max_age_secs: 60,
                },
                schema_cache_ttl_secs: 300,
            },
            ..Default::default()
        };
        assert_eq!(snapshot.retry_for("db").max_attempts, 5);
        assert_eq!(snapshot.retry_for("missing").max_attempts, 5);
    }
}
