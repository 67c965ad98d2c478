//! MCP registry: discovery, tool-schema cache, health tracking, invocation.
//!
//! Holds the enabled-ordered set of configured servers. Discovery fills a
//! per-server tool catalog cache (TTL-bounded); invocation routes calls
//! through pooled connections with transport-level retry. Discovery failure
//! is non-fatal: the server is marked unhealthy and any stale catalog keeps
//! serving until the next successful list.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, info, warn};

use switchboard_types::config::{ConfigSnapshot, McpDescriptor, ToolPolicyMode};
use switchboard_types::errors::SwitchboardError;
use switchboard_types::messages::{McpCatalog, McpHealth, McpToolDef, ToolDescriptor, ToolOutcome};
use switchboard_types::pattern::matches_any;
use switchboard_types::traits::McpInvoker;

use crate::client::McpConnection;

/// Boxed future borrowing the server connection for one operation.
type ConnFuture<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = Result<T, SwitchboardError>> + Send + 'a>>;

/// A cached tool catalog for one server.
#[derive(Debug, Clone)]
struct CachedCatalog {
    tools: Vec<ToolDescriptor>,
    fetched_at: Instant,
}

/// Per-server runtime state.
struct ServerHandle {
    name: String,
    /// Pooled connection; invocations on one server are serialized.
    conn: Mutex<Option<McpConnection>>,
    catalog: RwLock<Option<CachedCatalog>>,
    health: RwLock<McpHealth>,
    /// Coalescing guard: one refresh per server at a time.
    refresh_guard: Mutex<()>,
}

impl ServerHandle {
    fn new(name: String) -> Self {
        Self {
            name,
            conn: Mutex::new(None),
            catalog: RwLock::new(None),
            health: RwLock::new(McpHealth::Unknown),
            refresh_guard: Mutex::new(()),
        }
    }

    async fn set_health(&self, health: McpHealth) {
        let mut current = self.health.write().await;
        if *current != health {
            info!(server = %self.name, from = ?*current, to = ?health, "MCP health transition");
            *current = health;
        }
    }
}

/// The MCP registry and client front.
pub struct McpRegistry {
    config: watch::Receiver<ConfigSnapshot>,
    servers: RwLock<HashMap<String, Arc<ServerHandle>>>,
}

impl McpRegistry {
    pub fn new(config: watch::Receiver<ConfigSnapshot>) -> Self {
        Self {
            config,
            servers: RwLock::new(HashMap::new()),
        }
    }

    fn config(&self) -> ConfigSnapshot {
        self.config.borrow().clone()
    }

    async fn handle(&self, name: &str) -> Arc<ServerHandle> {
        if let Some(handle) = self.servers.read().await.get(name) {
            return Arc::clone(handle);
        }
        let mut servers = self.servers.write().await;
        Arc::clone(
            servers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(ServerHandle::new(name.to_string()))),
        )
    }

    /// Current health of one server.
    pub async fn health(&self, mcp_name: &str) -> McpHealth {
        *self.handle(mcp_name).await.health.read().await
    }

    /// Refresh every enabled server's catalog concurrently.
    ///
    /// Failures are logged per server and never abort the sweep.
    pub async fn refresh_all(&self) {
        let config = self.config();
        let refreshes = config
            .enabled_mcps()
            .map(|descriptor| self.refresh_catalog(descriptor.clone(), &config));
        for result in futures::future::join_all(refreshes).await {
            if let Err(e) = result {
                warn!(error = %e, "catalog refresh failed");
            }
        }
    }

    /// List one server's tools, cache-first.
    ///
    /// Fresh cache (age < TTL) is returned as-is; otherwise the catalog is
    /// re-fetched. A fetch failure falls back to the stale catalog when one
    /// exists.
    pub async fn list_tools(
        &self,
        mcp_name: &str,
    ) -> Result<Vec<ToolDescriptor>, SwitchboardError> {
        let config = self.config();
        let descriptor = config
            .mcp(mcp_name)
            .ok_or_else(|| SwitchboardError::Mcp(format!("unknown MCP server: {mcp_name}")))?
            .clone();
        if !descriptor.enabled {
            return Err(SwitchboardError::Mcp(format!(
                "MCP server '{mcp_name}' is disabled"
            )));
        }

        let handle = self.handle(mcp_name).await;
        let ttl = Duration::from_secs(config.mcps.schema_cache_ttl_secs);

        if let Some(cached) = handle.catalog.read().await.as_ref() {
            if cached.fetched_at.elapsed() < ttl {
                debug!(server = %mcp_name, "serving cached tool catalog");
                return Ok(cached.tools.clone());
            }
        }

        match self.refresh_catalog(descriptor, &config).await {
            Ok(tools) => Ok(tools),
            Err(e) => {
                // Stale beats nothing; the server is already marked unhealthy.
                if let Some(cached) = handle.catalog.read().await.as_ref() {
                    warn!(server = %mcp_name, error = %e, "serving stale catalog after refresh failure");
                    return Ok(cached.tools.clone());
                }
                Err(e)
            }
        }
    }

    /// Drop cached catalogs so the next access re-discovers.
    pub async fn invalidate(&self, mcp_name: Option<&str>) {
        let servers = self.servers.read().await;
        match mcp_name {
            Some(name) => {
                if let Some(handle) = servers.get(name) {
                    *handle.catalog.write().await = None;
                    info!(server = %name, "invalidated tool catalog");
                }
            }
            None => {
                for handle in servers.values() {
                    *handle.catalog.write().await = None;
                }
                info!("invalidated all tool catalogs");
            }
        }
    }

    /// Fetch and cache one server's catalog, applying its tool policy.
    async fn refresh_catalog(
        &self,
        descriptor: McpDescriptor,
        config: &ConfigSnapshot,
    ) -> Result<Vec<ToolDescriptor>, SwitchboardError> {
        let handle = self.handle(&descriptor.name).await;
        let _guard = handle.refresh_guard.lock().await;

        // Another task may have refreshed while we waited on the guard.
        let ttl = Duration::from_secs(config.mcps.schema_cache_ttl_secs);
        if let Some(cached) = handle.catalog.read().await.as_ref() {
            if cached.fetched_at.elapsed() < ttl {
                return Ok(cached.tools.clone());
            }
        }

        let result = self
            .with_connection(&handle, &descriptor, config, |conn| {
                Box::pin(async move { conn.list_tools().await })
            })
            .await;

        match result {
            Ok(defs) => {
                let tools = filter_by_policy(&descriptor, defs);
                info!(
                    server = %descriptor.name,
                    tool_count = tools.len(),
                    "tool catalog refreshed"
                );
                *handle.catalog.write().await = Some(CachedCatalog {
                    tools: tools.clone(),
                    fetched_at: Instant::now(),
                });
                handle.set_health(McpHealth::Healthy).await;
                Ok(tools)
            }
            Err(e) => {
                warn!(server = %descriptor.name, error = %e, "tool discovery failed");
                handle.set_health(McpHealth::Unhealthy).await;
                Err(e)
            }
        }
    }

    /// Run an operation against the server's pooled connection, with
    /// transport-level retry and reconnection between attempts.
    async fn with_connection<T, F>(
        &self,
        handle: &ServerHandle,
        descriptor: &McpDescriptor,
        config: &ConfigSnapshot,
        op: F,
    ) -> Result<T, SwitchboardError>
    where
        F: for<'a> Fn(&'a mut McpConnection) -> ConnFuture<'a, T>,
    {
        let retry = config.retry_for(&descriptor.name);
        let max_age = Duration::from_secs(retry.connection_max_age_secs);
        let mut conn_slot = handle.conn.lock().await;
        let mut last_error = None;

        for attempt in 1..=retry.max_attempts.max(1) {
            // Establish or replace the connection as needed.
            let needs_new = match conn_slot.as_ref() {
                None => true,
                Some(conn) => !conn.is_connected() || conn.age() > max_age,
            };
            if needs_new {
                if let Some(mut old) = conn_slot.take() {
                    old.close().await;
                }
                match McpConnection::establish(descriptor).await {
                    Ok(conn) => *conn_slot = Some(conn),
                    Err(e) => {
                        warn!(
                            server = %descriptor.name,
                            attempt,
                            error = %e,
                            "connection attempt failed"
                        );
                        last_error = Some(e);
                        if attempt < retry.max_attempts {
                            tokio::time::sleep(Duration::from_millis(retry.delay_ms)).await;
                        }
                        continue;
                    }
                }
            }

            let Some(conn) = conn_slot.as_mut() else {
                continue;
            };
            match op(conn).await {
                Ok(value) => return Ok(value),
                Err(e @ SwitchboardError::McpTransport(_)) => {
                    warn!(
                        server = %descriptor.name,
                        attempt,
                        error = %e,
                        "transport error, dropping connection"
                    );
                    if let Some(mut old) = conn_slot.take() {
                        old.close().await;
                    }
                    last_error = Some(e);
                    if attempt < retry.max_attempts {
                        tokio::time::sleep(Duration::from_millis(retry.delay_ms)).await;
                    }
                }
                // Non-transport errors are not retried.
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SwitchboardError::Internal("retry loop exited without an error".to_string())
        }))
    }
}

/// Apply the server's tool policy to a freshly discovered catalog.
fn filter_by_policy(descriptor: &McpDescriptor, defs: Vec<McpToolDef>) -> Vec<ToolDescriptor> {
    let policy = &descriptor.tool_policy;
    defs.into_iter()
        .filter(|def| match policy.mode {
            ToolPolicyMode::AllowAll => true,
            ToolPolicyMode::AllowOnly => matches_any(&policy.tools, &def.name),
            ToolPolicyMode::AllowAllExcept => !matches_any(&policy.tools, &def.name),
        })
        .map(|def| ToolDescriptor {
            name: def.name,
            description: def.description.unwrap_or_default(),
            input_schema: def.input_schema,
            mcp: descriptor.name.clone(),
        })
        .collect()
}

#[async_trait]
impl McpInvoker for McpRegistry {
    /// Catalogs for every enabled server, in configuration order.
    async fn catalog_snapshot(&self) -> Vec<McpCatalog> {
        let config = self.config();
        let mut catalogs = Vec::new();
        for descriptor in config.enabled_mcps() {
            let tools = self.list_tools(&descriptor.name).await.unwrap_or_default();
            let health = self.health(&descriptor.name).await;
            catalogs.push(McpCatalog {
                mcp: descriptor.name.clone(),
                health,
                tools,
            });
        }
        catalogs
    }

    /// Invoke one tool, folding every failure into a [`ToolOutcome`].
    ///
    /// Transport failures (after retries) mark the server unhealthy; tool
    /// failures do not touch health.
    async fn call_tool(
        &self,
        mcp_name: &str,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> ToolOutcome {
        let config = self.config();
        let descriptor = match config.mcp(mcp_name) {
            Some(d) if d.enabled => d.clone(),
            Some(_) => {
                return ToolOutcome::failed(format!("MCP server '{mcp_name}' is disabled"));
            }
            None => {
                return ToolOutcome::failed(format!("unknown MCP server: {mcp_name}"));
            }
        };

        let handle = self.handle(mcp_name).await;
        let tool = tool_name.to_string();

        debug!(server = %mcp_name, tool = %tool_name, "invoking tool");

        let result = self
            .with_connection(&handle, &descriptor, &config, |conn| {
                let tool = tool.clone();
                let args = arguments.clone();
                Box::pin(async move { conn.call_tool(&tool, args).await })
            })
            .await;

        match result {
            Ok(outcome) => outcome,
            Err(e) => {
                handle.set_health(McpHealth::Unhealthy).await;
                warn!(server = %mcp_name, tool = %tool_name, error = %e, "tool invocation failed at transport level");
                ToolOutcome::failed(format!("MCP server '{mcp_name}' is unavailable: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::State;
    use axum::response::Response;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use switchboard_types::config::*;
    use tokio::net::TcpListener;

    /// A scripted MCP server for registry tests.
    #[derive(Clone)]
    struct TestMcp {
        tools: serde_json::Value,
        call_result: serde_json::Value,
        list_count: Arc<AtomicU32>,
        call_count: Arc<AtomicU32>,
        /// When set, tools/call answers HTTP 500 once, then recovers.
        fail_next_call: Arc<AtomicBool>,
        /// When set, every request answers HTTP 500.
        down: Arc<AtomicBool>,
    }

    impl TestMcp {
        fn new(tools: serde_json::Value, call_result: serde_json::Value) -> Self {
            Self {
                tools,
                call_result,
                list_count: Arc::new(AtomicU32::new(0)),
                call_count: Arc::new(AtomicU32::new(0)),
                fail_next_call: Arc::new(AtomicBool::new(false)),
                down: Arc::new(AtomicBool::new(false)),
            }
        }

        async fn serve(self) -> String {
            let app = Router::new()
                .route("/mcp", post(handle_rpc))
                .with_state(self);
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            format!("http://{addr}")
        }
    }

    async fn handle_rpc(State(mcp): State<TestMcp>, body: String) -> Response {
        if mcp.down.load(Ordering::SeqCst) {
            return Response::builder()
                .status(500)
                .body(Body::from("down"))
                .unwrap();
        }

        let req: serde_json::Value = serde_json::from_str(&body).unwrap();
        let id = req["id"].clone();
        let method = req["method"].as_str().unwrap_or("");

        let result = match method {
            "initialize" => serde_json::json!({
                "protocolVersion": "2025-03-26",
                "capabilities": {},
                "serverInfo": {"name": "test-mcp", "version": "0.0.1"}
            }),
            "notifications/initialized" => {
                return Response::builder()
                    .status(204)
                    .body(Body::empty())
                    .unwrap();
            }
            "tools/list" => {
                mcp.list_count.fetch_add(1, Ordering::SeqCst);
                serde_json::json!({"tools": mcp.tools})
            }
            "tools/call" => {
                mcp.call_count.fetch_add(1, Ordering::SeqCst);
                if mcp.fail_next_call.swap(false, Ordering::SeqCst) {
                    return Response::builder()
                        .status(500)
                        .body(Body::from("flaky"))
                        .unwrap();
                }
                mcp.call_result.clone()
            }
            _ => serde_json::json!(null),
        };

        let reply = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result});
        Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .body(Body::from(reply.to_string()))
            .unwrap()
    }

    fn two_tools() -> serde_json::Value {
        serde_json::json!([
            {
                "name": "get_database_health",
                "description": "Check one database",
                "inputSchema": {"type": "object"}
            },
            {
                "name": "drop_all_tables",
                "description": "Do not call this",
                "inputSchema": {"type": "object"}
            }
        ])
    }

    fn ok_call_result() -> serde_json::Value {
        serde_json::json!({"content": [{"type": "text", "text": "healthy"}]})
    }

    fn snapshot_for(url: &str, policy: ToolPolicy, ttl_secs: u64) -> ConfigSnapshot {
        ConfigSnapshot {
            mcps: McpRegistryConfig {
                mcps: vec![McpDescriptor {
                    name: "database_mcp".to_string(),
                    endpoint: McpEndpoint::Http {
                        url: url.to_string(),
                    },
                    enabled: true,
                    auth_token: None,
                    timeout_secs: 5,
                    tool_policy: policy,
                    retry: Some(RetryConfig {
                        max_attempts: 2,
                        delay_ms: 10,
                        connection_max_age_secs: 600,
                    }),
                }],
                retry: RetryConfig::default(),
                schema_cache_ttl_secs: ttl_secs,
            },
            ..Default::default()
        }
    }

    fn registry_for(snapshot: ConfigSnapshot) -> McpRegistry {
        let (_tx, rx) = watch::channel(snapshot);
        McpRegistry::new(rx)
    }

    #[tokio::test]
    async fn discovery_populates_catalog_and_health() {
        let mcp = TestMcp::new(two_tools(), ok_call_result());
        let url = mcp.clone().serve().await;
        let registry = registry_for(snapshot_for(&url, ToolPolicy::default(), 300));

        assert_eq!(registry.health("database_mcp").await, McpHealth::Unknown);

        let tools = registry.list_tools("database_mcp").await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].mcp, "database_mcp");
        assert_eq!(registry.health("database_mcp").await, McpHealth::Healthy);
    }

    #[tokio::test]
    async fn fresh_cache_skips_the_server() {
        let mcp = TestMcp::new(two_tools(), ok_call_result());
        let url = mcp.clone().serve().await;
        let registry = registry_for(snapshot_for(&url, ToolPolicy::default(), 300));

        registry.list_tools("database_mcp").await.unwrap();
        registry.list_tools("database_mcp").await.unwrap();
        registry.list_tools("database_mcp").await.unwrap();

        assert_eq!(mcp.list_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_cache_refetches() {
        let mcp = TestMcp::new(two_tools(), ok_call_result());
        let url = mcp.clone().serve().await;
        let registry = registry_for(snapshot_for(&url, ToolPolicy::default(), 0));

        registry.list_tools("database_mcp").await.unwrap();
        registry.list_tools("database_mcp").await.unwrap();

        assert_eq!(mcp.list_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn allow_only_policy_filters_catalog() {
        let mcp = TestMcp::new(two_tools(), ok_call_result());
        let url = mcp.clone().serve().await;
        let policy = ToolPolicy {
            mode: ToolPolicyMode::AllowOnly,
            tools: vec!["get_*".to_string()],
        };
        let registry = registry_for(snapshot_for(&url, policy, 300));

        let tools = registry.list_tools("database_mcp").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "get_database_health");
    }

    #[tokio::test]
    async fn allow_all_except_policy_filters_catalog() {
        let mcp = TestMcp::new(two_tools(), ok_call_result());
        let url = mcp.clone().serve().await;
        let policy = ToolPolicy {
            mode: ToolPolicyMode::AllowAllExcept,
            tools: vec!["drop_*".to_string()],
        };
        let registry = registry_for(snapshot_for(&url, policy, 300));

        let tools = registry.list_tools("database_mcp").await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "get_database_health");
    }

    #[tokio::test]
    async fn call_tool_returns_outcome() {
        let mcp = TestMcp::new(two_tools(), ok_call_result());
        let url = mcp.clone().serve().await;
        let registry = registry_for(snapshot_for(&url, ToolPolicy::default(), 300));

        let outcome = registry
            .call_tool("database_mcp", "get_database_health", serde_json::json!({}))
            .await;
        assert!(outcome.success);
        assert_eq!(outcome.output, serde_json::json!("healthy"));
    }

    #[tokio::test]
    async fn tool_level_failure_keeps_health() {
        let failing_result = serde_json::json!({
            "content": [{"type": "text", "text": "relation does not exist"}],
            "isError": true
        });
        let mcp = TestMcp::new(two_tools(), failing_result);
        let url = mcp.clone().serve().await;
        let registry = registry_for(snapshot_for(&url, ToolPolicy::default(), 300));

        registry.list_tools("database_mcp").await.unwrap();
        let outcome = registry
            .call_tool("database_mcp", "get_database_health", serde_json::json!({}))
            .await;

        assert!(!outcome.success);
        assert_eq!(registry.health("database_mcp").await, McpHealth::Healthy);
    }

    #[tokio::test]
    async fn transport_failure_retries_then_succeeds() {
        let mcp = TestMcp::new(two_tools(), ok_call_result());
        let url = mcp.clone().serve().await;
        let registry = registry_for(snapshot_for(&url, ToolPolicy::default(), 300));

        mcp.fail_next_call.store(true, Ordering::SeqCst);
        let outcome = registry
            .call_tool("database_mcp", "get_database_health", serde_json::json!({}))
            .await;

        assert!(outcome.success, "second attempt should have succeeded");
        assert_eq!(mcp.call_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn server_down_marks_unhealthy_and_folds_error() {
        let mcp = TestMcp::new(two_tools(), ok_call_result());
        let url = mcp.clone().serve().await;
        let registry = registry_for(snapshot_for(&url, ToolPolicy::default(), 300));

        registry.list_tools("database_mcp").await.unwrap();
        assert_eq!(registry.health("database_mcp").await, McpHealth::Healthy);

        mcp.down.store(true, Ordering::SeqCst);
        let outcome = registry
            .call_tool("database_mcp", "get_database_health", serde_json::json!({}))
            .await;

        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("unavailable"));
        assert_eq!(registry.health("database_mcp").await, McpHealth::Unhealthy);
    }

    #[tokio::test]
    async fn stale_catalog_serves_while_unhealthy_and_recovers() {
        let mcp = TestMcp::new(two_tools(), ok_call_result());
        let url = mcp.clone().serve().await;
        let registry = registry_for(snapshot_for(&url, ToolPolicy::default(), 0));

        registry.list_tools("database_mcp").await.unwrap();

        mcp.down.store(true, Ordering::SeqCst);
        let stale = registry.list_tools("database_mcp").await.unwrap();
        assert_eq!(stale.len(), 2, "stale catalog should keep serving");
        assert_eq!(registry.health("database_mcp").await, McpHealth::Unhealthy);

        mcp.down.store(false, Ordering::SeqCst);
        registry.list_tools("database_mcp").await.unwrap();
        assert_eq!(registry.health("database_mcp").await, McpHealth::Healthy);
    }

    #[tokio::test]
    async fn disabled_mcp_rejected() {
        let mut snapshot = snapshot_for("http://localhost:0", ToolPolicy::default(), 300);
        snapshot.mcps.mcps[0].enabled = false;
        let registry = registry_for(snapshot);

        assert!(registry.list_tools("database_mcp").await.is_err());
        let outcome = registry
            .call_tool("database_mcp", "anything", serde_json::json!({}))
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("disabled"));

        let catalogs = registry.catalog_snapshot().await;
        assert!(catalogs.is_empty());
    }

    #[tokio::test]
    async fn catalog_snapshot_follows_config_order() {
        let first = TestMcp::new(two_tools(), ok_call_result());
        let second = TestMcp::new(
            serde_json::json!([{
                "name": "search_repos",
                "description": "Search repositories",
                "inputSchema": {"type": "object"}
            }]),
            ok_call_result(),
        );
        let url_a = first.clone().serve().await;
        let url_b = second.clone().serve().await;

        let mut snapshot = snapshot_for(&url_a, ToolPolicy::default(), 300);
        snapshot.mcps.mcps.push(McpDescriptor {
            name: "github_mcp".to_string(),
            endpoint: McpEndpoint::Http { url: url_b },
            enabled: true,
            auth_token: None,
            timeout_secs: 5,
            tool_policy: ToolPolicy::default(),
            retry: None,
        });
        let registry = registry_for(snapshot);

        let catalogs = registry.catalog_snapshot().await;
        assert_eq!(catalogs.len(), 2);
        assert_eq!(catalogs[0].mcp, "database_mcp");
        assert_eq!(catalogs[1].mcp, "github_mcp");
        assert_eq!(catalogs[1].tools[0].name, "search_repos");
    }

    #[tokio::test]
    async fn unknown_server_folds_into_outcome() {
        let registry = registry_for(ConfigSnapshot::default());
        let outcome = registry
            .call_tool("ghost_mcp", "anything", serde_json::json!({}))
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("unknown MCP server"));
    }
}
