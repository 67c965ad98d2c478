//! Permission resolver.
//!
//! Computes, per (user, config snapshot, catalog snapshot), the exact set of
//! tools offered to the LM. Evaluation for a tool `T` on MCP `M`:
//!
//! 1. `M` disabled → deny (`mcp_disabled`)
//! 2. user override for `M` with mode `all` → allow
//! 3. override mode `custom` → allow iff a pattern matches `T` and no deny
//!    pattern matches
//! 4. mode `inherit` or no override → the role's MCP set must list `M`,
//!    then the MCP's own tool policy applies
//! 5. otherwise deny
//!
//! [`resolve_view`] and [`decide`] are pure functions of their inputs; the
//! [`PermissionResolver`] wraps them with a per-user TTL cache and
//! single-flight compute. The cache is an optimization, not the contract —
//! the daemon invalidates it on config reload.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::debug;

use switchboard_types::config::{ConfigSnapshot, McpOverride, OverrideMode, ToolPolicyMode};
use switchboard_types::messages::{
    AllowedToolsView, McpCatalog, PermissionDecision, PermissionReason, ToolDescriptor,
    UserProfile,
};
use switchboard_types::pattern::matches_any;

/// Resolve the effective profile for a user id, falling back to the
/// configured default principal for unknown users.
pub fn resolve_profile(snapshot: &ConfigSnapshot, user_id: &str) -> UserProfile {
    match snapshot.user(user_id) {
        Some(entry) => UserProfile {
            user_id: entry.email.clone(),
            name: entry.name.clone(),
            role: entry.role.clone(),
            is_default: false,
        },
        None => UserProfile {
            user_id: user_id.to_string(),
            name: None,
            role: snapshot.users.default_user.role.clone(),
            is_default: true,
        },
    }
}

fn override_for<'a>(
    snapshot: &'a ConfigSnapshot,
    user_id: &str,
    mcp_name: &str,
) -> Option<&'a McpOverride> {
    let overrides = match snapshot.user(user_id) {
        Some(entry) => &entry.mcp_permissions,
        None => &snapshot.users.default_user.mcp_permissions,
    };
    overrides.get(mcp_name)
}

/// Decide whether one user may invoke one tool.
///
/// Pure: depends only on the snapshot and the arguments. `tool_known` is
/// whether discovery has seen the tool on that MCP; unknown tools are denied
/// regardless of policy.
pub fn decide(
    snapshot: &ConfigSnapshot,
    user_id: &str,
    mcp_name: &str,
    tool_name: &str,
    tool_known: bool,
) -> PermissionDecision {
    let Some(descriptor) = snapshot.mcp(mcp_name) else {
        return PermissionDecision::deny(PermissionReason::UnknownTool);
    };
    if !descriptor.enabled {
        return PermissionDecision::deny(PermissionReason::McpDisabled);
    }
    if !tool_known {
        return PermissionDecision::deny(PermissionReason::UnknownTool);
    }

    if let Some(over) = override_for(snapshot, user_id, mcp_name) {
        match over.mode {
            OverrideMode::All => return PermissionDecision::allow(PermissionReason::UserOverride),
            OverrideMode::Custom => {
                let allowed = matches_any(&over.tools, tool_name)
                    && !matches_any(&over.deny, tool_name);
                return if allowed {
                    PermissionDecision::allow(PermissionReason::UserOverride)
                } else {
                    PermissionDecision::deny(PermissionReason::UserPolicyExcluded)
                };
            }
            OverrideMode::None => {
                return PermissionDecision::deny(PermissionReason::UserPolicyExcluded)
            }
            OverrideMode::Inherit => {}
        }
    }

    // Inherit path: the role must list the MCP, then the MCP's own policy
    // has the final word.
    let profile = resolve_profile(snapshot, user_id);
    match snapshot.role(&profile.role) {
        Some(role) if role.allowed_mcps.permits(mcp_name) => {}
        _ => return PermissionDecision::deny(PermissionReason::RoleDefault),
    }

    let policy = &descriptor.tool_policy;
    let allowed = match policy.mode {
        ToolPolicyMode::AllowAll => true,
        ToolPolicyMode::AllowOnly => matches_any(&policy.tools, tool_name),
        ToolPolicyMode::AllowAllExcept => !matches_any(&policy.tools, tool_name),
    };
    if allowed {
        PermissionDecision::allow(PermissionReason::RoleDefault)
    } else {
        PermissionDecision::deny(PermissionReason::McpPolicyExcluded)
    }
}

/// Build the allowed-tools view for one user over the given catalogs.
///
/// Deterministic: MCPs arrive in configuration order, tools in catalog
/// order, and the same inputs always yield an identical view.
pub fn resolve_view(
    snapshot: &ConfigSnapshot,
    catalogs: &[McpCatalog],
    user_id: &str,
) -> AllowedToolsView {
    let mut tools: Vec<ToolDescriptor> = Vec::new();
    for catalog in catalogs {
        for tool in &catalog.tools {
            let decision = decide(snapshot, user_id, &catalog.mcp, &tool.name, true);
            if decision.allowed && !tools.iter().any(|t| t == tool) {
                tools.push(tool.clone());
            }
        }
    }
    AllowedToolsView::new(tools)
}

struct CacheEntry {
    profile: UserProfile,
    view: AllowedToolsView,
    computed_at: Instant,
}

/// Caching front over [`resolve_view`].
pub struct PermissionResolver {
    ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
    /// Per-user compute guards: one resolution in flight per key.
    flights: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PermissionResolver {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Mutex::new(HashMap::new()),
            flights: Mutex::new(HashMap::new()),
        }
    }

    /// The view and profile for one user, computed on miss.
    pub async fn allowed_view(
        &self,
        snapshot: &ConfigSnapshot,
        catalogs: &[McpCatalog],
        user_id: &str,
    ) -> (UserProfile, AllowedToolsView) {
        let flight = {
            let mut flights = self.flights.lock().await;
            Arc::clone(
                flights
                    .entry(user_id.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _guard = flight.lock().await;

        if let Some(entry) = self.cache.lock().await.get(user_id) {
            if entry.computed_at.elapsed() < self.ttl {
                debug!(user = %user_id, "permission cache hit");
                return (entry.profile.clone(), entry.view.clone());
            }
        }

        let profile = resolve_profile(snapshot, user_id);
        let view = resolve_view(snapshot, catalogs, user_id);
        debug!(
            user = %user_id,
            role = %profile.role,
            tools = view.len(),
            "resolved allowed-tools view"
        );

        self.cache.lock().await.insert(
            user_id.to_string(),
            CacheEntry {
                profile: profile.clone(),
                view: view.clone(),
                computed_at: Instant::now(),
            },
        );
        (profile, view)
    }

    /// Drop one user's cached view, or all of them.
    pub async fn invalidate(&self, user_id: Option<&str>) {
        let mut cache = self.cache.lock().await;
        match user_id {
            Some(user) => {
                cache.remove(user);
            }
            None => cache.clear(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_types::config::*;
    use switchboard_types::messages::McpHealth;

    fn descriptor(name: &str, enabled: bool, policy: ToolPolicy) -> McpDescriptor {
        McpDescriptor {
            name: name.to_string(),
            endpoint: McpEndpoint::Http {
                url: format!("http://localhost/{name}"),
            },
            enabled,
            auth_token: None,
            timeout_secs: 30,
            tool_policy: policy,
            retry: None,
        }
    }

    fn tool(mcp: &str, name: &str) -> ToolDescriptor {
        ToolDescriptor {
            name: name.to_string(),
            description: format!("{name} on {mcp}"),
            input_schema: serde_json::json!({"type": "object"}),
            mcp: mcp.to_string(),
        }
    }

    fn catalog(mcp: &str, names: &[&str]) -> McpCatalog {
        McpCatalog {
            mcp: mcp.to_string(),
            health: McpHealth::Healthy,
            tools: names.iter().map(|n| tool(mcp, n)).collect(),
        }
    }

    /// alice is a dba with full role access; contractor@ext has a custom
    /// override limited to two database tools.
    fn snapshot() -> ConfigSnapshot {
        let mut roles = HashMap::new();
        roles.insert(
            "dba".to_string(),
            RoleConfig {
                requests_per_hour: RateCeiling::Limited(200),
                allowed_mcps: McpAccess::All,
            },
        );
        roles.insert(
            "contractor".to_string(),
            RoleConfig {
                requests_per_hour: RateCeiling::Limited(20),
                allowed_mcps: McpAccess::Named(vec!["database_mcp".to_string()]),
            },
        );
        roles.insert(
            "read_only".to_string(),
            RoleConfig {
                requests_per_hour: RateCeiling::Limited(30),
                allowed_mcps: McpAccess::Named(vec![]),
            },
        );

        let mut contractor_overrides = HashMap::new();
        contractor_overrides.insert(
            "database_mcp".to_string(),
            McpOverride {
                mode: OverrideMode::Custom,
                tools: vec![
                    "list_available_databases".to_string(),
                    "get_database_health".to_string(),
                ],
                deny: vec![],
            },
        );

        ConfigSnapshot {
            mcps: McpRegistryConfig {
                mcps: vec![
                    descriptor("database_mcp", true, ToolPolicy::default()),
                    descriptor(
                        "github_mcp",
                        true,
                        ToolPolicy {
                            mode: ToolPolicyMode::AllowAllExcept,
                            tools: vec!["delete_*".to_string()],
                        },
                    ),
                    descriptor("legacy_mcp", false, ToolPolicy::default()),
                ],
                retry: RetryConfig::default(),
                schema_cache_ttl_secs: 300,
            },
            users: UserRegistryConfig {
                users: vec![
                    UserEntry {
                        email: "alice@x".to_string(),
                        name: Some("Alice".to_string()),
                        role: "dba".to_string(),
                        mcp_permissions: HashMap::new(),
                    },
                    UserEntry {
                        email: "contractor@ext".to_string(),
                        name: None,
                        role: "contractor".to_string(),
                        mcp_permissions: contractor_overrides,
                    },
                ],
                roles,
                default_user: DefaultUserConfig {
                    role: "read_only".to_string(),
                    mcp_permissions: HashMap::new(),
                },
                auto_provisioning: true,
            },
            ..Default::default()
        }
    }

    fn catalogs() -> Vec<McpCatalog> {
        vec![
            catalog(
                "database_mcp",
                &[
                    "list_available_databases",
                    "get_database_health",
                    "compare_oracle_query_plans",
                ],
            ),
            catalog("github_mcp", &["search_repos", "delete_repo"]),
        ]
    }

    #[test]
    fn role_default_allows_everything_for_dba() {
        let snap = snapshot();
        let view = resolve_view(&snap, &catalogs(), "alice@x");
        // All database tools, plus github minus the policy-excluded delete.
        assert_eq!(view.len(), 4);
        assert!(view.contains("database_mcp__compare_oracle_query_plans"));
        assert!(view.contains("github_mcp__search_repos"));
        assert!(!view.contains("github_mcp__delete_repo"));
    }

    #[test]
    fn custom_override_limits_contractor() {
        let snap = snapshot();
        let view = resolve_view(&snap, &catalogs(), "contractor@ext");
        assert_eq!(view.len(), 2);
        assert!(view.contains("database_mcp__list_available_databases"));
        assert!(view.contains("database_mcp__get_database_health"));
        assert!(!view.contains("database_mcp__compare_oracle_query_plans"));
        // Role MCP set excludes github entirely.
        assert!(!view.contains("github_mcp__search_repos"));
    }

    #[test]
    fn decision_reasons() {
        let snap = snapshot();

        let d = decide(&snap, "alice@x", "legacy_mcp", "anything", true);
        assert!(!d.allowed);
        assert_eq!(d.reason, PermissionReason::McpDisabled);

        let d = decide(&snap, "alice@x", "github_mcp", "delete_repo", true);
        assert!(!d.allowed);
        assert_eq!(d.reason, PermissionReason::McpPolicyExcluded);

        let d = decide(
            &snap,
            "contractor@ext",
            "database_mcp",
            "compare_oracle_query_plans",
            true,
        );
        assert!(!d.allowed);
        assert_eq!(d.reason, PermissionReason::UserPolicyExcluded);

        let d = decide(&snap, "contractor@ext", "github_mcp", "search_repos", true);
        assert!(!d.allowed);
        assert_eq!(d.reason, PermissionReason::RoleDefault);

        let d = decide(&snap, "alice@x", "database_mcp", "ghost_tool", false);
        assert!(!d.allowed);
        assert_eq!(d.reason, PermissionReason::UnknownTool);

        let d = decide(&snap, "alice@x", "database_mcp", "get_database_health", true);
        assert!(d.allowed);
        assert_eq!(d.reason, PermissionReason::RoleDefault);

        let d = decide(
            &snap,
            "contractor@ext",
            "database_mcp",
            "get_database_health",
            true,
        );
        assert!(d.allowed);
        assert_eq!(d.reason, PermissionReason::UserOverride);
    }

    #[test]
    fn deny_patterns_subtract_from_custom_allow() {
        let mut snap = snapshot();
        let over = snap.users.users[1]
            .mcp_permissions
            .get_mut("database_mcp")
            .unwrap();
        over.tools = vec!["get_*".to_string()];
        over.deny = vec!["get_database_health".to_string()];

        let d = decide(
            &snap,
            "contractor@ext",
            "database_mcp",
            "get_database_health",
            true,
        );
        assert!(!d.allowed);
        assert_eq!(d.reason, PermissionReason::UserPolicyExcluded);
    }

    #[test]
    fn unknown_user_falls_back_to_default_principal() {
        let snap = snapshot();
        let profile = resolve_profile(&snap, "stranger@nowhere");
        assert!(profile.is_default);
        assert_eq!(profile.role, "read_only");

        // read_only's MCP set is empty, so the view is too.
        let view = resolve_view(&snap, &catalogs(), "stranger@nowhere");
        assert!(view.is_empty());
    }

    #[test]
    fn resolution_is_idempotent() {
        let snap = snapshot();
        let cats = catalogs();
        let first = resolve_view(&snap, &cats, "alice@x");
        let second = resolve_view(&snap, &cats, "alice@x");
        assert_eq!(first, second);

        let names_a: Vec<String> = first.tools().iter().map(|t| t.qualified_name()).collect();
        let names_b: Vec<String> = second.tools().iter().map(|t| t.qualified_name()).collect();
        assert_eq!(names_a, names_b, "ordering must be stable");
    }

    #[test]
    fn view_preserves_config_and_catalog_order() {
        let snap = snapshot();
        let view = resolve_view(&snap, &catalogs(), "alice@x");
        let names: Vec<String> = view.tools().iter().map(|t| t.qualified_name()).collect();
        assert_eq!(
            names,
            vec![
                "database_mcp__list_available_databases",
                "database_mcp__get_database_health",
                "database_mcp__compare_oracle_query_plans",
                "github_mcp__search_repos",
            ]
        );
    }

    #[tokio::test]
    async fn cache_serves_within_ttl() {
        let snap = snapshot();
        let cats = catalogs();
        let resolver = PermissionResolver::new(Duration::from_secs(300));

        let (profile, view) = resolver.allowed_view(&snap, &cats, "alice@x").await;
        assert_eq!(profile.role, "dba");

        // A snapshot change without invalidation still serves the cached
        // view; the cache is an optimization with a short TTL.
        let mut altered = snap.clone();
        altered.mcps.mcps[0].enabled = false;
        let (_, cached) = resolver.allowed_view(&altered, &cats, "alice@x").await;
        assert_eq!(cached, view);

        resolver.invalidate(None).await;
        let (_, fresh) = resolver.allowed_view(&altered, &cats, "alice@x").await;
        assert_ne!(fresh, view);
    }

    #[tokio::test]
    async fn zero_ttl_recomputes() {
        let snap = snapshot();
        let cats = catalogs();
        let resolver = PermissionResolver::new(Duration::from_secs(0));

        resolver.allowed_view(&snap, &cats, "alice@x").await;
        let mut altered = snap.clone();
        altered.mcps.mcps[1].enabled = false;
        let (_, view) = resolver.allowed_view(&altered, &cats, "alice@x").await;
        assert!(!view.contains("github_mcp__search_repos"));
    }
}
