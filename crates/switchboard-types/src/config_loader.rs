/// Config directory loader with validation and hot reload.
///
/// Reads `mcps.yaml`, `users.yaml`, and `bridge.yaml` from a directory,
/// validates the combined snapshot, watches for file changes via `notify`,
/// and broadcasts new snapshots over `tokio::sync::watch`. A reload that
/// fails to parse or validate keeps the previous snapshot in place.
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::watch;

use crate::config::*;
use crate::errors::SwitchboardError;

/// Loads, validates, and watches the bridge configuration.
///
/// Expected directory structure:
/// ```text
/// config/
/// ├── mcps.yaml     # MCP descriptors, retry defaults, cache TTL
/// ├── users.yaml    # roles, users, default user, auto-provisioning
/// └── bridge.yaml   # LM settings, loop limits (optional)
/// ```
#[derive(Debug)]
pub struct ConfigLoader {
    config_dir: PathBuf,
    tx: watch::Sender<ConfigSnapshot>,
    /// Kept alive to maintain the file watch.
    _watcher: Option<RecommendedWatcher>,
}

impl ConfigLoader {
    /// Load the directory, validate, and return the loader plus a receiver
    /// for snapshot updates. Call [`ConfigLoader::watch`] to enable hot
    /// reload.
    pub fn load(
        config_dir: &Path,
    ) -> Result<(Self, watch::Receiver<ConfigSnapshot>), SwitchboardError> {
        let snapshot = Self::load_all(config_dir)?;
        Self::validate(&snapshot)?;

        let (tx, rx) = watch::channel(snapshot);

        Ok((
            Self {
                config_dir: config_dir.to_path_buf(),
                tx,
                _watcher: None,
            },
            rx,
        ))
    }

    /// Start watching the config directory.
    ///
    /// Valid changes are broadcast to all receivers; invalid ones are logged
    /// and dropped. In-flight requests are unaffected either way — they hold
    /// the snapshot they started with.
    pub fn watch(&mut self) -> Result<(), SwitchboardError> {
        let config_dir = self.config_dir.clone();
        let tx = self.tx.clone();

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        match Self::load_all(&config_dir) {
                            Ok(snapshot) => match Self::validate(&snapshot) {
                                Ok(()) => {
                                    let _ = tx.send(snapshot);
                                    tracing::info!("configuration reloaded");
                                }
                                Err(e) => {
                                    tracing::warn!(error = %e, "config validation failed after file change, keeping previous snapshot");
                                }
                            },
                            Err(e) => {
                                tracing::warn!(error = %e, "config load failed after file change, keeping previous snapshot");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "config file watcher error");
                }
            }
        })
        .map_err(|e| SwitchboardError::Config(format!("failed to create file watcher: {e}")))?;

        watcher
            .watch(&self.config_dir, RecursiveMode::NonRecursive)
            .map_err(|e| SwitchboardError::Config(format!("failed to watch config dir: {e}")))?;

        self._watcher = Some(watcher);
        tracing::info!(dir = %self.config_dir.display(), "watching config directory");
        Ok(())
    }

    /// Load all config files into one snapshot.
    pub fn load_all(config_dir: &Path) -> Result<ConfigSnapshot, SwitchboardError> {
        let mcps: McpRegistryConfig = Self::load_file(config_dir, "mcps.yaml")?;
        let users: UserRegistryConfig = Self::load_file(config_dir, "users.yaml")?;

        // bridge.yaml is optional; defaults cover a dev setup.
        let bridge_path = config_dir.join("bridge.yaml");
        let (llm, limits) = if bridge_path.exists() {
            let bridge: BridgeFile = Self::load_file(config_dir, "bridge.yaml")?;
            (bridge.llm, bridge.limits)
        } else {
            (LlmConfig::default(), BridgeLimits::default())
        };

        Ok(ConfigSnapshot {
            mcps,
            users,
            llm,
            limits,
        })
    }

    fn load_file<T: serde::de::DeserializeOwned>(
        config_dir: &Path,
        file: &str,
    ) -> Result<T, SwitchboardError> {
        let path = config_dir.join(file);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            SwitchboardError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&content).map_err(|e| {
            SwitchboardError::Config(format!("failed to parse {}: {e}", path.display()))
        })
    }

    /// Reject snapshots that would misbehave at runtime.
    pub fn validate(snapshot: &ConfigSnapshot) -> Result<(), SwitchboardError> {
        let mut seen = std::collections::HashSet::new();
        for mcp in &snapshot.mcps.mcps {
            if mcp.name.is_empty() {
                return Err(SwitchboardError::Config(
                    "MCP descriptor with empty name".to_string(),
                ));
            }
            if mcp.name.contains("__") || mcp.name.contains('.') {
                return Err(SwitchboardError::Config(format!(
                    "MCP name '{}' may not contain '__' or '.'",
                    mcp.name
                )));
            }
            if !seen.insert(&mcp.name) {
                return Err(SwitchboardError::Config(format!(
                    "duplicate MCP name '{}'",
                    mcp.name
                )));
            }
            if let McpEndpoint::Http { url } = &mcp.endpoint {
                if url.is_empty() {
                    return Err(SwitchboardError::Config(format!(
                        "MCP '{}' has an empty url",
                        mcp.name
                    )));
                }
            }
        }

        for user in &snapshot.users.users {
            if !snapshot.users.roles.contains_key(&user.role) {
                return Err(SwitchboardError::Config(format!(
                    "user '{}' references unknown role '{}'",
                    user.email, user.role
                )));
            }
        }
        if !snapshot
            .users
            .roles
            .contains_key(&snapshot.users.default_user.role)
        {
            return Err(SwitchboardError::Config(format!(
                "default_user references unknown role '{}'",
                snapshot.users.default_user.role
            )));
        }

        if snapshot.limits.max_iterations == 0 {
            return Err(SwitchboardError::Config(
                "max_iterations must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// On-disk shape of `bridge.yaml`.
#[derive(Debug, Default, serde::Deserialize)]
struct BridgeFile {
    #[serde(default)]
    llm: LlmConfig,
    #[serde(default)]
    limits: BridgeLimits,
}

#[cfg(test)]
mod tests {
    use super::*;

    const MCPS_YAML: &str = r#"
mcps:
  - name: database_mcp
    transport: http
    url: http://localhost:9100
  - name: github_mcp
    transport: http
    url: http://localhost:9200
    enabled: false
"#;

    const USERS_YAML: &str = r#"
users:
  - email: alice@x
    role: dba
roles:
  dba:
    requests_per_hour: 200
    allowed_mcps: "*"
  read_only:
    requests_per_hour: 30
    allowed_mcps: []
default_user:
  role: read_only
"#;

    fn write_config(dir: &Path, mcps: &str, users: &str) {
        std::fs::write(dir.join("mcps.yaml"), mcps).unwrap();
        std::fs::write(dir.join("users.yaml"), users).unwrap();
    }

    #[test]
    fn loads_valid_directory() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), MCPS_YAML, USERS_YAML);

        let (_loader, rx) = ConfigLoader::load(dir.path()).unwrap();
        let snapshot = rx.borrow();
        assert_eq!(snapshot.mcps.mcps.len(), 2);
        assert_eq!(snapshot.enabled_mcps().count(), 1);
        assert_eq!(snapshot.user("alice@x").unwrap().role, "dba");
        assert_eq!(snapshot.limits.max_iterations, 10);
    }

    #[test]
    fn rejects_unknown_role_reference() {
        let dir = tempfile::tempdir().unwrap();
        let users = r#"
users:
  - email: bob@x
    role: wizard
roles:
  read_only:
    requests_per_hour: 30
default_user:
  role: read_only
"#;
        write_config(dir.path(), MCPS_YAML, users);

        let err = ConfigLoader::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("unknown role 'wizard'"));
    }

    #[test]
    fn rejects_duplicate_mcp_names() {
        let dir = tempfile::tempdir().unwrap();
        let mcps = r#"
mcps:
  - name: database_mcp
    transport: http
    url: http://localhost:9100
  - name: database_mcp
    transport: http
    url: http://localhost:9101
"#;
        write_config(dir.path(), mcps, USERS_YAML);

        let err = ConfigLoader::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("duplicate MCP name"));
    }

    #[test]
    fn rejects_separator_in_mcp_name() {
        let dir = tempfile::tempdir().unwrap();
        let mcps = r#"
mcps:
  - name: data__base
    transport: http
    url: http://localhost:9100
"#;
        write_config(dir.path(), mcps, USERS_YAML);

        assert!(ConfigLoader::load(dir.path()).is_err());
    }

    #[test]
    fn missing_bridge_yaml_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), MCPS_YAML, USERS_YAML);

        let (_loader, rx) = ConfigLoader::load(dir.path()).unwrap();
        let snapshot = rx.borrow();
        assert_eq!(snapshot.llm.max_tokens, 4096);
        assert_eq!(snapshot.limits.request_timeout_secs, 120);
    }
}
