//! Switchboard daemon.
//!
//! Loads configuration, wires the registry, bridge, and audit recorder
//! together, and runs the background chores: initial and periodic tool
//! discovery, thread-store sweeps, and permission cache invalidation on
//! config reload. The chat/HTTP intake lives in the front-end services;
//! they drive [`Bridge::handle_request`] through this process's library
//! surface.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use switchboard_audit::recorder::DEFAULT_QUEUE_CAPACITY;
use switchboard_audit::{AuditRecorder, InMemoryAuditStore, PostgresAuditStore};
use switchboard_core::llm::AnthropicAdapter;
use switchboard_core::{Bridge, BridgeDeps};
use switchboard_mcp::McpRegistry;
use switchboard_types::config_loader::ConfigLoader;
use switchboard_types::errors::SwitchboardError;
use switchboard_types::traits::AuditStore;

/// Interval for the conversation-thread eviction sweep.
const THREAD_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "daemon failed to start");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), SwitchboardError> {
    let config_dir = PathBuf::from(
        std::env::var("SWITCHBOARD_CONFIG_DIR").unwrap_or_else(|_| "config".to_string()),
    );
    info!(dir = %config_dir.display(), "loading configuration");

    let (mut loader, config_rx) = ConfigLoader::load(&config_dir)?;
    loader.watch()?;

    let snapshot = config_rx.borrow().clone();
    info!(
        mcps = snapshot.mcps.mcps.len(),
        users = snapshot.users.users.len(),
        model = %snapshot.llm.model,
        "configuration loaded"
    );

    // Collaborators.
    let llm = Arc::new(AnthropicAdapter::from_env(snapshot.llm.clone())?);

    let store: Arc<dyn AuditStore> = match std::env::var("SWITCHBOARD_DATABASE_URL") {
        Ok(url) => {
            info!("connecting audit store");
            Arc::new(PostgresAuditStore::connect(&url).await?)
        }
        Err(_) => {
            warn!("SWITCHBOARD_DATABASE_URL not set, audit records stay in memory");
            Arc::new(InMemoryAuditStore::new())
        }
    };
    let (recorder, _audit_worker) = AuditRecorder::spawn(store, DEFAULT_QUEUE_CAPACITY);

    let registry = Arc::new(McpRegistry::new(config_rx.clone()));
    let bridge = Arc::new(Bridge::new(
        config_rx.clone(),
        BridgeDeps {
            llm,
            mcp: registry.clone(),
            audit: Arc::new(recorder),
        },
    ));

    // Initial discovery so the first request sees a warm catalog.
    registry.refresh_all().await;

    // Periodic discovery refresh, paced by the schema cache TTL.
    {
        let registry = registry.clone();
        let ttl = snapshot.mcps.schema_cache_ttl_secs.max(30);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(ttl));
            tick.tick().await; // the immediate first tick; discovery just ran
            loop {
                tick.tick().await;
                registry.refresh_all().await;
            }
        });
    }

    // Thread-store eviction sweep.
    {
        let bridge = bridge.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(THREAD_SWEEP_INTERVAL);
            loop {
                tick.tick().await;
                let removed = bridge.sweep_threads().await;
                if removed > 0 {
                    info!(removed, "swept idle conversation threads");
                }
            }
        });
    }

    // Config reloads invalidate cached permission views; in-flight requests
    // keep the snapshot they started with.
    {
        let bridge = bridge.clone();
        let mut rx = config_rx.clone();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                info!("configuration changed, invalidating permission cache");
                bridge.invalidate_permissions().await;
            }
        });
    }

    info!("switchboard daemon ready");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| SwitchboardError::Internal(format!("signal handler failed: {e}")))?;
    info!("shutting down");
    Ok(())
}
