//! Audit record stores.
//!
//! Two backends:
//! - [`InMemoryAuditStore`]: a `Vec` behind `RwLock`, for tests and dev.
//! - [`PostgresAuditStore`]: the durable store, one row per request.
//!
//! Records are append-only; neither backend exposes update or delete.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use switchboard_types::errors::SwitchboardError;
use switchboard_types::messages::{AuditRecord, RequestStatus};
use switchboard_types::traits::AuditStore;

/// DDL for the audit table and its query indexes.
pub const CREATE_AUDIT_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS audit_records (
    id UUID PRIMARY KEY,
    user_id TEXT NOT NULL,
    message TEXT NOT NULL,
    iterations INTEGER NOT NULL,
    tool_calls_count INTEGER NOT NULL,
    tools_used JSONB NOT NULL DEFAULT '[]',
    mcps_accessed JSONB NOT NULL DEFAULT '[]',
    tokens_input BIGINT NOT NULL,
    tokens_output BIGINT NOT NULL,
    tokens_cached BIGINT NOT NULL,
    cost_estimate DOUBLE PRECISION NOT NULL,
    status TEXT NOT NULL,
    warning TEXT,
    duration_ms BIGINT NOT NULL,
    source_tag TEXT,
    conversation_ref TEXT,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_records_user_id ON audit_records (user_id);
CREATE INDEX IF NOT EXISTS idx_audit_records_created_at ON audit_records (created_at);
CREATE INDEX IF NOT EXISTS idx_audit_records_status ON audit_records (status);
"#;

/// Create the audit table and indexes if they do not exist.
pub async fn run_migrations(pool: &PgPool) -> Result<(), SwitchboardError> {
    sqlx::raw_sql(CREATE_AUDIT_RECORDS_TABLE)
        .execute(pool)
        .await
        .map_err(|e| SwitchboardError::Database(format!("audit migration failed: {e}")))?;
    info!("audit_records table and indexes ready");
    Ok(())
}

// ============================================================
// InMemoryAuditStore
// ============================================================

/// In-memory store for tests and development.
#[derive(Clone, Default)]
pub struct InMemoryAuditStore {
    records: Arc<RwLock<Vec<AuditRecord>>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.records.read().await.len()
    }
}

#[async_trait]
impl AuditStore for InMemoryAuditStore {
    async fn insert(&self, record: &AuditRecord) -> Result<(), SwitchboardError> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>, SwitchboardError> {
        let records = self.records.read().await;
        Ok(records.iter().rev().take(limit).cloned().collect())
    }
}

// ============================================================
// PostgresAuditStore
// ============================================================

/// Postgres-backed durable store.
pub struct PostgresAuditStore {
    pool: PgPool,
}

impl PostgresAuditStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run migrations.
    pub async fn connect(database_url: &str) -> Result<Self, SwitchboardError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| SwitchboardError::Database(format!("audit DB connect failed: {e}")))?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }
}

fn status_from_str(s: &str) -> RequestStatus {
    match s {
        "success" => RequestStatus::Success,
        "warning" => RequestStatus::Warning,
        _ => RequestStatus::Error,
    }
}

#[async_trait]
impl AuditStore for PostgresAuditStore {
    async fn insert(&self, record: &AuditRecord) -> Result<(), SwitchboardError> {
        sqlx::query(
            r#"
            INSERT INTO audit_records (
                id, user_id, message, iterations, tool_calls_count,
                tools_used, mcps_accessed, tokens_input, tokens_output,
                tokens_cached, cost_estimate, status, warning, duration_ms,
                source_tag, conversation_ref, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
            "#,
        )
        .bind(record.id)
        .bind(&record.user_id)
        .bind(&record.message)
        .bind(record.iterations as i32)
        .bind(record.tool_calls_count as i32)
        .bind(serde_json::to_value(&record.tools_used)?)
        .bind(serde_json::to_value(&record.mcps_accessed)?)
        .bind(record.tokens_input as i64)
        .bind(record.tokens_output as i64)
        .bind(record.tokens_cached as i64)
        .bind(record.cost_estimate)
        .bind(record.status.as_str())
        .bind(&record.warning)
        .bind(record.duration_ms as i64)
        .bind(&record.source_tag)
        .bind(&record.conversation_ref)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| SwitchboardError::Database(format!("audit insert failed: {e}")))?;
        Ok(())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<AuditRecord>, SwitchboardError> {
        let rows = sqlx::query(
            "SELECT * FROM audit_records ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| SwitchboardError::Database(format!("audit query failed: {e}")))?;

        rows.iter()
            .map(|row| {
                Ok(AuditRecord {
                    id: row
                        .try_get("id")
                        .map_err(|e| SwitchboardError::Database(e.to_string()))?,
                    user_id: row
                        .try_get("user_id")
                        .map_err(|e| SwitchboardError::Database(e.to_string()))?,
                    message: row
                        .try_get("message")
                        .map_err(|e| SwitchboardError::Database(e.to_string()))?,
                    iterations: row
                        .try_get::<i32, _>("iterations")
                        .map_err(|e| SwitchboardError::Database(e.to_string()))?
                        as u32,
                    tool_calls_count: row
                        .try_get::<i32, _>("tool_calls_count")
                        .map_err(|e| SwitchboardError::Database(e.to_string()))?
                        as u32,
                    tools_used: serde_json::from_value(
                        row.try_get("tools_used")
                            .map_err(|e| SwitchboardError::Database(e.to_string()))?,
                    )?,
                    mcps_accessed: serde_json::from_value(
                        row.try_get("mcps_accessed")
                            .map_err(|e| SwitchboardError::Database(e.to_string()))?,
                    )?,
                    tokens_input: row
                        .try_get::<i64, _>("tokens_input")
                        .map_err(|e| SwitchboardError::Database(e.to_string()))?
                        as u64,
                    tokens_output: row
                        .try_get::<i64, _>("tokens_output")
                        .map_err(|e| SwitchboardError::Database(e.to_string()))?
                        as u64,
                    tokens_cached: row
                        .try_get::<i64, _>("tokens_cached")
                        .map_err(|e| SwitchboardError::Database(e.to_string()))?
                        as u64,
                    cost_estimate: row
                        .try_get("cost_estimate")
                        .map_err(|e| SwitchboardError::Database(e.to_string()))?,
                    status: status_from_str(
                        row.try_get::<String, _>("status")
                            .map_err(|e| SwitchboardError::Database(e.to_string()))?
                            .as_str(),
                    ),
                    warning: row
                        .try_get("warning")
                        .map_err(|e| SwitchboardError::Database(e.to_string()))?,
                    duration_ms: row
                        .try_get::<i64, _>("duration_ms")
                        .map_err(|e| SwitchboardError::Database(e.to_string()))?
                        as u64,
                    source_tag: row
                        .try_get("source_tag")
                        .map_err(|e| SwitchboardError::Database(e.to_string()))?,
                    conversation_ref: row
                        .try_get("conversation_ref")
                        .map_err(|e| SwitchboardError::Database(e.to_string()))?,
                    created_at: row
                        .try_get("created_at")
                        .map_err(|e| SwitchboardError::Database(e.to_string()))?,
                })
            })
            .collect()
    }
}
