//! Catalog store implementations
//!
//! [`PostgresCatalog`] is the production store; [`MemoryCatalog`] backs
//! unit and scenario tests without a running database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use peerflow_core::{NormalizeError, Result, TableSchema};

/// Persistent flow state.
///
/// Every method is a single round trip; callers compose them, and the batch
/// coordinator alone is allowed to move `last_normalize_batch_id`.
#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    async fn last_sync_batch_id(&self, flow_job_name: &str) -> Result<i64>;

    async fn last_normalize_batch_id(&self, flow_job_name: &str) -> Result<i64>;

    async fn update_sync_batch_id(&self, flow_job_name: &str, batch_id: i64) -> Result<()>;

    async fn update_normalize_batch_id(&self, flow_job_name: &str, batch_id: i64) -> Result<()>;

    async fn save_schema_snapshot(
        &self,
        flow_job_name: &str,
        batch_id: i64,
        snapshot: &HashMap<String, TableSchema>,
    ) -> Result<()>;

    async fn load_schema_snapshot(
        &self,
        flow_job_name: &str,
        batch_id: i64,
    ) -> Result<Option<HashMap<String, TableSchema>>>;

    async fn record_alert(
        &self,
        alert_key: &str,
        alert_config_id: i64,
        message: &str,
    ) -> Result<()>;

    async fn last_alert_time(&self, alert_key: &str) -> Result<Option<DateTime<Utc>>>;
}

// ============================================================================
// PostgreSQL catalog
// ============================================================================

/// PostgreSQL-backed catalog.
///
/// Table creation is idempotent; `new` ensures the schema exists so a fresh
/// deployment needs no migration step.
pub struct PostgresCatalog {
    client: Arc<tokio_postgres::Client>,
}

impl PostgresCatalog {
    pub async fn new(client: Arc<tokio_postgres::Client>) -> Result<Self> {
        let catalog = Self { client };
        catalog.ensure_tables().await?;
        Ok(catalog)
    }

    async fn ensure_tables(&self) -> Result<()> {
        const DDL: &str = r#"
            CREATE TABLE IF NOT EXISTS flow_state (
                flow_job_name TEXT PRIMARY KEY,
                last_sync_batch_id BIGINT NOT NULL DEFAULT 0,
                last_normalize_batch_id BIGINT NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS schema_snapshots (
                flow_job_name TEXT NOT NULL,
                batch_id BIGINT NOT NULL,
                payload JSONB NOT NULL,
                PRIMARY KEY (flow_job_name, batch_id)
            );
            CREATE TABLE IF NOT EXISTS alerts (
                id BIGSERIAL PRIMARY KEY,
                alert_key TEXT NOT NULL,
                alert_config_id BIGINT NOT NULL DEFAULT 0,
                created_timestamp TIMESTAMPTZ NOT NULL DEFAULT now(),
                alert_message TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS alerts_key_ts
                ON alerts (alert_key, created_timestamp DESC);
        "#;
        self.client
            .batch_execute(DDL)
            .await
            .map_err(|e| NormalizeError::catalog(format!("failed to ensure catalog tables: {e}")))
    }

    async fn batch_pointer(&self, flow_job_name: &str, column: &str) -> Result<i64> {
        let query = format!("SELECT {column} FROM flow_state WHERE flow_job_name = $1");
        let row = self
            .client
            .query_opt(&query, &[&flow_job_name])
            .await
            .map_err(|e| NormalizeError::catalog(format!("failed to read {column}: {e}")))?;
        Ok(row.map(|r| r.get::<_, i64>(0)).unwrap_or(0))
    }

    async fn set_batch_pointer(
        &self,
        flow_job_name: &str,
        column: &str,
        batch_id: i64,
    ) -> Result<()> {
        let query = format!(
            "INSERT INTO flow_state (flow_job_name, {column}) VALUES ($1, $2) \
             ON CONFLICT (flow_job_name) DO UPDATE SET {column} = EXCLUDED.{column}"
        );
        self.client
            .execute(&query, &[&flow_job_name, &batch_id])
            .await
            .map_err(|e| NormalizeError::catalog(format!("failed to update {column}: {e}")))?;
        debug!(flow = flow_job_name, column, batch_id, "updated batch pointer");
        Ok(())
    }
}

#[async_trait]
impl Catalog for PostgresCatalog {
    async fn last_sync_batch_id(&self, flow_job_name: &str) -> Result<i64> {
        self.batch_pointer(flow_job_name, "last_sync_batch_id").await
    }

    async fn last_normalize_batch_id(&self, flow_job_name: &str) -> Result<i64> {
        self.batch_pointer(flow_job_name, "last_normalize_batch_id")
            .await
    }

    async fn update_sync_batch_id(&self, flow_job_name: &str, batch_id: i64) -> Result<()> {
        self.set_batch_pointer(flow_job_name, "last_sync_batch_id", batch_id)
            .await
    }

    async fn update_normalize_batch_id(&self, flow_job_name: &str, batch_id: i64) -> Result<()> {
        self.set_batch_pointer(flow_job_name, "last_normalize_batch_id", batch_id)
            .await
    }

    async fn save_schema_snapshot(
        &self,
        flow_job_name: &str,
        batch_id: i64,
        snapshot: &HashMap<String, TableSchema>,
    ) -> Result<()> {
        let payload = serde_json::to_value(snapshot)?;
        self.client
            .execute(
                "INSERT INTO schema_snapshots (flow_job_name, batch_id, payload) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (flow_job_name, batch_id) DO UPDATE SET payload = EXCLUDED.payload",
                &[&flow_job_name, &batch_id, &payload],
            )
            .await
            .map_err(|e| NormalizeError::catalog(format!("failed to save schema snapshot: {e}")))?;
        Ok(())
    }

    async fn load_schema_snapshot(
        &self,
        flow_job_name: &str,
        batch_id: i64,
    ) -> Result<Option<HashMap<String, TableSchema>>> {
        let row = self
            .client
            .query_opt(
                "SELECT payload FROM schema_snapshots \
                 WHERE flow_job_name = $1 AND batch_id = $2",
                &[&flow_job_name, &batch_id],
            )
            .await
            .map_err(|e| NormalizeError::catalog(format!("failed to load schema snapshot: {e}")))?;
        match row {
            Some(row) => {
                let payload: serde_json::Value = row.get(0);
                Ok(Some(serde_json::from_value(payload)?))
            }
            None => Ok(None),
        }
    }

    async fn record_alert(
        &self,
        alert_key: &str,
        alert_config_id: i64,
        message: &str,
    ) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO alerts (alert_key, alert_config_id, alert_message) \
                 VALUES ($1, $2, $3)",
                &[&alert_key, &alert_config_id, &message],
            )
            .await
            .map_err(|e| NormalizeError::catalog(format!("failed to record alert: {e}")))?;
        Ok(())
    }

    async fn last_alert_time(&self, alert_key: &str) -> Result<Option<DateTime<Utc>>> {
        let row = self
            .client
            .query_opt(
                "SELECT created_timestamp FROM alerts \
                 WHERE alert_key = $1 ORDER BY created_timestamp DESC LIMIT 1",
                &[&alert_key],
            )
            .await
            .map_err(|e| NormalizeError::catalog(format!("failed to read alert history: {e}")))?;
        Ok(row.map(|r| r.get(0)))
    }
}

// ============================================================================
// In-memory catalog (tests)
// ============================================================================

#[derive(Default)]
struct MemoryState {
    sync_batch: HashMap<String, i64>,
    normalize_batch: HashMap<String, i64>,
    snapshots: HashMap<(String, i64), HashMap<String, TableSchema>>,
    alerts: Vec<(String, i64, String, DateTime<Utc>)>,
}

/// In-memory catalog for tests and local experiments.
#[derive(Default)]
pub struct MemoryCatalog {
    state: RwLock<MemoryState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded alert messages, oldest first.
    pub async fn alert_messages(&self) -> Vec<String> {
        self.state
            .read()
            .await
            .alerts
            .iter()
            .map(|(_, _, msg, _)| msg.clone())
            .collect()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn last_sync_batch_id(&self, flow_job_name: &str) -> Result<i64> {
        Ok(*self
            .state
            .read()
            .await
            .sync_batch
            .get(flow_job_name)
            .unwrap_or(&0))
    }

    async fn last_normalize_batch_id(&self, flow_job_name: &str) -> Result<i64> {
        Ok(*self
            .state
            .read()
            .await
            .normalize_batch
            .get(flow_job_name)
            .unwrap_or(&0))
    }

    async fn update_sync_batch_id(&self, flow_job_name: &str, batch_id: i64) -> Result<()> {
        self.state
            .write()
            .await
            .sync_batch
            .insert(flow_job_name.to_string(), batch_id);
        Ok(())
    }

    async fn update_normalize_batch_id(&self, flow_job_name: &str, batch_id: i64) -> Result<()> {
        self.state
            .write()
            .await
            .normalize_batch
            .insert(flow_job_name.to_string(), batch_id);
        Ok(())
    }

    async fn save_schema_snapshot(
        &self,
        flow_job_name: &str,
        batch_id: i64,
        snapshot: &HashMap<String, TableSchema>,
    ) -> Result<()> {
        self.state
            .write()
            .await
            .snapshots
            .insert((flow_job_name.to_string(), batch_id), snapshot.clone());
        Ok(())
    }

    async fn load_schema_snapshot(
        &self,
        flow_job_name: &str,
        batch_id: i64,
    ) -> Result<Option<HashMap<String, TableSchema>>> {
        Ok(self
            .state
            .read()
            .await
            .snapshots
            .get(&(flow_job_name.to_string(), batch_id))
            .cloned())
    }

    async fn record_alert(
        &self,
        alert_key: &str,
        alert_config_id: i64,
        message: &str,
    ) -> Result<()> {
        self.state.write().await.alerts.push((
            alert_key.to_string(),
            alert_config_id,
            message.to_string(),
            Utc::now(),
        ));
        Ok(())
    }

    async fn last_alert_time(&self, alert_key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .state
            .read()
            .await
            .alerts
            .iter()
            .rev()
            .find(|(key, _, _, _)| key == alert_key)
            .map(|(_, _, _, ts)| *ts))
    }
}
