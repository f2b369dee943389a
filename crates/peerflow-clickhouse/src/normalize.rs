//! Batch coordinator
//!
//! The single entry point for one flow invocation. Sequences stage-load →
//! plan → execute → pointer advance, and is safe to re-invoke after a
//! crash: every step before the pointer write is idempotent (stage loads
//! are de-duplicated per uid by the planner, and re-inserted images
//! collapse by version under the replacing engine), so the pointer write
//! is the linearization point.
//!
//! At most one invocation runs per flow at a time; the workflow
//! orchestrator enforces this and the engine assumes it.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use peerflow_catalog::{Alerter, Catalog};
use peerflow_core::{
    NormalizeError, NormalizeSettings, Result, TableMapping, TableSchema,
};

use crate::client::{Destination, DestinationClient};
use crate::ddl::{setup_normalized_table, SetupTableRequest};
use crate::executor::execute_plans;
use crate::planner::{build_table_plans, distinct_tables_sql, NormalizePlan, PlannerContext};
use crate::raw_table::{create_raw_table_sql, prune_raw_table_sql};
use crate::stage::{load_stages, AvroStage};

/// One invocation's inputs, supplied by the orchestrator.
#[derive(Debug, Clone)]
pub struct NormalizeRequest {
    pub flow_job_name: String,
    /// The flow's `last_sync_batch_id` observed by the orchestrator.
    pub sync_batch_id: i64,
    pub table_mappings: Vec<TableMapping>,
    /// Source schemas keyed by *destination* table name, exclusions
    /// already applied (see `build_processed_schema_mapping`).
    pub table_schema_mapping: HashMap<String, TableSchema>,
    /// Dynamic settings, read once at invocation start.
    pub env: HashMap<String, String>,
}

/// The batch window this invocation materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeResponse {
    pub start_batch_id: i64,
    pub end_batch_id: i64,
}

/// Normalization engine for one destination.
pub struct NormalizeEngine<D: Destination, C: Catalog> {
    destination: Arc<D>,
    catalog: Arc<C>,
    stage: AvroStage,
    alerter: Option<Alerter<C>>,
}

impl<D: Destination, C: Catalog> NormalizeEngine<D, C> {
    pub fn new(destination: Arc<D>, catalog: Arc<C>, stage: AvroStage) -> Self {
        Self {
            destination,
            catalog,
            stage,
            alerter: None,
        }
    }

    pub fn with_alerter(mut self, alerter: Alerter<C>) -> Self {
        self.alerter = Some(alerter);
        self
    }

    /// Idempotent creation of the flow's raw change-log table.
    pub async fn setup_raw_table(&self, flow_job_name: &str) -> Result<()> {
        self.destination
            .client()
            .execute(&create_raw_table_sql(flow_job_name))
            .await
    }

    /// Idempotent creation of one normalized destination table.
    ///
    /// Returns whether the table already existed.
    pub async fn setup_normalized_table(&self, req: &SetupTableRequest) -> Result<bool> {
        setup_normalized_table(self.destination.as_ref(), req).await
    }

    /// Run one coordinator invocation.
    ///
    /// On success `last_normalize_batch_id` equals the `sync_batch_id`
    /// observed at start; on any failure the pointer is untouched and the
    /// next invocation redoes the same window.
    pub async fn normalize_records(
        &self,
        req: &NormalizeRequest,
        cancel: &CancellationToken,
    ) -> Result<NormalizeResponse> {
        let result = self.normalize_inner(req, cancel).await;
        if let Err(e) = &result {
            counter!("peerflow.normalize.failures").increment(1);
            if let Some(alerter) = &self.alerter {
                if let Err(alert_err) = alerter.report_error(&req.flow_job_name, e).await {
                    warn!(flow = %req.flow_job_name, "failed to record alert: {alert_err}");
                }
            }
        }
        result
    }

    async fn normalize_inner(
        &self,
        req: &NormalizeRequest,
        cancel: &CancellationToken,
    ) -> Result<NormalizeResponse> {
        let flow = req.flow_job_name.as_str();
        let norm_batch_id = self.catalog.last_normalize_batch_id(flow).await?;

        // Normalize has caught up with sync; nothing to do until more
        // batches land.
        if norm_batch_id >= req.sync_batch_id {
            return Ok(NormalizeResponse {
                start_batch_id: norm_batch_id,
                end_batch_id: req.sync_batch_id,
            });
        }

        load_stages(
            self.destination.as_ref(),
            &self.stage,
            flow,
            norm_batch_id,
            req.sync_batch_id,
            cancel,
        )
        .await?;

        let settings = NormalizeSettings::from_env(&req.env)?;
        let ctx = PlannerContext {
            flow_job_name: flow,
            norm_batch_id,
            sync_batch_id: req.sync_batch_id,
            settings: &settings,
        };

        let tables = self.distinct_tables_in_window(req, &ctx).await?;
        let plans = self.build_plans(req, &ctx, &tables)?;

        if !plans.is_empty() {
            let parallelism = settings.parallel_normalize.min(tables.len() as u32).max(1);
            info!(
                flow,
                start_batch_id = norm_batch_id,
                end_batch_id = req.sync_batch_id,
                connections = parallelism,
                tables = tables.len(),
                plans = plans.len(),
                "normalizing batch window"
            );
            execute_plans(self.destination.clone(), plans, parallelism, cancel).await?;
        }

        if cancel.is_cancelled() {
            return Err(NormalizeError::Cancelled);
        }

        // Linearization point: all writes for the window are durable.
        self.catalog
            .update_normalize_batch_id(flow, req.sync_batch_id)
            .await?;
        counter!("peerflow.normalize.batches").increment(1);

        if settings.raw_ttl_batches > 0 {
            // Best effort; retention never fails an otherwise good run.
            let prune = prune_raw_table_sql(flow, req.sync_batch_id, settings.raw_ttl_batches);
            if let Err(e) = self.destination.client().execute(&prune).await {
                warn!(flow, "failed to prune raw table: {e}");
            }
        }

        Ok(NormalizeResponse {
            start_batch_id: norm_batch_id + 1,
            end_batch_id: req.sync_batch_id,
        })
    }

    /// Destination tables present in the raw window that the mapping
    /// knows about. Tables added to the source mid-flight are skipped
    /// until the mapping catches up.
    async fn distinct_tables_in_window(
        &self,
        req: &NormalizeRequest,
        ctx: &PlannerContext<'_>,
    ) -> Result<Vec<String>> {
        let all = self
            .destination
            .client()
            .query_strings(&distinct_tables_sql(ctx))
            .await?;
        let mut known = Vec::with_capacity(all.len());
        for table in all {
            if req.table_schema_mapping.contains_key(&table) {
                known.push(table);
            } else {
                // Classified but non-fatal: the mapping was changed
                // mid-flight and catches up on a later invocation.
                let skipped = NormalizeError::unknown_table(table.as_str());
                warn!(
                    flow = %req.flow_job_name,
                    class = %skipped.error_class(),
                    "skipping: {skipped}"
                );
            }
        }
        Ok(known)
    }

    /// Build plans for every table in the window. A table whose mapping
    /// no longer projects (schema drift) is skipped; the rest proceed.
    fn build_plans(
        &self,
        req: &NormalizeRequest,
        ctx: &PlannerContext<'_>,
        tables: &[String],
    ) -> Result<Vec<NormalizePlan>> {
        let mut plans = Vec::new();
        for table in tables {
            let schema = &req.table_schema_mapping[table];
            let mapping = req
                .table_mappings
                .iter()
                .find(|m| &m.destination_table_identifier == table);
            match build_table_plans(ctx, table, schema, mapping) {
                Ok(mut table_plans) => plans.append(&mut table_plans),
                Err(e @ NormalizeError::Plan { .. }) => {
                    warn!(flow = %req.flow_job_name, table = %table, "skipping table: {e}");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(plans)
    }
}
