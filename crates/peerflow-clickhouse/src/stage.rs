//! Avro batch staging
//!
//! The sync stage lands each batch as one Avro object-container file
//! addressed by `(flow_job_name, sync_batch_id)`. The loader replays a
//! window of staged batches into the raw table before planning. Re-loading
//! a batch appends the same rows again; the planner's per-uid de-dup
//! window keeps replays from double-materializing a change.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use apache_avro::{from_value, Codec, Reader, Schema, Writer};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use peerflow_core::{NormalizeError, RawRecord, Result};

use crate::client::{Destination, DestinationClient};
use crate::raw_table::raw_table_name;

/// Avro schema of one staged raw record. Field names are the wire format.
const RAW_RECORD_SCHEMA: &str = r#"
{
    "type": "record",
    "name": "raw_record",
    "namespace": "peerflow.stage",
    "fields": [
        {"name": "_peerdb_uid", "type": "string"},
        {"name": "_peerdb_timestamp", "type": "long"},
        {"name": "_peerdb_destination_table_name", "type": "string"},
        {"name": "_peerdb_data", "type": "string"},
        {"name": "_peerdb_record_type", "type": "int"},
        {"name": "_peerdb_match_data", "type": "string"},
        {"name": "_peerdb_batch_id", "type": "long"},
        {"name": "_peerdb_unchanged_toast_columns", "type": "string"}
    ]
}
"#;

static SCHEMA: LazyLock<Schema> =
    LazyLock::new(|| Schema::parse_str(RAW_RECORD_SCHEMA).expect("raw record schema is valid"));

/// Staged Avro batches under a root directory, one file per batch:
/// `<root>/<flow_job_name>/<batch_id>.avro`.
#[derive(Debug, Clone)]
pub struct AvroStage {
    root: PathBuf,
}

impl AvroStage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn batch_path(&self, flow_job_name: &str, batch_id: i64) -> PathBuf {
        self.root.join(flow_job_name).join(format!("{batch_id}.avro"))
    }

    /// Land one batch file. This is the sync side of the staging protocol;
    /// writing the same batch twice replaces the file, so a retried sync
    /// leaves a single authoritative copy.
    pub async fn write_batch(
        &self,
        flow_job_name: &str,
        batch_id: i64,
        records: &[RawRecord],
    ) -> Result<PathBuf> {
        let path = self.batch_path(flow_job_name, batch_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut writer = Writer::with_codec(&SCHEMA, Vec::new(), Codec::Deflate);
        for record in records {
            writer
                .append_ser(record)
                .map_err(|e| NormalizeError::stage(format!("failed to encode record: {e}")))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| NormalizeError::stage(format!("failed to finish avro file: {e}")))?;

        tokio::fs::write(&path, bytes).await?;
        debug!(flow = flow_job_name, batch_id, records = records.len(), "staged avro batch");
        Ok(path)
    }

    /// Read one staged batch back. Missing or undecodable files are stage
    /// errors: the invocation cannot proceed without the batch.
    pub async fn read_batch(&self, flow_job_name: &str, batch_id: i64) -> Result<Vec<RawRecord>> {
        let path = self.batch_path(flow_job_name, batch_id);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            NormalizeError::stage(format!(
                "missing staged batch {batch_id} for flow '{flow_job_name}' at {}: {e}",
                path.display()
            ))
        })?;

        // Container decode is CPU-bound; keep it off the async workers.
        let flow = flow_job_name.to_string();
        tokio::task::spawn_blocking(move || read_records(&bytes, &flow, batch_id, &path))
            .await
            .map_err(|e| {
                NormalizeError::stage(format!(
                    "decode task for staged batch {batch_id} failed: {e}"
                ))
            })?
    }
}

fn read_records(
    bytes: &[u8],
    flow_job_name: &str,
    batch_id: i64,
    path: &Path,
) -> Result<Vec<RawRecord>> {
    let reader = Reader::new(bytes).map_err(|e| {
        NormalizeError::stage(format!(
            "malformed staged batch {batch_id} for flow '{flow_job_name}' at {}: {e}",
            path.display()
        ))
    })?;
    let mut records = Vec::new();
    for value in reader {
        let value = value.map_err(|e| {
            NormalizeError::stage(format!(
                "malformed record in staged batch {batch_id} for flow '{flow_job_name}': {e}"
            ))
        })?;
        let record: RawRecord = from_value(&value).map_err(|e| {
            NormalizeError::stage(format!(
                "staged batch {batch_id} for flow '{flow_job_name}' does not match the raw schema: {e}"
            ))
        })?;
        records.push(record);
    }
    Ok(records)
}

/// Load every staged batch in `(norm_batch_id, sync_batch_id]` into the
/// raw table, in ascending batch order. A failure aborts before planning;
/// the next invocation resumes from the first unloaded batch.
pub async fn load_stages<D: Destination>(
    destination: &D,
    stage: &AvroStage,
    flow_job_name: &str,
    norm_batch_id: i64,
    sync_batch_id: i64,
    cancel: &CancellationToken,
) -> Result<u64> {
    let raw_table = raw_table_name(flow_job_name);
    let mut total_rows = 0u64;

    for batch_id in (norm_batch_id + 1)..=sync_batch_id {
        if cancel.is_cancelled() {
            return Err(NormalizeError::Cancelled);
        }
        let records = stage.read_batch(flow_job_name, batch_id).await?;
        if !records.is_empty() {
            destination.client().insert_raw(&raw_table, &records).await?;
        }
        counter!("peerflow.normalize.rows_staged").increment(records.len() as u64);
        info!(
            flow = flow_job_name,
            batch_id,
            rows = records.len(),
            "copied staged batch to raw table"
        );
        total_rows += records.len() as u64;
    }
    Ok(total_rows)
}
