//! # peerflow-clickhouse - ClickHouse CDC normalization
//!
//! Materializes a flow's append-only raw change log into per-table
//! `ReplacingMergeTree` destination tables.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   Avro batches    ┌───────────────┐
//! │  sync stage  │ ────────────────▶ │  AvroStage    │
//! └──────────────┘  (flow, batch_id) └───────┬───────┘
//!                                            │ stage loader
//!                                            ▼
//!                                    ┌───────────────┐
//!                                    │   raw table   │  _peerdb_raw_<flow>
//!                                    └───────┬───────┘
//!                                            │ planner: one INSERT…SELECT
//!                                            │ per (table, part)
//!                                            ▼
//!                      plan channel  ┌───────────────┐
//!                     ═════════════▶ │ executor pool │  P connections
//!                                    └───────┬───────┘
//!                                            ▼
//!                                  normalized tables
//!                          (user columns + _peerdb_is_deleted,
//!                           _peerdb_version [, _peerdb_synced_at])
//! ```
//!
//! The [`NormalizeEngine`] sequences one invocation end to end and owns
//! the batch-pointer invariant `last_normalize_batch_id <=
//! last_sync_batch_id`; the pointer write is the linearization point, so
//! a crashed invocation replays the same window on the next run and
//! converges to the same destination state.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! # async fn example() -> peerflow_core::Result<()> {
//! use std::sync::Arc;
//! use peerflow_catalog::MemoryCatalog;
//! use peerflow_clickhouse::{
//!     AvroStage, ClickHouseConfig, ClickHouseDestination, NormalizeEngine,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! let config: ClickHouseConfig =
//!     serde_json::from_str(r#"{"url": "http://localhost:8123"}"#).unwrap();
//! let destination = Arc::new(ClickHouseDestination::new(config)?);
//! let catalog = Arc::new(MemoryCatalog::new());
//! let engine = NormalizeEngine::new(destination, catalog, AvroStage::new("/var/lib/peerflow/stage"));
//!
//! # let request = todo!();
//! let response = engine.normalize_records(&request, &CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod ddl;
pub mod executor;
pub mod normalize;
pub mod planner;
pub mod quoting;
pub mod raw_table;
pub mod stage;
pub mod testing;
pub mod types;

pub use client::{
    ClickHouseClient, ClickHouseCompression, ClickHouseConfig, ClickHouseDestination, Destination,
    DestinationClient,
};
pub use ddl::{generate_normalized_table_sql, SetupTableRequest};
pub use normalize::{NormalizeEngine, NormalizeRequest, NormalizeResponse};
pub use planner::NormalizePlan;
pub use raw_table::raw_table_name;
pub use stage::AvroStage;
