//! # peerflow-core - Domain model for the peerflow normalization engine
//!
//! Destination-agnostic types shared by the catalog and destination crates:
//!
//! - [`RawRecord`] - one row of the append-only change log, with the
//!   wire-stable `_peerdb_*` field names
//! - [`TableSchema`] / [`QKind`] - source schema snapshots and logical types
//! - [`TableMapping`] - per-table replication settings (renames, exclusion,
//!   ordering keys, engine choice)
//! - [`TableProjection`] - the resolved source→destination column plan
//! - [`NormalizeSettings`] - per-invocation dynamic knobs read from the env map
//! - [`NormalizeError`] - the error taxonomy with alerting classification
//!
//! Nothing in this crate talks to a network or branches on destination
//! identity; projection and settings parsing are pure functions so they can
//! be tested without a running warehouse.

pub mod error;
pub mod mapping;
pub mod projection;
pub mod record;
pub mod schema;
pub mod settings;

pub use error::{ErrorAction, ErrorClass, NormalizeError, Result};
pub use mapping::{ColumnSetting, TableEngine, TableMapping};
pub use projection::{
    build_processed_schema_mapping, project_table, ProjectedColumn, TableProjection,
};
pub use record::{RawRecord, RecordType};
pub use schema::{FieldDescription, QKind, TableSchema};
pub use settings::{BinaryFormat, NormalizeSettings};

/// Synthesized soft-delete flag column on every normalized table.
pub const SIGN_COLUMN: &str = "_peerdb_is_deleted";
/// ClickHouse type of [`SIGN_COLUMN`].
pub const SIGN_COLUMN_TYPE: &str = "Int8";
/// Synthesized row-version column on every normalized table.
pub const VERSION_COLUMN: &str = "_peerdb_version";
/// ClickHouse type of [`VERSION_COLUMN`].
pub const VERSION_COLUMN_TYPE: &str = "Int64";
