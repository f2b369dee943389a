//! # peerflow-catalog - Persistent flow state
//!
//! The catalog is a small relational store (PostgreSQL) holding everything
//! a flow needs to survive a restart:
//!
//! - `flow_state` - the per-flow batch pointers (`last_sync_batch_id`,
//!   `last_normalize_batch_id`)
//! - `schema_snapshots` - immutable per-batch source schema snapshots
//! - `alerts` - alert history, used to de-duplicate notifications across
//!   invocations
//!
//! [`Catalog`] is the seam: production uses [`PostgresCatalog`], tests use
//! [`MemoryCatalog`]. The batch-pointer invariant
//! `last_normalize_batch_id <= last_sync_batch_id` is owned by the batch
//! coordinator - the catalog only stores what it is told.

pub mod alerting;
pub mod store;

pub use alerting::Alerter;
pub use store::{Catalog, MemoryCatalog, PostgresCatalog};
