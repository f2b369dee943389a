//! Normalized table DDL
//!
//! Builds the `CREATE TABLE` for a destination table from the resolved
//! projection, and applies it idempotently. A resync replaces the table
//! wholesale (`CREATE OR REPLACE`); otherwise an existing table is left
//! untouched.

use std::collections::HashMap;

use tracing::info;

use peerflow_core::{
    project_table, NormalizeSettings, Result, TableEngine, TableMapping, TableSchema,
    SIGN_COLUMN, SIGN_COLUMN_TYPE, VERSION_COLUMN, VERSION_COLUMN_TYPE,
};

use crate::client::{Destination, DestinationClient};
use crate::quoting::quote_identifier;
use crate::types::projected_column_type;

/// Inputs for one normalized-table setup call.
#[derive(Debug, Clone)]
pub struct SetupTableRequest {
    pub table_identifier: String,
    pub schema: TableSchema,
    pub mapping: Option<TableMapping>,
    /// When set, the DDL adds this column with a load-time default; the
    /// normalize projection never mentions it.
    pub synced_at_col_name: Option<String>,
    pub is_resync: bool,
    pub env: HashMap<String, String>,
}

/// Idempotent DDL for one destination table.
///
/// Returns whether the table already existed (in which case, outside of a
/// resync, nothing was executed).
pub async fn setup_normalized_table<D: Destination>(
    destination: &D,
    req: &SetupTableRequest,
) -> Result<bool> {
    let client = destination.client();
    let already_exists = client
        .check_table_exists(destination.database(), &req.table_identifier)
        .await?;
    if already_exists && !req.is_resync {
        info!(table = %req.table_identifier, "normalized table already exists, skipping");
        return Ok(true);
    }

    let settings = NormalizeSettings::from_env(&req.env)?;
    let ddl = generate_normalized_table_sql(
        &req.table_identifier,
        &req.schema,
        req.mapping.as_ref(),
        &settings,
        req.synced_at_col_name.as_deref(),
        req.is_resync,
    )?;
    info!(table = %req.table_identifier, sql = %ddl, "creating normalized table");
    client.execute(&ddl).await?;
    Ok(false)
}

/// CREATE TABLE text for a normalized destination table.
pub fn generate_normalized_table_sql(
    table_identifier: &str,
    schema: &TableSchema,
    mapping: Option<&TableMapping>,
    settings: &NormalizeSettings,
    synced_at_col_name: Option<&str>,
    is_resync: bool,
) -> Result<String> {
    let projection = project_table(mapping, schema)?;

    let mut stmt = String::with_capacity(512);
    stmt.push_str("CREATE ");
    if is_resync {
        stmt.push_str("OR REPLACE ");
    }
    stmt.push_str("TABLE ");
    if !is_resync {
        stmt.push_str("IF NOT EXISTS ");
    }
    stmt.push_str(&quote_identifier(table_identifier));
    stmt.push_str(" (");

    let flow_nullable = settings.nullable || schema.nullable_enabled;
    for column in &projection.columns {
        let col_type = projected_column_type(column, flow_nullable);
        stmt.push_str(&quote_identifier(&column.dest_name));
        stmt.push(' ');
        stmt.push_str(&col_type);
        stmt.push_str(", ");
    }

    if let Some(synced_at) = synced_at_col_name {
        let col = synced_at.to_lowercase();
        stmt.push_str(&quote_identifier(&col));
        stmt.push_str(" DateTime64(9) DEFAULT now64(), ");
    }

    let engine = match projection.engine {
        TableEngine::MergeTree => "MergeTree()".to_string(),
        TableEngine::ReplacingMergeTree => {
            format!("ReplacingMergeTree({})", quote_identifier(VERSION_COLUMN))
        }
    };

    stmt.push_str(&format!(
        "{} {}, {} {}) ENGINE = {}",
        quote_identifier(SIGN_COLUMN),
        SIGN_COLUMN_TYPE,
        quote_identifier(VERSION_COLUMN),
        VERSION_COLUMN_TYPE,
        engine
    ));

    if projection.ordering_keys.is_empty() {
        stmt.push_str(" ORDER BY tuple()");
    } else {
        let order_by = projection
            .ordering_keys
            .iter()
            .map(|k| quote_identifier(k))
            .collect::<Vec<_>>()
            .join(",");
        stmt.push_str(&format!(" PRIMARY KEY ({order_by}) ORDER BY ({order_by})"));
    }

    if flow_nullable {
        stmt.push_str(" SETTINGS allow_nullable_key = 1");
    }

    Ok(stmt)
}
