//! Schema projection
//!
//! Resolves a table mapping against a source schema snapshot into the
//! destination column plan used by DDL generation and the normalize
//! planner. Pure functions; all the policy lives here so the SQL builders
//! stay mechanical.

use std::collections::HashMap;

use tracing::warn;

use crate::error::{NormalizeError, Result};
use crate::mapping::{TableEngine, TableMapping};
use crate::schema::{FieldDescription, QKind, TableSchema};

/// One destination column with its resolved name and overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedColumn {
    pub source_name: String,
    pub dest_name: String,
    pub kind: QKind,
    pub nullable: bool,
    pub precision: Option<u8>,
    pub scale: Option<u8>,
    /// Explicit destination physical type; bypasses coercion when set.
    pub type_override: Option<String>,
    /// Per-column nullable lift from the mapping.
    pub nullable_enabled: bool,
}

/// The resolved source→destination plan for one table.
///
/// Key projections carry *destination* (renamed) column names, unquoted;
/// quoting is a dialect concern.
#[derive(Debug, Clone, PartialEq)]
pub struct TableProjection {
    /// Destination columns in source declaration order, exclusions applied.
    pub columns: Vec<ProjectedColumn>,
    /// Source primary keys minus exclusions, renamed. May be empty.
    pub primary_keys: Vec<String>,
    /// Ordering key: explicit `ordering > 0` columns by ascending value,
    /// else the primary keys. Empty means the unit tuple.
    pub ordering_keys: Vec<String>,
    pub engine: TableEngine,
}

impl TableProjection {
    /// Destination column names in declaration order.
    pub fn dest_column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.dest_name.as_str())
    }
}

/// Resolve the destination plan for one table.
///
/// Contracts:
/// - a column lands in the destination iff it is not excluded; exclusion of
///   a name the schema no longer has is ignored (source may have drifted)
/// - renames apply uniformly to columns, primary keys, and ordering keys
/// - an ordering entry naming a column the destination does not have is a
///   fatal plan error
pub fn project_table(
    mapping: Option<&TableMapping>,
    schema: &TableSchema,
) -> Result<TableProjection> {
    let mut columns = Vec::with_capacity(schema.columns.len());
    for field in &schema.columns {
        if mapping.is_some_and(|m| m.is_excluded(&field.name)) {
            continue;
        }
        let setting = mapping.and_then(|m| m.column_setting(&field.name));
        columns.push(ProjectedColumn {
            source_name: field.name.clone(),
            dest_name: setting
                .and_then(|s| s.destination_name.clone())
                .unwrap_or_else(|| field.name.clone()),
            kind: field.kind,
            nullable: field.nullable,
            precision: field.precision,
            scale: field.scale,
            type_override: setting.and_then(|s| s.destination_type.clone()),
            nullable_enabled: setting.is_some_and(|s| s.nullable_enabled),
        });
    }

    let primary_keys: Vec<String> = schema
        .primary_key_columns
        .iter()
        .filter(|pk| !mapping.is_some_and(|m| m.is_excluded(pk)))
        .map(|pk| {
            mapping
                .map(|m| m.destination_column_name(pk).to_string())
                .unwrap_or_else(|| pk.clone())
        })
        .collect();

    let ordering_keys = match mapping {
        Some(m) => ordering_key_columns(m, &columns)?,
        None => Vec::new(),
    };
    let ordering_keys = if ordering_keys.is_empty() {
        primary_keys.clone()
    } else {
        ordering_keys
    };

    Ok(TableProjection {
        columns,
        primary_keys,
        ordering_keys,
        engine: mapping.map(|m| m.engine).unwrap_or_default(),
    })
}

/// Explicit ordering columns by ascending `ordering`, renamed.
fn ordering_key_columns(
    mapping: &TableMapping,
    columns: &[ProjectedColumn],
) -> Result<Vec<String>> {
    let mut ordered: Vec<_> = mapping
        .columns
        .iter()
        .filter(|c| c.ordering > 0)
        .collect();
    if ordered.is_empty() {
        return Ok(Vec::new());
    }
    ordered.sort_by_key(|c| c.ordering);

    let mut keys = Vec::with_capacity(ordered.len());
    for setting in ordered {
        let col = columns
            .iter()
            .find(|c| c.source_name == setting.source_name)
            .ok_or_else(|| {
                NormalizeError::plan(
                    &mapping.destination_table_identifier,
                    format!(
                        "ordering column '{}' is not a destination column",
                        setting.source_name
                    ),
                )
            })?;
        keys.push(col.dest_name.clone());
    }
    Ok(keys)
}

/// Re-key source schema snapshots by destination table name, applying
/// column exclusion to both the column list and the primary keys.
///
/// Source tables with no mapping are skipped with a warning; they cannot
/// be normalized until the mapping catches up.
pub fn build_processed_schema_mapping(
    table_mappings: &[TableMapping],
    source_schemas: &HashMap<String, TableSchema>,
) -> HashMap<String, TableSchema> {
    let mut sorted_sources: Vec<_> = source_schemas.keys().collect();
    sorted_sources.sort();

    let mut processed = HashMap::with_capacity(source_schemas.len());
    for src_table in sorted_sources {
        let schema = &source_schemas[src_table];
        let Some(mapping) = table_mappings
            .iter()
            .find(|m| &m.source_table_identifier == src_table)
        else {
            warn!(table = %src_table, "source table has no mapping, skipping");
            continue;
        };

        let schema = if mapping.exclude.is_empty() {
            schema.clone()
        } else {
            let columns: Vec<FieldDescription> = schema
                .columns
                .iter()
                .filter(|c| !mapping.is_excluded(&c.name))
                .cloned()
                .collect();
            let primary_key_columns: Vec<String> = schema
                .primary_key_columns
                .iter()
                .filter(|pk| !mapping.is_excluded(pk))
                .cloned()
                .collect();
            TableSchema {
                table_identifier: schema.table_identifier.clone(),
                columns,
                primary_key_columns,
                nullable_enabled: schema.nullable_enabled,
            }
        };

        processed.insert(mapping.destination_table_identifier.clone(), schema);
    }
    processed
}
