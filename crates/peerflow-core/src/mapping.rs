//! Per-table replication settings
//!
//! A flow carries one [`TableMapping`] per replicated table: where it lands,
//! which columns are dropped, how columns are renamed or retyped, and which
//! destination engine backs the normalized table.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Destination table engine choice.
///
/// The default replacing engine collapses rows by ordering key, keeping the
/// greatest `_peerdb_version`; a plain merge engine keeps every version and
/// is only useful for audit-style tables.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TableEngine {
    #[default]
    ReplacingMergeTree,
    MergeTree,
}

/// Per-column override inside a [`TableMapping`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate, JsonSchema)]
pub struct ColumnSetting {
    /// Column name in the source table.
    #[validate(length(min = 1, max = 255))]
    pub source_name: String,

    /// Name to use in the destination table; source name when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_name: Option<String>,

    /// Explicit destination physical type; bypasses coercion when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_type: Option<String>,

    /// Position in the destination ordering key; 0 means not part of it.
    #[serde(default)]
    pub ordering: i32,

    /// Lift this column to nullable regardless of the source schema.
    #[serde(default)]
    pub nullable_enabled: bool,
}

impl ColumnSetting {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            ..Default::default()
        }
    }

    pub fn renamed(mut self, destination_name: impl Into<String>) -> Self {
        self.destination_name = Some(destination_name.into());
        self
    }

    pub fn typed(mut self, destination_type: impl Into<String>) -> Self {
        self.destination_type = Some(destination_type.into());
        self
    }

    pub fn ordered(mut self, ordering: i32) -> Self {
        self.ordering = ordering;
        self
    }
}

/// Replication settings for one source→destination table pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate, JsonSchema)]
pub struct TableMapping {
    /// Fully qualified source table (e.g. `public.orders`).
    #[validate(length(min = 1, max = 512))]
    pub source_table_identifier: String,

    /// Destination table name.
    #[validate(length(min = 1, max = 512))]
    pub destination_table_identifier: String,

    /// Source columns dropped from the destination entirely.
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Per-column overrides; columns without an entry use defaults.
    #[serde(default)]
    #[validate(nested)]
    pub columns: Vec<ColumnSetting>,

    /// Destination engine choice.
    #[serde(default)]
    pub engine: TableEngine,
}

impl TableMapping {
    pub fn new(
        source_table_identifier: impl Into<String>,
        destination_table_identifier: impl Into<String>,
    ) -> Self {
        Self {
            source_table_identifier: source_table_identifier.into(),
            destination_table_identifier: destination_table_identifier.into(),
            ..Default::default()
        }
    }

    /// Override lookup by source column name.
    pub fn column_setting(&self, source_name: &str) -> Option<&ColumnSetting> {
        self.columns.iter().find(|c| c.source_name == source_name)
    }

    /// Whether a source column is excluded from the destination.
    pub fn is_excluded(&self, source_name: &str) -> bool {
        self.exclude.iter().any(|e| e == source_name)
    }

    /// Destination name for a source column, honoring renames.
    pub fn destination_column_name<'a>(&'a self, source_name: &'a str) -> &'a str {
        self.column_setting(source_name)
            .and_then(|c| c.destination_name.as_deref())
            .unwrap_or(source_name)
    }
}

/// Find the mapping that publishes to a destination table, if any.
pub fn mapping_for_destination<'a>(
    mappings: &'a [TableMapping],
    destination_table: &str,
) -> Option<&'a TableMapping> {
    mappings
        .iter()
        .find(|m| m.destination_table_identifier == destination_table)
}
