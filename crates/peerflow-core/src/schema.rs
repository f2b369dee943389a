//! Source schema snapshots and logical column types

use serde::{Deserialize, Serialize};

/// Logical type of a source column, independent of any destination dialect.
///
/// The set covers what the CDC pullers emit: integer widths, decimals with
/// precision/scale, floats, temporal types, and arrays of scalars. The
/// destination crate owns the mapping to physical column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QKind {
    Boolean,
    Int16,
    Int32,
    Int64,
    Float32,
    Float64,
    Numeric,
    String,
    Bytes,
    Uuid,
    Json,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Interval,
    ArrayInt32,
    ArrayInt64,
    ArrayFloat64,
    ArrayString,
}

impl QKind {
    /// Whether this kind is an array of scalars.
    pub fn is_array(self) -> bool {
        matches!(
            self,
            Self::ArrayInt32 | Self::ArrayInt64 | Self::ArrayFloat64 | Self::ArrayString
        )
    }
}

/// One column of a source table schema snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescription {
    pub name: String,
    pub kind: QKind,
    #[serde(default)]
    pub nullable: bool,
    /// Decimal precision, when the source declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u8>,
    /// Decimal scale, when the source declares one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u8>,
}

impl FieldDescription {
    pub fn new(name: impl Into<String>, kind: QKind) -> Self {
        Self {
            name: name.into(),
            kind,
            nullable: false,
            precision: None,
            scale: None,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn with_numeric(mut self, precision: u8, scale: u8) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }
}

/// Immutable per-batch snapshot of one source table's schema.
///
/// Snapshots are produced at sync time when a DDL event is absorbed; the
/// normalize path only ever reads them.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_identifier: String,
    pub columns: Vec<FieldDescription>,
    pub primary_key_columns: Vec<String>,
    /// Flow-level flag lifting every column to nullable.
    #[serde(default)]
    pub nullable_enabled: bool,
}

impl TableSchema {
    pub fn new(table_identifier: impl Into<String>) -> Self {
        Self {
            table_identifier: table_identifier.into(),
            ..Default::default()
        }
    }

    pub fn with_column(mut self, column: FieldDescription) -> Self {
        self.columns.push(column);
        self
    }

    pub fn with_primary_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary_key_columns = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Look up a column by source name.
    pub fn column(&self, name: &str) -> Option<&FieldDescription> {
        self.columns.iter().find(|c| c.name == name)
    }
}
