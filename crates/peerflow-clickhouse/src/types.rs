//! Logical → ClickHouse type coercion
//!
//! A pure table from [`QKind`] to a ClickHouse column type string, with
//! nullability lifting. Explicit `destination_type` overrides in the table
//! mapping bypass this module entirely.

use peerflow_core::{FieldDescription, ProjectedColumn, QKind};

/// Decimal bounds when the source declares no precision/scale.
const DEFAULT_NUMERIC: (u8, u8) = (76, 38);

/// Millisecond precision for all temporal columns.
pub const DATETIME_PRECISION: u8 = 3;

/// Physical type for one column.
///
/// `nullable` lifts the type to `Nullable(...)` unless the kind is an
/// array; ClickHouse does not allow nullable arrays, and NULL array
/// values degrade to empty arrays at load time instead.
pub fn to_clickhouse_type(kind: QKind, field: &FieldDescription, nullable: bool) -> String {
    let base = base_type(kind, field);
    if nullable && !kind.is_array() {
        format!("Nullable({base})")
    } else {
        base
    }
}

/// Physical type for a projected column, honoring the mapping override and
/// the combined nullability (column nullable, per-column lift, or the
/// flow-wide lift).
pub fn projected_column_type(column: &ProjectedColumn, flow_nullable: bool) -> String {
    if let Some(override_type) = &column.type_override {
        return override_type.clone();
    }
    let field = FieldDescription {
        name: column.source_name.clone(),
        kind: column.kind,
        nullable: column.nullable,
        precision: column.precision,
        scale: column.scale,
    };
    let nullable = column.nullable || column.nullable_enabled || flow_nullable;
    to_clickhouse_type(column.kind, &field, nullable)
}

fn base_type(kind: QKind, field: &FieldDescription) -> String {
    match kind {
        QKind::Boolean => "Bool".to_string(),
        QKind::Int16 => "Int16".to_string(),
        QKind::Int32 => "Int32".to_string(),
        QKind::Int64 => "Int64".to_string(),
        QKind::Float32 => "Float32".to_string(),
        QKind::Float64 => "Float64".to_string(),
        QKind::Numeric => {
            let (precision, scale) = match (field.precision, field.scale) {
                (Some(p), Some(s)) => (p, s),
                _ => DEFAULT_NUMERIC,
            };
            format!("Decimal({precision}, {scale})")
        }
        QKind::String | QKind::Json | QKind::Interval | QKind::Time => "String".to_string(),
        // Bytes arrive base64-encoded inside the JSON payload; the
        // projection decodes them, so the stored type is a plain string.
        QKind::Bytes => "String".to_string(),
        QKind::Uuid => "UUID".to_string(),
        QKind::Date => "Date32".to_string(),
        QKind::Timestamp | QKind::TimestampTz => format!("DateTime64({DATETIME_PRECISION})"),
        QKind::ArrayInt32 => "Array(Int32)".to_string(),
        QKind::ArrayInt64 => "Array(Int64)".to_string(),
        QKind::ArrayFloat64 => "Array(Float64)".to_string(),
        QKind::ArrayString => "Array(String)".to_string(),
    }
}

/// Whether a resolved ClickHouse type is temporal and needs the
/// best-effort parse projection instead of a typed `JSONExtract`.
pub fn is_temporal_type(clickhouse_type: &str) -> bool {
    matches!(
        clickhouse_type,
        "Date32" | "Nullable(Date32)"
    ) || clickhouse_type.starts_with("DateTime64")
        || clickhouse_type.starts_with("Nullable(DateTime64")
}

/// Whether a resolved type is a date (no time component).
pub fn is_date_type(clickhouse_type: &str) -> bool {
    matches!(clickhouse_type, "Date32" | "Nullable(Date32)")
}
