//! Normalize planner
//!
//! Turns one batch window into `INSERT ... SELECT` statements, one per
//! (destination table, partition). Partitions are disjoint by
//! `cityHash64(_peerdb_uid) % parts`, so the union of all parts equals the
//! single-part result and no row is selected twice. Within one part,
//! `LIMIT 1 BY _peerdb_uid` collapses raw rows duplicated by a replayed
//! stage load.
//!
//! Row versioning: the destination's replacing engine keeps the greatest
//! `_peerdb_version` per ordering key, and the planner assigns
//! `_peerdb_timestamp` as the version, so the newest source image wins.
//! When two raw records for one key carry the same timestamp the engine
//! may keep either; the sync stage is responsible for keeping timestamps
//! unique per key.

use peerflow_core::{
    project_table, NormalizeSettings, ProjectedColumn, QKind, Result, TableMapping, TableSchema,
    BinaryFormat, SIGN_COLUMN, VERSION_COLUMN,
};

use crate::quoting::{escape_str, quote_identifier};
use crate::raw_table::raw_table_name;
use crate::types::{is_date_type, is_temporal_type, projected_column_type, DATETIME_PRECISION};

/// One executable unit of normalize work.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizePlan {
    pub table: String,
    pub part: u32,
    pub sql: String,
}

/// Shared inputs for one invocation's plans.
#[derive(Debug, Clone)]
pub struct PlannerContext<'a> {
    pub flow_job_name: &'a str,
    pub norm_batch_id: i64,
    pub sync_batch_id: i64,
    pub settings: &'a NormalizeSettings,
}

impl PlannerContext<'_> {
    fn raw_table(&self) -> String {
        quote_identifier(&raw_table_name(self.flow_job_name))
    }

    /// Window predicate shared by every branch of every plan.
    fn window_predicate(&self) -> String {
        format!(
            "_peerdb_batch_id > {} AND _peerdb_batch_id <= {}",
            self.norm_batch_id, self.sync_batch_id
        )
    }
}

/// Distinct destination tables present in the raw window.
pub fn distinct_tables_sql(ctx: &PlannerContext<'_>) -> String {
    format!(
        "SELECT DISTINCT _peerdb_destination_table_name FROM {} WHERE {}",
        ctx.raw_table(),
        ctx.window_predicate()
    )
}

/// Build the plans for one destination table, one per partition.
pub fn build_table_plans(
    ctx: &PlannerContext<'_>,
    table: &str,
    schema: &TableSchema,
    mapping: Option<&TableMapping>,
) -> Result<Vec<NormalizePlan>> {
    let projection = project_table(mapping, schema)?;
    let flow_nullable = ctx.settings.nullable || schema.nullable_enabled;

    // Column selector and the two SELECT projections (post-image, and the
    // pre-image used by the primary-update tombstone branch).
    let mut selector = String::from("(");
    let mut proj = String::new();
    let mut proj_update = String::new();

    for column in &projection.columns {
        selector.push_str(&quote_identifier(&column.dest_name));
        selector.push(',');

        let ch_type = projected_column_type(column, flow_nullable);
        proj.push_str(&column_expr(column, &ch_type, ctx.settings, "_peerdb_data"));
        proj.push(',');
        if ctx.settings.enable_primary_update {
            proj_update.push_str(&column_expr(
                column,
                &ch_type,
                ctx.settings,
                "_peerdb_match_data",
            ));
            proj_update.push(',');
        }
    }

    // Soft-delete flag: insert (0) and update (1) divide to 0, delete (2)
    // divides to 1.
    proj.push_str(&format!(
        "intDiv(_peerdb_record_type, 2) AS {},",
        quote_identifier(SIGN_COLUMN)
    ));
    proj.push_str(&format!(
        "_peerdb_timestamp AS {}",
        quote_identifier(VERSION_COLUMN)
    ));
    selector.push_str(&format!(
        "{},{}) ",
        quote_identifier(SIGN_COLUMN),
        quote_identifier(VERSION_COLUMN)
    ));

    if ctx.settings.enable_primary_update {
        // The pre-image becomes a tombstone at the old key, versioned one
        // tick before the new image so the replacing engine orders it
        // strictly earlier.
        proj_update.push_str(&format!("1 AS {},", quote_identifier(SIGN_COLUMN)));
        proj_update.push_str(&format!(
            "_peerdb_timestamp - 1 AS {}",
            quote_identifier(VERSION_COLUMN)
        ));
    }

    let raw_table = ctx.raw_table();
    let window = ctx.window_predicate();
    let table_predicate = format!(
        "_peerdb_destination_table_name = '{}'",
        escape_str(table)
    );
    let parts = ctx.settings.normalization_parts.max(1);

    let mut plans = Vec::with_capacity(parts as usize);
    for part in 0..parts {
        let part_predicate = (parts > 1)
            .then(|| format!(" AND cityHash64(_peerdb_uid) % {parts} = {part}"))
            .unwrap_or_default();

        let mut query = format!(
            "INSERT INTO {} {}SELECT {} FROM {} WHERE {} AND {}{} LIMIT 1 BY _peerdb_uid",
            quote_identifier(table),
            selector,
            proj,
            raw_table,
            window,
            table_predicate,
            part_predicate
        );

        if ctx.settings.enable_primary_update {
            query.push_str(&format!(
                " UNION ALL SELECT {} FROM {} WHERE _peerdb_match_data != '' AND {} AND {} \
                 AND _peerdb_record_type = 1{} LIMIT 1 BY _peerdb_uid",
                proj_update, raw_table, window, table_predicate, part_predicate
            ));
        }

        plans.push(NormalizePlan {
            table: table.to_string(),
            part,
            sql: query,
        });
    }
    Ok(plans)
}

/// Projection expression for one column, reading from `source_field`
/// (`_peerdb_data` or `_peerdb_match_data`).
fn column_expr(
    column: &ProjectedColumn,
    ch_type: &str,
    settings: &NormalizeSettings,
    source_field: &str,
) -> String {
    let src = escape_str(&column.source_name);
    let dst = quote_identifier(&column.dest_name);

    if is_date_type(ch_type) {
        return format!(
            "toDate32(parseDateTime64BestEffortOrNull(JSONExtractString({source_field}, '{src}'),{DATETIME_PRECISION})) AS {dst}"
        );
    }
    if is_temporal_type(ch_type) {
        return format!(
            "parseDateTime64BestEffortOrNull(JSONExtractString({source_field}, '{src}'),{DATETIME_PRECISION}) AS {dst}"
        );
    }
    if column.kind == QKind::Bytes && column.type_override.is_none() {
        return match settings.binary_format {
            BinaryFormat::Raw => format!(
                "base64Decode(JSONExtractString({source_field}, '{src}')) AS {dst}"
            ),
            BinaryFormat::Hex => format!(
                "hex(base64Decode(JSONExtractString({source_field}, '{src}'))) AS {dst}"
            ),
        };
    }
    format!("JSONExtract({source_field}, '{src}', '{ch_type}') AS {dst}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerflow_core::{ColumnSetting, FieldDescription};

    fn schema() -> TableSchema {
        TableSchema::new("public.orders")
            .with_column(FieldDescription::new("id", QKind::Int64))
            .with_column(FieldDescription::new("v", QKind::String))
            .with_primary_keys(["id"])
    }

    fn ctx<'a>(settings: &'a NormalizeSettings) -> PlannerContext<'a> {
        PlannerContext {
            flow_job_name: "flow",
            norm_batch_id: 3,
            sync_batch_id: 7,
            settings,
        }
    }

    #[test]
    fn test_distinct_tables_sql() {
        let settings = NormalizeSettings::default();
        let sql = distinct_tables_sql(&ctx(&settings));
        assert_eq!(
            sql,
            "SELECT DISTINCT _peerdb_destination_table_name FROM `_peerdb_raw_flow` \
             WHERE _peerdb_batch_id > 3 AND _peerdb_batch_id <= 7"
        );
    }

    #[test]
    fn test_single_part_plan_shape() {
        let settings = NormalizeSettings::default();
        let plans = build_table_plans(&ctx(&settings), "orders", &schema(), None).unwrap();
        assert_eq!(plans.len(), 1);
        let sql = &plans[0].sql;

        assert!(sql.starts_with(
            "INSERT INTO `orders` (`id`,`v`,`_peerdb_is_deleted`,`_peerdb_version`) SELECT "
        ));
        assert!(sql.contains("JSONExtract(_peerdb_data, 'id', 'Int64') AS `id`"));
        assert!(sql.contains("JSONExtract(_peerdb_data, 'v', 'String') AS `v`"));
        assert!(sql.contains("intDiv(_peerdb_record_type, 2) AS `_peerdb_is_deleted`"));
        assert!(sql.contains("_peerdb_timestamp AS `_peerdb_version`"));
        assert!(sql.contains("WHERE _peerdb_batch_id > 3 AND _peerdb_batch_id <= 7"));
        assert!(sql.contains("_peerdb_destination_table_name = 'orders'"));
        assert!(sql.contains("LIMIT 1 BY _peerdb_uid"));
        // Single part: no hash pruning, no tombstone branch.
        assert!(!sql.contains("cityHash64"));
        assert!(!sql.contains("UNION ALL"));
    }

    #[test]
    fn test_partition_predicates_are_disjoint() {
        let settings = NormalizeSettings {
            normalization_parts: 3,
            ..Default::default()
        };
        let plans = build_table_plans(&ctx(&settings), "orders", &schema(), None).unwrap();
        assert_eq!(plans.len(), 3);
        for (i, plan) in plans.iter().enumerate() {
            assert_eq!(plan.part, i as u32);
            assert!(plan
                .sql
                .contains(&format!("cityHash64(_peerdb_uid) % 3 = {i}")));
        }
        // All parts share the same window and table predicate.
        let strip = |sql: &str| sql.replace(|c: char| c.is_ascii_digit(), "#");
        assert_eq!(strip(&plans[0].sql), strip(&plans[2].sql));
    }

    #[test]
    fn test_primary_update_tombstone_branch() {
        // S2: the pre-image lands as a tombstone versioned one tick early.
        let settings = NormalizeSettings {
            enable_primary_update: true,
            ..Default::default()
        };
        let plans = build_table_plans(&ctx(&settings), "orders", &schema(), None).unwrap();
        let sql = &plans[0].sql;

        assert!(sql.contains("UNION ALL SELECT "));
        assert!(sql.contains("JSONExtract(_peerdb_match_data, 'id', 'Int64') AS `id`"));
        assert!(sql.contains("1 AS `_peerdb_is_deleted`"));
        assert!(sql.contains("_peerdb_timestamp - 1 AS `_peerdb_version`"));
        assert!(sql.contains("_peerdb_match_data != ''"));
        assert!(sql.contains("_peerdb_record_type = 1"));
        // The tombstone version is strictly smaller than the image version.
        let image_pos = sql.find("_peerdb_timestamp AS `_peerdb_version`").unwrap();
        let tombstone_pos = sql
            .find("_peerdb_timestamp - 1 AS `_peerdb_version`")
            .unwrap();
        assert!(image_pos < tombstone_pos);
    }

    #[test]
    fn test_temporal_projection() {
        let schema = TableSchema::new("public.t")
            .with_column(FieldDescription::new("d", QKind::Date))
            .with_column(FieldDescription::new("ts", QKind::Timestamp));
        let settings = NormalizeSettings::default();
        let plans = build_table_plans(&ctx(&settings), "t", &schema, None).unwrap();
        let sql = &plans[0].sql;
        assert!(sql.contains(
            "toDate32(parseDateTime64BestEffortOrNull(JSONExtractString(_peerdb_data, 'd'),3)) AS `d`"
        ));
        assert!(sql.contains(
            "parseDateTime64BestEffortOrNull(JSONExtractString(_peerdb_data, 'ts'),3) AS `ts`"
        ));
    }

    #[test]
    fn test_bytes_projection_modes() {
        // S5: hex mode stores hex text of the decoded payload.
        let schema =
            TableSchema::new("public.t").with_column(FieldDescription::new("payload", QKind::Bytes));

        let raw = NormalizeSettings::default();
        let plans = build_table_plans(&ctx(&raw), "t", &schema, None).unwrap();
        assert!(plans[0]
            .sql
            .contains("base64Decode(JSONExtractString(_peerdb_data, 'payload')) AS `payload`"));
        assert!(!plans[0].sql.contains("hex("));

        let hex = NormalizeSettings {
            binary_format: BinaryFormat::Hex,
            ..Default::default()
        };
        let plans = build_table_plans(&ctx(&hex), "t", &schema, None).unwrap();
        assert!(plans[0]
            .sql
            .contains("hex(base64Decode(JSONExtractString(_peerdb_data, 'payload'))) AS `payload`"));
    }

    #[test]
    fn test_excluded_column_absent_from_projection() {
        // S3: both branches of the plan omit the excluded column.
        let mut mapping = TableMapping::new("public.orders", "orders");
        mapping.exclude.push("v".to_string());
        let settings = NormalizeSettings {
            enable_primary_update: true,
            ..Default::default()
        };
        let plans =
            build_table_plans(&ctx(&settings), "orders", &schema(), Some(&mapping)).unwrap();
        assert!(!plans[0].sql.contains("`v`"));
        assert!(!plans[0].sql.contains("'v'"));
    }

    #[test]
    fn test_rename_used_in_projection() {
        // S4: projections refer to the destination name.
        let mut mapping = TableMapping::new("public.orders", "orders");
        mapping
            .columns
            .push(ColumnSetting::new("id").renamed("pk").ordered(1));
        let settings = NormalizeSettings::default();
        let plans =
            build_table_plans(&ctx(&settings), "orders", &schema(), Some(&mapping)).unwrap();
        let sql = &plans[0].sql;
        assert!(sql.contains("JSONExtract(_peerdb_data, 'id', 'Int64') AS `pk`"));
        assert!(sql.contains("(`pk`,`v`,"));
    }

    #[test]
    fn test_type_override_used_verbatim() {
        let mut mapping = TableMapping::new("public.orders", "orders");
        mapping
            .columns
            .push(ColumnSetting::new("v").typed("LowCardinality(String)"));
        let settings = NormalizeSettings::default();
        let plans =
            build_table_plans(&ctx(&settings), "orders", &schema(), Some(&mapping)).unwrap();
        assert!(plans[0]
            .sql
            .contains("JSONExtract(_peerdb_data, 'v', 'LowCardinality(String)') AS `v`"));
    }

    #[test]
    fn test_table_name_literal_escaped() {
        let settings = NormalizeSettings::default();
        let plans = build_table_plans(&ctx(&settings), "o'brien", &schema(), None).unwrap();
        assert!(plans[0]
            .sql
            .contains("_peerdb_destination_table_name = 'o\\'brien'"));
    }
}
