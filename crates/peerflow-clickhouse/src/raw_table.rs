//! Raw change-log table
//!
//! One append-only table per flow holds every change event landed by the
//! sync stage. The ordering key `(_peerdb_batch_id,
//! _peerdb_destination_table_name)` keeps a normalize window's scan
//! contiguous; the planner prunes further with `cityHash64(_peerdb_uid)`.

use serde::Serialize;

use peerflow_core::RawRecord;

use crate::quoting::quote_identifier;

/// Raw-table row in ClickHouse `RowBinary` encoding.
#[derive(Debug, Clone, Serialize, clickhouse::Row)]
pub struct RawRow {
    #[serde(rename = "_peerdb_uid")]
    pub uid: String,
    #[serde(rename = "_peerdb_timestamp")]
    pub timestamp: i64,
    #[serde(rename = "_peerdb_destination_table_name")]
    pub destination_table_name: String,
    #[serde(rename = "_peerdb_data")]
    pub data: String,
    #[serde(rename = "_peerdb_record_type")]
    pub record_type: i32,
    #[serde(rename = "_peerdb_match_data")]
    pub match_data: String,
    #[serde(rename = "_peerdb_batch_id")]
    pub batch_id: i64,
    #[serde(rename = "_peerdb_unchanged_toast_columns")]
    pub unchanged_toast_columns: String,
}

impl From<&RawRecord> for RawRow {
    fn from(record: &RawRecord) -> Self {
        Self {
            uid: record.uid.clone(),
            timestamp: record.timestamp,
            destination_table_name: record.destination_table_name.clone(),
            data: record.data.clone(),
            record_type: record.record_type,
            match_data: record.match_data.clone(),
            batch_id: record.batch_id,
            unchanged_toast_columns: record.unchanged_toast_columns.clone(),
        }
    }
}

/// Raw table name for a flow; non-identifier characters become `_`.
pub fn raw_table_name(flow_job_name: &str) -> String {
    let sanitized: String = flow_job_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("_peerdb_raw_{sanitized}")
}

/// Idempotent CREATE TABLE for the raw change log.
pub fn create_raw_table_sql(flow_job_name: &str) -> String {
    let table = quote_identifier(&raw_table_name(flow_job_name));
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (\
         `_peerdb_uid` String, \
         `_peerdb_timestamp` Int64, \
         `_peerdb_destination_table_name` String, \
         `_peerdb_data` String, \
         `_peerdb_record_type` Int32, \
         `_peerdb_match_data` String, \
         `_peerdb_batch_id` Int64, \
         `_peerdb_unchanged_toast_columns` String\
         ) ENGINE = MergeTree() \
         ORDER BY (`_peerdb_batch_id`, `_peerdb_destination_table_name`)"
    )
}

/// Retention statement dropping raw rows older than `ttl_batches` behind
/// the given batch id. Lightweight delete; the engine reclaims space on
/// its own schedule.
pub fn prune_raw_table_sql(flow_job_name: &str, end_batch_id: i64, ttl_batches: u32) -> String {
    let table = quote_identifier(&raw_table_name(flow_job_name));
    let horizon = (end_batch_id - i64::from(ttl_batches)).max(0);
    format!("DELETE FROM {table} WHERE `_peerdb_batch_id` <= {horizon}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_table_name_sanitized() {
        assert_eq!(raw_table_name("orders_mirror"), "_peerdb_raw_orders_mirror");
        assert_eq!(raw_table_name("a.b-c d"), "_peerdb_raw_a_b_c_d");
    }

    #[test]
    fn test_create_sql_shape() {
        let sql = create_raw_table_sql("flow");
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS `_peerdb_raw_flow`"));
        assert!(sql.contains("`_peerdb_uid` String"));
        assert!(sql.contains("`_peerdb_record_type` Int32"));
        assert!(sql.contains("ENGINE = MergeTree()"));
        assert!(sql.contains(
            "ORDER BY (`_peerdb_batch_id`, `_peerdb_destination_table_name`)"
        ));
    }

    #[test]
    fn test_prune_sql() {
        let sql = prune_raw_table_sql("flow", 100, 30);
        assert_eq!(
            sql,
            "DELETE FROM `_peerdb_raw_flow` WHERE `_peerdb_batch_id` <= 70"
        );
        // Horizon never goes negative.
        assert!(prune_raw_table_sql("flow", 5, 30).ends_with("<= 0"));
        assert!(prune_raw_table_sql("flow", 5, 3).ends_with("<= 2"));
    }

    #[test]
    fn test_row_from_record() {
        let record = RawRecord {
            uid: "u1".to_string(),
            timestamp: 9,
            destination_table_name: "t".to_string(),
            data: "{}".to_string(),
            record_type: 2,
            match_data: String::new(),
            batch_id: 3,
            unchanged_toast_columns: String::new(),
        };
        let row = RawRow::from(&record);
        assert_eq!(row.uid, "u1");
        assert_eq!(row.record_type, 2);
        assert_eq!(row.batch_id, 3);
    }
}
