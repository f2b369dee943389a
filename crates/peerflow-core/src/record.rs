//! Raw change record
//!
//! One row of the append-only change log. The serde field names are the
//! wire format: they appear verbatim in staged Avro files and as raw-table
//! column names, and existing deployments depend on them.

use serde::{Deserialize, Serialize};

/// Kind of change a raw record represents.
///
/// The integer encoding is load-bearing: the normalize planner computes the
/// soft-delete flag as `intDiv(record_type, 2)`, so insert (0) and update
/// (1) map to 0 and delete (2) maps to 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordType {
    Insert,
    Update,
    Delete,
}

impl RecordType {
    /// Wire encoding used in `_peerdb_record_type`.
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Insert => 0,
            Self::Update => 1,
            Self::Delete => 2,
        }
    }

    /// Decode the wire value; unknown values are rejected.
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Insert),
            1 => Some(Self::Update),
            2 => Some(Self::Delete),
            _ => None,
        }
    }
}

/// One source change, as landed by the sync stage.
///
/// `_peerdb_data` holds the post-image as a JSON object keyed by *source*
/// column name (bytes values base64-encoded). For updates,
/// `_peerdb_match_data` holds the pre-image; it is the empty string
/// otherwise. `_peerdb_unchanged_toast_columns` is a comma-joined set of
/// columns whose value the source did not re-emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
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

impl RawRecord {
    /// Decoded record type, if the wire value is valid.
    pub fn kind(&self) -> Option<RecordType> {
        RecordType::from_i32(self.record_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RawRecord {
        RawRecord {
            uid: "0195f0a1".to_string(),
            timestamp: 42,
            destination_table_name: "public_orders".to_string(),
            data: r#"{"id":1,"v":"x"}"#.to_string(),
            record_type: 0,
            match_data: String::new(),
            batch_id: 7,
            unchanged_toast_columns: String::new(),
        }
    }

    #[test]
    fn test_record_type_encoding() {
        assert_eq!(RecordType::Insert.as_i32(), 0);
        assert_eq!(RecordType::Update.as_i32(), 1);
        assert_eq!(RecordType::Delete.as_i32(), 2);
        assert_eq!(RecordType::from_i32(2), Some(RecordType::Delete));
        assert_eq!(RecordType::from_i32(3), None);
    }

    #[test]
    fn test_sign_encoding_by_integer_division() {
        // The planner relies on intDiv(record_type, 2) for the tombstone flag.
        for (ty, expected_sign) in [(0, 0), (1, 0), (2, 1)] {
            assert_eq!(ty / 2, expected_sign);
        }
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        let obj = json.as_object().unwrap();
        for field in [
            "_peerdb_uid",
            "_peerdb_timestamp",
            "_peerdb_destination_table_name",
            "_peerdb_data",
            "_peerdb_record_type",
            "_peerdb_match_data",
            "_peerdb_batch_id",
            "_peerdb_unchanged_toast_columns",
        ] {
            assert!(obj.contains_key(field), "missing wire field {field}");
        }
        assert_eq!(obj.len(), 8);
    }

    #[test]
    fn test_roundtrip() {
        let rec = sample();
        let json = serde_json::to_string(&rec).unwrap();
        let back: RawRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rec);
        assert_eq!(back.kind(), Some(RecordType::Insert));
    }
}
