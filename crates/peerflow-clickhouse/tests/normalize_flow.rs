//! End-to-end normalize scenarios
//!
//! Drives the full coordinator path (stage load → plan → execute →
//! pointer advance) against the mock destination and the in-memory
//! catalog. Assertions are on the captured SQL, the raw rows absorbed by
//! the destination, and the batch pointers - the pieces the engine owns.
//! Destination-side merge semantics (version collapse) are ClickHouse's
//! contract, pinned here only through the generated SQL.

use std::collections::HashMap;
use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use peerflow_catalog::{Catalog, MemoryCatalog};
use peerflow_core::settings::{
    ENV_ENABLE_PRIMARY_UPDATE, ENV_NORMALIZATION_PARTS, ENV_PARALLEL_NORMALIZE,
};
use peerflow_core::{
    FieldDescription, NormalizeError, QKind, RawRecord, TableMapping, TableSchema,
};
use peerflow_clickhouse::testing::MockDestination;
use peerflow_clickhouse::{AvroStage, NormalizeEngine, NormalizeRequest, NormalizeResponse};

// ============================================================================
// Fixtures
// ============================================================================

struct Flow {
    engine: NormalizeEngine<MockDestination, MemoryCatalog>,
    destination: Arc<MockDestination>,
    catalog: Arc<MemoryCatalog>,
    stage: AvroStage,
    _dir: TempDir,
}

fn flow() -> Flow {
    let dir = TempDir::new().unwrap();
    let destination = Arc::new(MockDestination::new());
    let catalog = Arc::new(MemoryCatalog::new());
    let stage = AvroStage::new(dir.path());
    let engine = NormalizeEngine::new(destination.clone(), catalog.clone(), stage.clone());
    Flow {
        engine,
        destination,
        catalog,
        stage,
        _dir: dir,
    }
}

fn orders_schema() -> TableSchema {
    TableSchema::new("public.orders")
        .with_column(FieldDescription::new("id", QKind::Int32))
        .with_column(FieldDescription::new("v", QKind::String))
        .with_primary_keys(["id"])
}

fn request(flow_name: &str, sync_batch_id: i64, tables: &[(&str, TableSchema)]) -> NormalizeRequest {
    let mut table_schema_mapping = HashMap::new();
    let mut table_mappings = Vec::new();
    for (dest, schema) in tables {
        table_schema_mapping.insert(dest.to_string(), schema.clone());
        table_mappings.push(TableMapping::new(
            schema.table_identifier.clone(),
            dest.to_string(),
        ));
    }
    NormalizeRequest {
        flow_job_name: flow_name.to_string(),
        sync_batch_id,
        table_mappings,
        table_schema_mapping,
        env: HashMap::new(),
    }
}

fn raw(
    uid: &str,
    ts: i64,
    table: &str,
    record_type: i32,
    data: &str,
    match_data: &str,
    batch_id: i64,
) -> RawRecord {
    RawRecord {
        uid: uid.to_string(),
        timestamp: ts,
        destination_table_name: table.to_string(),
        data: data.to_string(),
        record_type,
        match_data: match_data.to_string(),
        batch_id,
        unchanged_toast_columns: String::new(),
    }
}

// ============================================================================
// S1 - simple insert/update/delete
// ============================================================================

#[tokio::test]
async fn s1_insert_update_delete_single_window() {
    let f = flow();
    f.stage
        .write_batch(
            "mirror",
            1,
            &[
                raw("a", 1, "orders", 0, r#"{"id":1,"v":"x"}"#, "", 1),
                raw("b", 2, "orders", 1, r#"{"id":1,"v":"y"}"#, "", 1),
                raw("c", 3, "orders", 2, r#"{"id":1}"#, "", 1),
            ],
        )
        .await
        .unwrap();

    let resp = f
        .engine
        .normalize_records(
            &request("mirror", 1, &[("orders", orders_schema())]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(resp, NormalizeResponse { start_batch_id: 1, end_batch_id: 1 });
    // All three changes landed in the raw table.
    assert_eq!(f.destination.raw_rows().len(), 3);

    // One plan, materializing the tombstone flag from the record type and
    // the version from the arrival timestamp: the replacing engine then
    // collapses id=1 to (v='y', is_deleted=1, version=3).
    let executed = f.destination.executed();
    assert_eq!(executed.len(), 1);
    let sql = &executed[0];
    assert!(sql.starts_with(
        "INSERT INTO `orders` (`id`,`v`,`_peerdb_is_deleted`,`_peerdb_version`)"
    ));
    assert!(sql.contains("intDiv(_peerdb_record_type, 2) AS `_peerdb_is_deleted`"));
    assert!(sql.contains("_peerdb_timestamp AS `_peerdb_version`"));
    assert!(sql.contains("_peerdb_batch_id > 0 AND _peerdb_batch_id <= 1"));

    // Monotone progress: the pointer moved exactly to the sync id.
    assert_eq!(f.catalog.last_normalize_batch_id("mirror").await.unwrap(), 1);
}

// ============================================================================
// S2 - primary-key change with primary update enabled
// ============================================================================

#[tokio::test]
async fn s2_pk_change_emits_tombstone_branch() {
    let f = flow();
    f.stage
        .write_batch(
            "mirror",
            1,
            &[
                raw("a", 1, "orders", 0, r#"{"id":1,"v":"x"}"#, "", 1),
                raw(
                    "b",
                    2,
                    "orders",
                    1,
                    r#"{"id":2,"v":"x"}"#,
                    r#"{"id":1,"v":"x"}"#,
                    1,
                ),
            ],
        )
        .await
        .unwrap();

    let mut req = request("mirror", 1, &[("orders", orders_schema())]);
    req.env
        .insert(ENV_ENABLE_PRIMARY_UPDATE.to_string(), "true".to_string());

    f.engine
        .normalize_records(&req, &CancellationToken::new())
        .await
        .unwrap();

    let executed = f.destination.executed();
    assert_eq!(executed.len(), 1);
    let sql = &executed[0];

    // The pre-image branch selects from match data, forces the tombstone
    // flag, and versions the tombstone one tick before the new image, so
    // id=1 collapses to (is_deleted=1, version=1) and id=2 to
    // (is_deleted=0, version=2).
    assert!(sql.contains("UNION ALL"));
    assert!(sql.contains("JSONExtract(_peerdb_match_data, 'id', 'Int32') AS `id`"));
    assert!(sql.contains("1 AS `_peerdb_is_deleted`"));
    assert!(sql.contains("_peerdb_timestamp - 1 AS `_peerdb_version`"));
    assert!(sql.contains("_peerdb_record_type = 1"));
    assert!(sql.contains("_peerdb_match_data != ''"));
}

// ============================================================================
// S6 - crash mid-execute, rerun converges
// ============================================================================

#[tokio::test]
async fn s6_crash_mid_execute_then_rerun() {
    let f = flow();
    let tables: Vec<(&str, TableSchema)> = vec![
        ("t_a", TableSchema::new("public.a")
            .with_column(FieldDescription::new("id", QKind::Int64))
            .with_primary_keys(["id"])),
        ("t_b", TableSchema::new("public.b")
            .with_column(FieldDescription::new("id", QKind::Int64))
            .with_primary_keys(["id"])),
        ("t_c", TableSchema::new("public.c")
            .with_column(FieldDescription::new("id", QKind::Int64))
            .with_primary_keys(["id"])),
    ];
    f.stage
        .write_batch(
            "mirror",
            1,
            &[
                raw("a", 1, "t_a", 0, r#"{"id":1}"#, "", 1),
                raw("b", 2, "t_b", 0, r#"{"id":1}"#, "", 1),
                raw("c", 3, "t_c", 0, r#"{"id":1}"#, "", 1),
            ],
        )
        .await
        .unwrap();

    // One worker so the failing plan deterministically interrupts the run.
    let mut req = request("mirror", 1, &tables);
    req.env
        .insert(ENV_PARALLEL_NORMALIZE.to_string(), "1".to_string());

    // First run: the second table's plan dies.
    f.destination.fail_times("INSERT INTO `t_b`", 1);
    let err = f
        .engine
        .normalize_records(&req, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, NormalizeError::Plan { .. }));

    // Failure leaves the pointer untouched.
    assert_eq!(f.catalog.last_normalize_batch_id("mirror").await.unwrap(), 0);
    let first_run = f.destination.executed();
    let first_inserts = first_run
        .iter()
        .filter(|sql| sql.starts_with("INSERT INTO"))
        .count();
    assert!(first_inserts < 3, "crash must leave work undone");

    // Rerun: the same window replays in full and the pointer advances.
    let resp = f
        .engine
        .normalize_records(&req, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp, NormalizeResponse { start_batch_id: 1, end_batch_id: 1 });
    assert_eq!(f.catalog.last_normalize_batch_id("mirror").await.unwrap(), 1);

    let rerun: Vec<_> = f.destination.executed()[first_run.len()..].to_vec();
    for table in ["t_a", "t_b", "t_c"] {
        assert!(
            rerun.iter().any(|sql| sql.contains(&format!("`{table}`"))),
            "rerun must re-execute every plan, missing {table}"
        );
    }
    // The raw rows were staged twice; the per-uid de-dup window keeps the
    // replay from double-materializing a change.
    assert_eq!(f.destination.raw_rows().len(), 6);
    assert!(rerun.iter().all(|sql| {
        !sql.starts_with("INSERT INTO") || sql.contains("LIMIT 1 BY _peerdb_uid")
    }));
}

// ============================================================================
// Partitioned windows
// ============================================================================

#[tokio::test]
async fn partitioned_run_emits_disjoint_plans() {
    let f = flow();
    f.stage
        .write_batch(
            "mirror",
            1,
            &[
                raw("a", 1, "orders", 0, r#"{"id":1,"v":"x"}"#, "", 1),
                raw("b", 2, "orders", 0, r#"{"id":2,"v":"y"}"#, "", 1),
            ],
        )
        .await
        .unwrap();

    let mut req = request("mirror", 1, &[("orders", orders_schema())]);
    req.env
        .insert(ENV_NORMALIZATION_PARTS.to_string(), "4".to_string());

    f.engine
        .normalize_records(&req, &CancellationToken::new())
        .await
        .unwrap();

    let inserts: Vec<_> = f
        .destination
        .executed()
        .into_iter()
        .filter(|sql| sql.starts_with("INSERT INTO `orders`"))
        .collect();
    assert_eq!(inserts.len(), 4);
    for part in 0..4 {
        assert!(
            inserts
                .iter()
                .any(|sql| sql.contains(&format!("cityHash64(_peerdb_uid) % 4 = {part}"))),
            "missing partition {part}"
        );
    }
}

// ============================================================================
// Multi-batch windows
// ============================================================================

#[tokio::test]
async fn multi_batch_window_loads_every_stage_in_order() {
    let f = flow();
    for batch_id in 1..=3 {
        f.stage
            .write_batch(
                "mirror",
                batch_id,
                &[raw(
                    &format!("u{batch_id}"),
                    batch_id,
                    "orders",
                    0,
                    r#"{"id":1,"v":"x"}"#,
                    "",
                    batch_id,
                )],
            )
            .await
            .unwrap();
    }

    let resp = f
        .engine
        .normalize_records(
            &request("mirror", 3, &[("orders", orders_schema())]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(resp, NormalizeResponse { start_batch_id: 1, end_batch_id: 3 });

    // Batches copied ascending.
    let batch_ids: Vec<i64> = f.destination.raw_rows().iter().map(|r| r.batch_id).collect();
    assert_eq!(batch_ids, vec![1, 2, 3]);

    // The single plan covers the whole window.
    let executed = f.destination.executed();
    assert!(executed[0].contains("_peerdb_batch_id > 0 AND _peerdb_batch_id <= 3"));

    // A later invocation with no new batches is a no-op.
    let resp = f
        .engine
        .normalize_records(
            &request("mirror", 3, &[("orders", orders_schema())]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(resp, NormalizeResponse { start_batch_id: 3, end_batch_id: 3 });
    assert_eq!(f.destination.executed().len(), executed.len());
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test]
async fn cancellation_skips_pointer_advance() {
    let f = flow();
    f.stage
        .write_batch(
            "mirror",
            1,
            &[raw("a", 1, "orders", 0, r#"{"id":1,"v":"x"}"#, "", 1)],
        )
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = f
        .engine
        .normalize_records(
            &request("mirror", 1, &[("orders", orders_schema())]),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, NormalizeError::Cancelled));
    assert_eq!(f.catalog.last_normalize_batch_id("mirror").await.unwrap(), 0);
}
