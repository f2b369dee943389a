//! Test doubles for the destination seam
//!
//! [`MockDestination`] records every statement and raw insert instead of
//! talking to a server, answers the planner's distinct-table query from
//! the rows it has absorbed, and can inject failures on statements
//! matching a substring. Scenario tests assert on the captured SQL.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use peerflow_core::{NormalizeError, RawRecord, Result};

use crate::client::{Destination, DestinationClient};

#[derive(Default)]
struct MockState {
    executed: Mutex<Vec<String>>,
    raw_rows: Mutex<Vec<RawRecord>>,
    existing_tables: Mutex<HashSet<String>>,
    /// `(substring, remaining_failures)`
    failure: Mutex<Option<(String, usize)>>,
    connections_opened: AtomicUsize,
}

/// One mock connection; all connections share the destination's state.
#[derive(Clone)]
pub struct MockClient {
    state: Arc<MockState>,
}

#[async_trait]
impl DestinationClient for MockClient {
    async fn execute(&self, sql: &str) -> Result<()> {
        {
            let mut failure = self.state.failure.lock().unwrap();
            if let Some((pattern, remaining)) = failure.as_mut() {
                if *remaining > 0 && sql.contains(pattern.as_str()) {
                    *remaining -= 1;
                    return Err(NormalizeError::destination(format!(
                        "injected failure on statement matching '{pattern}'"
                    )));
                }
            }
        }
        self.state.executed.lock().unwrap().push(sql.to_string());
        Ok(())
    }

    async fn query_strings(&self, sql: &str) -> Result<Vec<String>> {
        if sql.contains("SELECT DISTINCT _peerdb_destination_table_name") {
            let rows = self.state.raw_rows.lock().unwrap();
            let mut seen = HashSet::new();
            let mut tables = Vec::new();
            for row in rows.iter() {
                if seen.insert(row.destination_table_name.clone()) {
                    tables.push(row.destination_table_name.clone());
                }
            }
            return Ok(tables);
        }
        Ok(Vec::new())
    }

    async fn insert_raw(&self, _table: &str, rows: &[RawRecord]) -> Result<()> {
        self.state.raw_rows.lock().unwrap().extend_from_slice(rows);
        Ok(())
    }

    async fn check_table_exists(&self, _database: &str, table: &str) -> Result<bool> {
        Ok(self.state.existing_tables.lock().unwrap().contains(table))
    }
}

/// In-memory destination for scenario tests.
pub struct MockDestination {
    state: Arc<MockState>,
    shared: MockClient,
}

impl Default for MockDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDestination {
    pub fn new() -> Self {
        let state = Arc::new(MockState::default());
        let shared = MockClient {
            state: state.clone(),
        };
        Self { state, shared }
    }

    /// Fail the next `times` executed statements containing `pattern`.
    pub fn fail_times(&self, pattern: impl Into<String>, times: usize) {
        *self.state.failure.lock().unwrap() = Some((pattern.into(), times));
    }

    /// Pretend a table already exists.
    pub fn add_existing_table(&self, table: impl Into<String>) {
        self.state
            .existing_tables
            .lock()
            .unwrap()
            .insert(table.into());
    }

    /// Every successfully executed statement, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state.executed.lock().unwrap().clone()
    }

    /// Raw rows absorbed through `insert_raw`.
    pub fn raw_rows(&self) -> Vec<RawRecord> {
        self.state.raw_rows.lock().unwrap().clone()
    }

    /// Fresh connections opened beyond the shared one.
    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Destination for MockDestination {
    type Client = MockClient;

    fn client(&self) -> &Self::Client {
        &self.shared
    }

    async fn connect(&self) -> Result<Self::Client> {
        self.state.connections_opened.fetch_add(1, Ordering::Relaxed);
        Ok(self.shared.clone())
    }

    fn database(&self) -> &str {
        "default"
    }
}
