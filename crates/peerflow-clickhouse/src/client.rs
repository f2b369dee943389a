//! Destination client
//!
//! [`Destination`] is the seam between the engine and the warehouse: a
//! shared connection for the coordinator plus the ability to open fresh
//! connections for extra normalize workers. The engine never branches on
//! destination identity; everything it needs is this capability set.
//!
//! [`ClickHouseDestination`] implements it over the official `clickhouse`
//! HTTP client with native `RowBinary` encoding and optional LZ4
//! compression on the wire.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;
use validator::Validate;

use peerflow_core::{NormalizeError, RawRecord, Result};

use crate::raw_table::RawRow;

/// One destination connection.
///
/// All methods must be safe for concurrent use across *different*
/// connections; a single connection is used by one worker at a time.
#[async_trait]
pub trait DestinationClient: Send + Sync + 'static {
    /// Run a statement, discarding any result.
    async fn execute(&self, sql: &str) -> Result<()>;

    /// Run a single-column query returning strings.
    async fn query_strings(&self, sql: &str) -> Result<Vec<String>>;

    /// Append raw change records via the native insert path.
    async fn insert_raw(&self, table: &str, rows: &[RawRecord]) -> Result<()>;

    /// Whether a table exists in the given database.
    async fn check_table_exists(&self, database: &str, table: &str) -> Result<bool>;
}

/// A destination warehouse: a shared connection plus a connection factory.
#[async_trait]
pub trait Destination: Send + Sync + 'static {
    type Client: DestinationClient;

    /// The shared connection (used by the coordinator and worker 0).
    fn client(&self) -> &Self::Client;

    /// Open a fresh connection for an extra worker; dropped on worker exit.
    async fn connect(&self) -> Result<Self::Client>;

    /// Database the flow's tables live in.
    fn database(&self) -> &str;
}

// ─────────────────────────────────────────────────────────────────
// ClickHouse implementation
// ─────────────────────────────────────────────────────────────────

/// Compression for ClickHouse inserts and queries.
#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClickHouseCompression {
    None,
    /// LZ4, ClickHouse native (default).
    #[default]
    Lz4,
}

/// Connection configuration for a ClickHouse destination.
#[derive(Debug, Clone, Deserialize, Serialize, Validate, JsonSchema)]
pub struct ClickHouseConfig {
    /// HTTP(S) endpoint, e.g. `http://localhost:8123`.
    #[validate(length(min = 1, max = 2048), url)]
    pub url: String,

    /// Database holding the raw and normalized tables.
    #[serde(default = "default_database")]
    #[validate(length(min = 1, max = 255))]
    pub database: String,

    #[serde(default = "default_username")]
    #[validate(length(min = 1, max = 255))]
    pub username: String,

    #[serde(default)]
    pub password: Option<String>,

    /// JWT for ClickHouse Cloud; mutually exclusive with `password`.
    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default)]
    pub compression: ClickHouseCompression,
}

fn default_database() -> String {
    "default".to_string()
}

fn default_username() -> String {
    "default".to_string()
}

impl ClickHouseConfig {
    /// Exactly one credential source may be configured.
    pub fn validate_auth(&self) -> Result<()> {
        if self.password.is_some() && self.access_token.is_some() {
            return Err(NormalizeError::config(
                "only one of 'password' or 'access_token' may be set",
            ));
        }
        Ok(())
    }

    fn build_client(&self) -> clickhouse::Client {
        let mut client = clickhouse::Client::default()
            .with_url(&self.url)
            .with_database(&self.database)
            .with_user(&self.username);
        if let Some(password) = &self.password {
            client = client.with_password(password);
        }
        if let Some(token) = &self.access_token {
            client = client.with_access_token(token);
        }
        match self.compression {
            ClickHouseCompression::Lz4 => {
                client = client.with_compression(clickhouse::Compression::Lz4);
            }
            ClickHouseCompression::None => {
                client = client.with_compression(clickhouse::Compression::None);
            }
        }
        client
    }
}

/// One ClickHouse connection.
pub struct ClickHouseClient {
    inner: clickhouse::Client,
}

#[async_trait]
impl DestinationClient for ClickHouseClient {
    async fn execute(&self, sql: &str) -> Result<()> {
        self.inner
            .query(sql)
            .execute()
            .await
            .map_err(|e| NormalizeError::destination(e.to_string()))
    }

    async fn query_strings(&self, sql: &str) -> Result<Vec<String>> {
        self.inner
            .query(sql)
            .fetch_all::<String>()
            .await
            .map_err(|e| NormalizeError::destination(e.to_string()))
    }

    async fn insert_raw(&self, table: &str, rows: &[RawRecord]) -> Result<()> {
        let mut insert = self
            .inner
            .insert::<RawRow>(table)
            .await
            .map_err(|e| NormalizeError::destination(format!("failed to begin insert: {e}")))?;
        for record in rows {
            insert
                .write(&RawRow::from(record))
                .await
                .map_err(|e| NormalizeError::destination(format!("failed to write row: {e}")))?;
        }
        insert
            .end()
            .await
            .map_err(|e| NormalizeError::destination(format!("failed to commit insert: {e}")))
    }

    async fn check_table_exists(&self, database: &str, table: &str) -> Result<bool> {
        let count = self
            .inner
            .query("SELECT count() FROM system.tables WHERE database = ? AND name = ?")
            .bind(database)
            .bind(table)
            .fetch_one::<u64>()
            .await
            .map_err(|e| NormalizeError::destination(e.to_string()))?;
        Ok(count > 0)
    }
}

/// ClickHouse destination: a shared connection plus a connection factory.
pub struct ClickHouseDestination {
    config: ClickHouseConfig,
    shared: ClickHouseClient,
}

impl ClickHouseDestination {
    pub fn new(config: ClickHouseConfig) -> Result<Self> {
        config.validate_auth()?;
        let shared = ClickHouseClient {
            inner: config.build_client(),
        };
        Ok(Self { config, shared })
    }
}

#[async_trait]
impl Destination for ClickHouseDestination {
    type Client = ClickHouseClient;

    fn client(&self) -> &Self::Client {
        &self.shared
    }

    async fn connect(&self) -> Result<Self::Client> {
        debug!(url = %self.config.url, "opening additional clickhouse connection");
        Ok(ClickHouseClient {
            inner: self.config.build_client(),
        })
    }

    fn database(&self) -> &str {
        &self.config.database
    }
}
