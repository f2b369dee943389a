//! Per-invocation dynamic settings
//!
//! Knobs are read from the flow's `env` string map at the start of every
//! invocation, so operators can re-tune a running mirror without a restart.
//! Unknown keys are ignored; unparseable values are configuration errors.

use std::collections::HashMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{NormalizeError, Result};

/// Env key for the normalize worker count.
pub const ENV_PARALLEL_NORMALIZE: &str = "PEERDB_CLICKHOUSE_PARALLEL_NORMALIZE";
/// Env key for the per-table partition count.
pub const ENV_NORMALIZATION_PARTS: &str = "PEERDB_CLICKHOUSE_NORMALIZATION_PARTS";
/// Env key enabling the primary-key-update tombstone branch.
pub const ENV_ENABLE_PRIMARY_UPDATE: &str = "PEERDB_CLICKHOUSE_ENABLE_PRIMARY_UPDATE";
/// Env key lifting every destination column to nullable.
pub const ENV_NULLABLE: &str = "PEERDB_NULLABLE";
/// Env key selecting the bytes projection mode.
pub const ENV_BINARY_FORMAT: &str = "PEERDB_BINARY_FORMAT";
/// Env key for raw-table retention, in batches (0 disables the TTL).
pub const ENV_RAW_TTL_BATCHES: &str = "PEERDB_CLICKHOUSE_RAW_TTL_BATCHES";

/// How bytes columns are materialized from their base64 JSON encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BinaryFormat {
    /// `base64Decode(...)`: destination column holds the raw bytes.
    #[default]
    Raw,
    /// `hex(base64Decode(...))`: destination column holds hex text.
    Hex,
}

impl BinaryFormat {
    fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "hex" => Ok(Self::Hex),
            other => Err(NormalizeError::config(format!(
                "{ENV_BINARY_FORMAT}: unknown binary format '{other}' (expected raw or hex)"
            ))),
        }
    }
}

/// Resolved per-invocation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate, JsonSchema)]
pub struct NormalizeSettings {
    /// Worker connection count; clamped to the table count at run time.
    #[serde(default = "default_parallel_normalize")]
    #[validate(range(min = 1, max = 64))]
    pub parallel_normalize: u32,

    /// Hash partitions per table; 1 disables partition pruning.
    #[serde(default = "default_normalization_parts")]
    #[validate(range(min = 1, max = 1024))]
    pub normalization_parts: u32,

    /// Emit the tombstone branch for updates that move a row across
    /// primary-key values.
    #[serde(default)]
    pub enable_primary_update: bool,

    /// Lift every destination column to nullable.
    #[serde(default)]
    pub nullable: bool,

    /// Bytes projection mode.
    #[serde(default)]
    pub binary_format: BinaryFormat,

    /// Raw-table retention in batches; 0 leaves the raw table unbounded.
    #[serde(default)]
    pub raw_ttl_batches: u32,
}

fn default_parallel_normalize() -> u32 {
    1
}

fn default_normalization_parts() -> u32 {
    1
}

impl Default for NormalizeSettings {
    fn default() -> Self {
        Self {
            parallel_normalize: default_parallel_normalize(),
            normalization_parts: default_normalization_parts(),
            enable_primary_update: false,
            nullable: false,
            binary_format: BinaryFormat::default(),
            raw_ttl_batches: 0,
        }
    }
}

impl NormalizeSettings {
    /// Resolve settings from a flow env map. Missing keys take defaults.
    pub fn from_env(env: &HashMap<String, String>) -> Result<Self> {
        let mut settings = Self::default();
        if let Some(v) = env.get(ENV_PARALLEL_NORMALIZE) {
            settings.parallel_normalize = parse_u32(ENV_PARALLEL_NORMALIZE, v)?.max(1);
        }
        if let Some(v) = env.get(ENV_NORMALIZATION_PARTS) {
            settings.normalization_parts = parse_u32(ENV_NORMALIZATION_PARTS, v)?.max(1);
        }
        if let Some(v) = env.get(ENV_ENABLE_PRIMARY_UPDATE) {
            settings.enable_primary_update = parse_bool(ENV_ENABLE_PRIMARY_UPDATE, v)?;
        }
        if let Some(v) = env.get(ENV_NULLABLE) {
            settings.nullable = parse_bool(ENV_NULLABLE, v)?;
        }
        if let Some(v) = env.get(ENV_BINARY_FORMAT) {
            settings.binary_format = BinaryFormat::parse(v)?;
        }
        if let Some(v) = env.get(ENV_RAW_TTL_BATCHES) {
            settings.raw_ttl_batches = parse_u32(ENV_RAW_TTL_BATCHES, v)?;
        }
        Ok(settings)
    }
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| NormalizeError::config(format!("{key}: expected an integer, got '{value}'")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "yes" | "on" => Ok(true),
        "false" | "f" | "0" | "no" | "off" => Ok(false),
        _ => Err(NormalizeError::config(format!(
            "{key}: expected a boolean, got '{value}'"
        ))),
    }
}
