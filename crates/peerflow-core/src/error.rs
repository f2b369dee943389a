//! Error types for normalization
//!
//! Errors crossing the engine boundary carry a classification so the
//! alerter can decide whether a failure needs a human.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of an error's origin, attached to outbound alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient network or driver failure (catalog or destination)
    Transient,
    /// Source schema no longer matches the mapping
    SchemaDrift,
    /// Raw window references a table absent from the mapping
    UnknownTable,
    /// Staged batch file is missing or unreadable
    MalformedStage,
    /// A normalize plan failed on the destination
    PlanExecution,
    /// Invocation was cancelled externally
    Cancelled,
    /// Everything else
    Internal,
}

impl ErrorClass {
    /// Stable name used in alert keys and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::SchemaDrift => "schema_drift",
            Self::UnknownTable => "unknown_table",
            Self::MalformedStage => "malformed_stage",
            Self::PlanExecution => "plan_execution",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller should do with a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Retry the whole invocation (orchestrator-side)
    Retry,
    /// Page a human
    NotifyCritical,
    /// Record for review
    NotifyWarning,
    /// Expected condition, logging is enough
    Ignore,
}

/// Errors produced by the normalization engine.
#[derive(Error, Debug)]
pub enum NormalizeError {
    /// Catalog read/write failed
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Destination query or connection failed
    #[error("destination error: {0}")]
    Destination(String),

    /// Staged batch file missing or unreadable
    #[error("stage error: {0}")]
    Stage(String),

    /// A single normalize plan failed
    #[error("plan error for table '{table}': {message}")]
    Plan { table: String, message: String },

    /// Raw window references a table the mapping does not know
    #[error("table '{0}' in raw window is not in the schema mapping")]
    UnknownTable(String),

    /// Mapping references columns the source schema no longer has
    #[error("schema error: {0}")]
    Schema(String),

    /// Invalid settings or mapping configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Invocation cancelled
    #[error("normalization cancelled")]
    Cancelled,

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NormalizeError {
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    pub fn destination(msg: impl Into<String>) -> Self {
        Self::Destination(msg.into())
    }

    pub fn stage(msg: impl Into<String>) -> Self {
        Self::Stage(msg.into())
    }

    pub fn plan(table: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Plan {
            table: table.into(),
            message: msg.into(),
        }
    }

    pub fn unknown_table(table: impl Into<String>) -> Self {
        Self::UnknownTable(table.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Origin classification, used as the alert key suffix.
    pub fn error_class(&self) -> ErrorClass {
        match self {
            Self::Catalog(_) | Self::Destination(_) | Self::Io(_) => ErrorClass::Transient,
            Self::Stage(_) => ErrorClass::MalformedStage,
            Self::Plan { .. } => ErrorClass::PlanExecution,
            Self::UnknownTable(_) => ErrorClass::UnknownTable,
            Self::Schema(_) => ErrorClass::SchemaDrift,
            Self::Cancelled => ErrorClass::Cancelled,
            Self::Config(_) | Self::Json(_) => ErrorClass::Internal,
        }
    }

    /// Policy decision for the alerter.
    pub fn error_action(&self) -> ErrorAction {
        match self.error_class() {
            ErrorClass::Transient => ErrorAction::Retry,
            ErrorClass::MalformedStage => ErrorAction::NotifyCritical,
            ErrorClass::PlanExecution | ErrorClass::Internal => ErrorAction::NotifyWarning,
            ErrorClass::SchemaDrift | ErrorClass::UnknownTable | ErrorClass::Cancelled => {
                ErrorAction::Ignore
            }
        }
    }

    /// Whether the orchestrator should retry the whole invocation.
    pub fn is_retriable(&self) -> bool {
        matches!(self.error_action(), ErrorAction::Retry)
    }
}

/// Result type for normalization operations.
pub type Result<T> = std::result::Result<T, NormalizeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NormalizeError::plan("public_orders", "memory limit exceeded");
        assert!(err.to_string().contains("public_orders"));
        assert!(err.to_string().contains("memory limit exceeded"));
    }

    #[test]
    fn test_error_class() {
        assert_eq!(
            NormalizeError::catalog("x").error_class(),
            ErrorClass::Transient
        );
        assert_eq!(
            NormalizeError::stage("x").error_class(),
            ErrorClass::MalformedStage
        );
        assert_eq!(
            NormalizeError::plan("t", "x").error_class(),
            ErrorClass::PlanExecution
        );
        assert_eq!(
            NormalizeError::unknown_table("t").error_class(),
            ErrorClass::UnknownTable
        );
        assert_eq!(NormalizeError::Cancelled.error_class(), ErrorClass::Cancelled);
    }

    #[test]
    fn test_error_action_policy() {
        // Transient failures bubble up and get retried wholesale.
        assert_eq!(
            NormalizeError::destination("x").error_action(),
            ErrorAction::Retry
        );
        // A broken stage file pages someone.
        assert_eq!(
            NormalizeError::stage("x").error_action(),
            ErrorAction::NotifyCritical
        );
        // Cancellation, drift, and mid-flight mapping changes are
        // expected operational states.
        assert_eq!(NormalizeError::Cancelled.error_action(), ErrorAction::Ignore);
        assert_eq!(
            NormalizeError::schema("x").error_action(),
            ErrorAction::Ignore
        );
        assert_eq!(
            NormalizeError::unknown_table("t").error_action(),
            ErrorAction::Ignore
        );
    }

    #[test]
    fn test_retriable() {
        assert!(NormalizeError::catalog("conn reset").is_retriable());
        assert!(!NormalizeError::config("bad knob").is_retriable());
        assert!(!NormalizeError::Cancelled.is_retriable());
    }
}
