//! Error types for the migration library.

use std::time::Duration;

use thiserror::Error;

use crate::migrator::MigrationRunSummary;
use crate::model::{DestinationId, EntityKind, SourceId};

/// How a failure should be handled by the collector and migrator.
///
/// Both phases consult [`MigrateError::class`] instead of matching on
/// variants themselves, so retry and abort decisions stay in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeout, 429, 5xx. Retried with backoff; never advances progress.
    Transient,
    /// Affects a single record. Counted in the batch result, batch continues.
    Record,
    /// Progress or connectivity can no longer be trusted. Aborts the page/batch.
    Systemic,
}

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rate limiting, server errors and connection failures.
    #[error("Transient API error during {operation}: {message}")]
    TransientApi {
        operation: String,
        message: String,
        retry_after: Option<Duration>,
    },

    /// An external call did not complete within its timeout.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// Transient failures persisted past the retry budget.
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    /// Destination rejected the payload.
    #[error("Validation rejected during {operation}: {message}")]
    Validation { operation: String, message: String },

    /// An identity link already exists with a different destination id.
    #[error(
        "Identity conflict for {kind} {source_id}: linked to {existing}, attempted {attempted}"
    )]
    Conflict {
        kind: EntityKind,
        source_id: SourceId,
        existing: DestinationId,
        attempted: DestinationId,
    },

    /// Credentials rejected (401/403).
    #[error("Authentication failed during {operation}: {message}")]
    Auth { operation: String, message: String },

    /// Any other unexpected API response.
    #[error("API error during {operation} (HTTP {status}): {message}")]
    Api {
        operation: String,
        status: u16,
        message: String,
    },

    /// Staging store read/write failure.
    #[error("Staging store error: {0}")]
    Storage(String),

    /// A page commit would not move collection progress forward.
    #[error("Refusing to commit {kind} page {attempted}: progress is already at page {last_completed}")]
    ProgressRegression {
        kind: EntityKind,
        last_completed: i64,
        attempted: i64,
    },

    /// Staged payload is missing attributes needed for the destination.
    #[error("Invalid {kind} payload: {message}")]
    InvalidPayload { kind: EntityKind, message: String },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Run was stopped at a page/batch boundary (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,

    /// A migration run hit a systemic failure. Carries the totals of the
    /// work completed before it, including the interrupted batch.
    #[error("Migration run {} aborted", .summary.run_id)]
    Aborted {
        summary: Box<MigrationRunSummary>,
        #[source]
        source: Box<MigrateError>,
    },
}

impl From<rusqlite::Error> for MigrateError {
    fn from(e: rusqlite::Error) -> Self {
        MigrateError::Storage(e.to_string())
    }
}

impl From<tokio_postgres::Error> for MigrateError {
    fn from(e: tokio_postgres::Error) -> Self {
        MigrateError::Storage(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for MigrateError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        MigrateError::Storage(format!("pool: {}", e))
    }
}

impl MigrateError {
    /// Create a transient API error without a server retry hint.
    pub fn transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::TransientApi {
            operation: operation.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Create a validation error.
    pub fn validation(operation: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Validation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create an invalid payload error.
    pub fn invalid_payload(kind: EntityKind, message: impl Into<String>) -> Self {
        MigrateError::InvalidPayload {
            kind,
            message: message.into(),
        }
    }

    /// Wrap a systemic failure together with the partial run totals.
    pub fn aborted(summary: MigrationRunSummary, source: MigrateError) -> Self {
        MigrateError::Aborted {
            summary: Box::new(summary),
            source: Box::new(source),
        }
    }

    /// The failure that caused an abort, or `self`.
    pub fn root(&self) -> &MigrateError {
        match self {
            MigrateError::Aborted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Failure classification shared by the collector and the migrator.
    pub fn class(&self) -> FailureClass {
        match self {
            MigrateError::Aborted { source, .. } => source.class(),
            MigrateError::TransientApi { .. } | MigrateError::Timeout { .. } => {
                FailureClass::Transient
            }
            MigrateError::Validation { .. }
            | MigrateError::Conflict { .. }
            | MigrateError::Api { .. }
            | MigrateError::InvalidPayload { .. } => FailureClass::Record,
            _ => FailureClass::Systemic,
        }
    }

    /// Server-provided backoff hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            MigrateError::TransientApi { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Aborted { source, .. } => source.exit_code(),
            MigrateError::Config(_) | MigrateError::Yaml(_) => 1,
            MigrateError::TransientApi { .. }
            | MigrateError::Timeout { .. }
            | MigrateError::RetriesExhausted { .. }
            | MigrateError::Validation { .. }
            | MigrateError::Auth { .. }
            | MigrateError::Api { .. } => 2,
            MigrateError::Storage(_) | MigrateError::ProgressRegression { .. } => 3,
            MigrateError::Conflict { .. } | MigrateError::InvalidPayload { .. } => 4,
            MigrateError::Cancelled => 5,
            MigrateError::Json(_) => 6,
            MigrateError::Io(_) => 7,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert_eq!(
            MigrateError::transient("list customers", "HTTP 503").class(),
            FailureClass::Transient
        );
        let timeout = MigrateError::Timeout {
            operation: "create customer".into(),
            after: Duration::from_secs(30),
        };
        assert_eq!(timeout.class(), FailureClass::Transient);
    }

    #[test]
    fn test_record_errors_do_not_abort() {
        let conflict = MigrateError::Conflict {
            kind: EntityKind::Customer,
            source_id: 42,
            existing: 1,
            attempted: 2,
        };
        assert_eq!(conflict.class(), FailureClass::Record);
        assert_eq!(
            MigrateError::validation("create customer", "email is invalid").class(),
            FailureClass::Record
        );
    }

    #[test]
    fn test_storage_and_exhaustion_are_systemic() {
        assert_eq!(
            MigrateError::Storage("disk full".into()).class(),
            FailureClass::Systemic
        );
        let exhausted = MigrateError::RetriesExhausted {
            operation: "list orders".into(),
            attempts: 3,
            last_error: "HTTP 502".into(),
        };
        assert_eq!(exhausted.class(), FailureClass::Systemic);
        let auth = MigrateError::Auth {
            operation: "create customer".into(),
            message: "invalid token".into(),
        };
        assert_eq!(auth.class(), FailureClass::Systemic);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("x".into()).exit_code(), 1);
        assert_eq!(MigrateError::Storage("x".into()).exit_code(), 3);
        assert_eq!(MigrateError::Cancelled.exit_code(), 5);
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(MigrateError::from(io).exit_code(), 7);
    }

    #[test]
    fn test_retry_after_hint() {
        let err = MigrateError::TransientApi {
            operation: "create order".into(),
            message: "HTTP 429".into(),
            retry_after: Some(Duration::from_secs(2)),
        };
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert_eq!(MigrateError::Cancelled.retry_after(), None);
    }

    #[test]
    fn test_aborted_run_reports_its_cause() {
        let summary = MigrationRunSummary::new("run-1".into(), EntityKind::Customer, false);
        let err = MigrateError::aborted(
            summary,
            MigrateError::Auth {
                operation: "create customer".into(),
                message: "HTTP 401".into(),
            },
        );
        assert_eq!(err.class(), FailureClass::Systemic);
        assert_eq!(err.exit_code(), 2);
        assert!(matches!(err.root(), MigrateError::Auth { .. }));

        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: Migration run run-1 aborted"));
        assert!(detailed.contains("Authentication failed during create customer"));
    }
}
