// ⚠️ Error Taxonomy
// Every backend failure is translated at the store boundary into one of these.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// CONNECTION ERRORS
// ============================================================================

/// Failure to open the durable store. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The process is not allowed to open or write the database
    #[error("access denied to database: {0}")]
    Authentication(String),

    /// The database does not exist and creating it was not requested
    #[error("database does not exist: {0}")]
    MissingDatabase(String),

    #[error("unable to connect to database: {0}")]
    Other(String),
}

// ============================================================================
// SCHEMA STATUS
// ============================================================================

/// Outcome of inspecting the persisted schema.
///
/// Only `Ok` lets the process continue. `NotSetup` and `NeedsUpgrade` are
/// recoverable through an explicit setup, `Error` is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaStatus {
    Ok,
    NotSetup,
    NeedsUpgrade,
    Error,
}

impl SchemaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaStatus::Ok => "ok",
            SchemaStatus::NotSetup => "not set up",
            SchemaStatus::NeedsUpgrade => "needs upgrade",
            SchemaStatus::Error => "error",
        }
    }

    /// Whether an explicit setup can bring the schema to `Ok`
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SchemaStatus::NotSetup | SchemaStatus::NeedsUpgrade)
    }
}

impl std::fmt::Display for SchemaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ENGINE ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("schema is not usable: {0}")]
    Schema(SchemaStatus),

    /// A public id or short id collided with an existing source
    #[error("duplicate identifier: {0}")]
    DuplicateIdentifier(String),

    #[error("no such source: {0}")]
    NotFound(String),

    /// Timestamps below 1 typically indicate a broken client clock
    #[error("timestamp must be at least 1, got {0}")]
    InvalidTimestamp(i64),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    #[error("aggregation mode '{0}' is not supported by this store")]
    UnsupportedAggregation(String),

    #[error("query execution failed: {0}")]
    QueryExecution(String),

    #[error("result stream was released and must not be reused")]
    StreamReleased,
}

impl Error {
    /// Errors caused by the caller rather than by the store
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::DuplicateIdentifier(_)
                | Error::NotFound(_)
                | Error::InvalidTimestamp(_)
                | Error::InvalidQuery(_)
                | Error::UnsupportedAggregation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
