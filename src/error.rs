//! Error types for resilient database access.
//!
//! This module defines all error types using `thiserror`. The variants follow the
//! propagation policy of the crate: liveness problems are recovered inside the pool,
//! schema and transaction-usage errors go to the immediate caller, and a failed pool
//! recovery is reported as [`DbError::Unrecoverable`] so the top-level supervisor can
//! decide to exit.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// PostgreSQL SQLSTATE for `undefined_table`.
pub const SQLSTATE_UNDEFINED_TABLE: &str = "42P01";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    /// The driver reports the selected connection no longer exists.
    #[error("Connection lost: {message}")]
    ConnectionLost { message: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        /// e.g., "42P01" for undefined table
        sql_state: Option<String>,
        suggestion: String,
    },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("{message}")]
    NoTransaction { message: String },

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Migration script {version:08} failed (database left at version {reached}): {source}")]
    Migration {
        version: i64,
        reached: i64,
        #[source]
        source: Box<DbError>,
    },

    #[error("Unrecoverable pool failure: {message}")]
    Unrecoverable { message: String },

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a broken-link error.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::ConnectionLost {
            message: message.into(),
        }
    }

    /// Create a database error with optional SQL state.
    pub fn database(
        message: impl Into<String>,
        sql_state: Option<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self::Database {
            message: message.into(),
            sql_state,
            suggestion: suggestion.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a no-active-transaction error.
    pub fn no_transaction(message: impl Into<String>) -> Self {
        Self::NoTransaction {
            message: message.into(),
        }
    }

    /// Create a transaction usage error.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    /// Wrap the error raised by a migration script.
    pub fn migration(version: i64, reached: i64, source: DbError) -> Self {
        Self::Migration {
            version,
            reached,
            source: Box::new(source),
        }
    }

    /// Create an unrecoverable pool error.
    pub fn unrecoverable(message: impl Into<String>) -> Self {
        Self::Unrecoverable {
            message: message.into(),
        }
    }

    /// Create a file read error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::Database { suggestion, .. } => Some(suggestion),
            Self::NoTransaction { .. } => Some("Enter the scope before issuing queries"),
            Self::Unrecoverable { .. } => Some("Restart the process"),
            _ => None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionLost { .. } | Self::Timeout { .. }
        )
    }

    /// True when the driver reported that the selected connection does not exist.
    pub fn is_broken_link(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }

    /// True when a statement failed because the referenced table does not exist.
    pub fn is_undefined_table(&self) -> bool {
        match self {
            Self::Database {
                message, sql_state, ..
            } => {
                sql_state.as_deref() == Some(SQLSTATE_UNDEFINED_TABLE)
                    || message.starts_with("no such table")
            }
            _ => false,
        }
    }

    /// True when the caller should stop the process rather than continue.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable { .. })
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::configuration(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::database(
                    db_err.message(),
                    code,
                    "Check the SQL syntax and referenced objects",
                )
            }
            sqlx::Error::RowNotFound => DbError::database(
                "No rows returned",
                None,
                "Verify the query conditions match existing data",
            ),
            sqlx::Error::PoolTimedOut => {
                DbError::timeout("connection pool acquire", Duration::ZERO)
            }
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::Io(io_err) => DbError::connection_lost(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::Protocol(msg) => DbError::connection(
                format!("Protocol error: {}", msg),
                "Check database server compatibility",
            ),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::invalid_input(format!(
                "Column index {} out of bounds (len: {})",
                index, len
            )),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::internal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::internal(format!("Decode error: {}", source)),
            sqlx::Error::WorkerCrashed => DbError::connection_lost("Database worker crashed"),
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
