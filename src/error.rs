//! Error types for dbscope.
//!
//! All fallible operations return [`DbResult`]. Engine failures are never
//! swallowed: they are wrapped with the name of the failing operation and
//! keep the original error as their source.

use thiserror::Error;

/// Boxed error coming from the underlying SQL engine.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("No module factory registered for {module}")]
    NotRegistered { module: &'static str },

    #[error("Cannot {operation} while {state} (context: {context_id})")]
    InvalidTransactionState {
        context_id: String,
        operation: &'static str,
        state: &'static str,
    },

    #[error(
        "Context {context_id} cannot be closed with an active transaction. Abort or commit before closing."
    )]
    ActiveTransaction { context_id: String },

    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    #[error("Engine error during {operation}: {source}")]
    Engine {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error(
        "Context {context_id} could not close {} resource(s): {}",
        failures.len(),
        summarize(failures)
    )]
    CloseAggregate {
        context_id: String,
        failures: Vec<DbError>,
    },

    #[error("Column not found: {column}")]
    ColumnNotFound { column: String },

    #[error("Cannot decode column {column}: {message}")]
    Decode { column: String, message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

fn summarize(failures: &[DbError]) -> String {
    failures
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl DbError {
    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Wrap an engine failure with the operation that produced it.
    pub fn engine(operation: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Engine {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn invalid_transaction_state(
        context_id: impl Into<String>,
        operation: &'static str,
        state: &'static str,
    ) -> Self {
        Self::InvalidTransactionState {
            context_id: context_id.into(),
            operation,
            state,
        }
    }

    pub fn active_transaction(context_id: impl Into<String>) -> Self {
        Self::ActiveTransaction {
            context_id: context_id.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn column_not_found(column: impl Into<String>) -> Self {
        Self::ColumnNotFound {
            column: column.into(),
        }
    }

    pub fn decode(column: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            column: column.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Get the suggestion for this error, if available.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::ActiveTransaction { .. } => {
                Some("Call commit_transaction() or abort_transaction() first")
            }
            Self::InvalidTransactionState { .. } => {
                Some("Check in_transaction() before changing transaction state")
            }
            _ => None,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Purely informational; nothing in this crate retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Engine { source, .. } => matches!(
                source.downcast_ref::<sqlx::Error>(),
                Some(sqlx::Error::PoolTimedOut | sqlx::Error::Io(_))
            ),
            _ => false,
        }
    }
}

/// Convert sqlx errors to DbError.
///
/// Connection-level failures become [`DbError::Connection`]; everything else
/// is kept verbatim as the source of an [`DbError::Engine`].
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::connection(
                msg.to_string(),
                "Check the connection string format and credentials",
            ),
            sqlx::Error::Io(io_err) => DbError::connection(
                format!("I/O error: {}", io_err),
                "Check that the database file or server is accessible",
            ),
            sqlx::Error::Tls(tls_err) => DbError::connection(
                format!("TLS error: {}", tls_err),
                "Verify TLS configuration and certificates",
            ),
            sqlx::Error::PoolClosed => {
                DbError::connection("Connection pool is closed", "Reconnect to the database")
            }
            sqlx::Error::ColumnNotFound(col) => DbError::column_not_found(col),
            other => DbError::engine("sql", other),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
