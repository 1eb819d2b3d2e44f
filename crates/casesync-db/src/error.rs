//! Error type shared by the pools and gateways.

/// Result alias for database operations.
pub type DbResult<T> = std::result::Result<T, DbError>;

/// Errors raised while acquiring connections or running statements.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A table or column name failed the identifier allow-list.
    #[error("invalid identifier '{name}': {reason}")]
    InvalidIdentifier {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// No connection could be obtained from the pool.
    #[error("connection unavailable: {message}")]
    Connection {
        /// Description of the acquire or connect failure.
        message: String,
    },

    /// A statement failed to execute.
    #[error("statement failed during {operation}: {message}")]
    Statement {
        /// The gateway operation that was running.
        operation: &'static str,
        /// Driver error text.
        message: String,
    },

    /// The source table needed for a schema clone does not exist.
    #[error("table not found: {table}")]
    TableNotFound {
        /// The missing table.
        table: String,
    },

    /// The caller cancelled while waiting on the database.
    #[error("database operation cancelled")]
    Cancelled,
}

impl DbError {
    /// Creates a statement error for the named operation.
    #[must_use]
    pub fn statement(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Statement {
            operation,
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }
}
