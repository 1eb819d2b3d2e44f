//! Error types for sync runs.

use casesync_db::DbError;

use crate::DirectoryError;

/// The result type used throughout the engine.
pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Settings derived from the environment were missing or malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required values from config: {}", quoted_list(.fields))]
    Missing { fields: Vec<String> },

    #[error("Invalid value for config: {key}={value} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Errors that can occur while running a sync.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The caller did not say which questionnaires to sync.
    #[error("Missing required values from request: {}", quoted_list(.fields))]
    Request { fields: Vec<String> },

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    /// The HTTP client for the directory could not be built.
    #[error("directory client unavailable: {source}")]
    Client {
        #[source]
        source: reqwest::Error,
    },

    /// No database connection could be opened.
    #[error("database unavailable: {source}")]
    Connection {
        #[source]
        source: DbError,
    },

    /// A derived table or column name failed identifier validation.
    #[error("invalid identifier for '{questionnaire}': {source}")]
    InvalidIdentifier {
        questionnaire: String,
        #[source]
        source: DbError,
    },

    /// A DDL or DML step failed; its transaction was rolled back.
    #[error("{operation} failed for '{questionnaire}': {source}")]
    Statement {
        questionnaire: String,
        operation: &'static str,
        #[source]
        source: DbError,
    },

    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Maps a database error raised while working on `questionnaire`.
    pub fn from_db(questionnaire: &str, operation: &'static str, source: DbError) -> Self {
        match source {
            DbError::Cancelled => Self::Cancelled,
            DbError::InvalidIdentifier { .. } => Self::InvalidIdentifier {
                questionnaire: questionnaire.to_string(),
                source,
            },
            DbError::Connection { .. } => Self::Connection { source },
            source => Self::Statement {
                questionnaire: questionnaire.to_string(),
                operation,
                source,
            },
        }
    }

    /// HTTP status reported to the trigger caller.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Config(_) | Self::Request { .. } => 400,
            Self::Directory(_)
            | Self::Client { .. }
            | Self::Connection { .. }
            | Self::InvalidIdentifier { .. }
            | Self::Statement { .. }
            | Self::Cancelled => 500,
        }
    }
}

fn quoted_list(fields: &[String]) -> String {
    let quoted: Vec<String> = fields.iter().map(|field| format!("'{field}'")).collect();
    format!("[{}]", quoted.join(", "))
}
