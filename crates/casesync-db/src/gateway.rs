//! Storage seam between the sync engine and a concrete database.

use async_trait::async_trait;

use crate::{CancelToken, DbResult, Ident};

/// The concrete database behind a [`Database`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Sqlite,
    Postgres,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
        }
    }
}

/// Hands out transactions, one per unit of work.
#[async_trait]
pub trait Database: Send + Sync {
    fn backend(&self) -> Backend;

    /// Opens a transaction on a pooled connection.
    ///
    /// Waiting for a connection, and any statement run in the transaction,
    /// stops early with [`DbError::Cancelled`] once `cancel` fires.
    ///
    /// [`DbError::Cancelled`]: crate::DbError::Cancelled
    async fn begin(&self, cancel: Option<&CancelToken>) -> DbResult<Box<dyn TableTransaction>>;
}

/// An open transaction.
///
/// Dropping a transaction without calling [`commit`](Self::commit) rolls it
/// back.
#[async_trait]
pub trait TableTransaction: Send {
    async fn table_exists(&mut self, table: &Ident) -> DbResult<bool>;

    /// Column names of `table` in declaration order.
    async fn columns(&mut self, table: &Ident) -> DbResult<Vec<Ident>>;

    /// Creates `target` with the column definitions and keys of `source`.
    /// No rows are copied.
    async fn clone_table_schema(&mut self, target: &Ident, source: &Ident) -> DbResult<()>;

    /// Runs a statement and returns the affected row count.
    async fn execute(&mut self, statement: &str) -> DbResult<u64>;

    /// Commits, unless the token given to [`Database::begin`] has already
    /// fired; then the transaction rolls back and this returns
    /// [`DbError::Cancelled`](crate::DbError::Cancelled).
    async fn commit(self: Box<Self>) -> DbResult<()>;

    async fn rollback(self: Box<Self>) -> DbResult<()>;
}
