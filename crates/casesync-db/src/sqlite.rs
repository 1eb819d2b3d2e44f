//! SQLite connector and table gateway.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{Connection, InterruptHandle, OpenFlags, OptionalExtension};
use sqlparser::ast::{ObjectName, Statement};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;
use tracing::{debug, warn};

use crate::{
    AcquireError, Backend, CancelToken, Database, DbError, DbResult, Ident, Pool, Pooled,
    TableTransaction,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteConn {
    conn: Connection,
}

impl SqliteConn {
    /// Opens `path` read-write, creating the file when it is missing.
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(path, flags)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

pub fn sqlite_pool(path: &Path, pool_size: usize) -> Arc<Pool<SqliteConn>> {
    let path = path.to_path_buf();
    Pool::new(pool_size, move || SqliteConn::open(&path))
}

/// [`Database`] over a pool of SQLite connections.
///
/// Statements run on tokio's blocking pool and are interrupted when the
/// transaction's cancel token fires.
pub struct SqliteDatabase {
    pool: Arc<Pool<SqliteConn>>,
    acquire_timeout: Duration,
}

impl SqliteDatabase {
    pub fn new(pool: Arc<Pool<SqliteConn>>) -> Self {
        Self {
            pool,
            acquire_timeout: DEFAULT_ACQUIRE_TIMEOUT,
        }
    }

    pub fn open(path: &Path, pool_size: usize) -> Self {
        Self::new(sqlite_pool(path, pool_size))
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    fn backend(&self) -> Backend {
        Backend::Sqlite
    }

    async fn begin(&self, cancel: Option<&CancelToken>) -> DbResult<Box<dyn TableTransaction>> {
        let pool = Arc::clone(&self.pool);
        let token = cancel.cloned();
        let timeout = self.acquire_timeout;
        let (open, interrupt) = tokio::task::spawn_blocking(move || {
            let conn = pool
                .acquire_with_cancel(Some(timeout), || {
                    token.as_ref().is_some_and(CancelToken::is_cancelled)
                })
                .map_err(acquire_error)?;
            let interrupt = Arc::new(conn.connection().get_interrupt_handle());
            Ok::<_, DbError>((OpenTransaction::begin(conn)?, interrupt))
        })
        .await
        .map_err(|err| DbError::connection(format!("begin task failed: {err}")))??;
        Ok(Box::new(SqliteTransaction {
            open: Some(open),
            interrupt,
            cancel: cancel.cloned(),
        }))
    }
}

fn acquire_error(err: AcquireError) -> DbError {
    match err {
        AcquireError::Cancelled => DbError::Cancelled,
        AcquireError::Timeout => DbError::connection("timed out waiting for a SQLite connection"),
        AcquireError::Create(message) => DbError::connection(message),
    }
}

/// A pooled connection inside `BEGIN IMMEDIATE`.
///
/// Rolls back when dropped unfinished, on whichever thread drops it. That
/// covers a blocking task whose caller stopped waiting for it.
struct OpenTransaction {
    conn: Option<Pooled<SqliteConn>>,
}

impl OpenTransaction {
    fn begin(conn: Pooled<SqliteConn>) -> DbResult<Self> {
        conn.connection()
            .execute_batch("BEGIN IMMEDIATE")
            .map_err(|err| DbError::statement("begin", err.to_string()))?;
        Ok(Self { conn: Some(conn) })
    }

    fn connection(&self) -> DbResult<&Connection> {
        self.conn
            .as_ref()
            .map(|conn| conn.connection())
            .ok_or_else(|| DbError::connection("transaction already finished"))
    }

    fn finish(&mut self, statement: &'static str) -> DbResult<()> {
        let Some(conn) = self.conn.take() else {
            return Err(DbError::connection("transaction already finished"));
        };
        // An interrupted write ends the transaction on its own.
        if statement == "ROLLBACK" && conn.connection().is_autocommit() {
            return Ok(());
        }
        match conn.connection().execute_batch(statement) {
            Ok(()) => Ok(()),
            Err(err) => {
                // The connection is left in an unknown transaction state.
                conn.discard();
                Err(DbError::statement("finish", err.to_string()))
            }
        }
    }
}

impl Drop for OpenTransaction {
    fn drop(&mut self) {
        if self.conn.is_some() {
            if let Err(err) = self.finish("ROLLBACK") {
                warn!(error = %err, "rollback of abandoned sqlite transaction failed");
            }
        }
    }
}

/// Interrupts the running statement unless disarmed.
struct InterruptOnDrop {
    handle: Option<Arc<InterruptHandle>>,
}

impl InterruptOnDrop {
    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!("interrupting sqlite statement");
            handle.interrupt();
        }
    }
}

struct SqliteTransaction {
    open: Option<OpenTransaction>,
    interrupt: Arc<InterruptHandle>,
    cancel: Option<CancelToken>,
}

impl SqliteTransaction {
    /// Runs `work` on the blocking pool, racing it against the cancel token.
    async fn run<R, F>(&mut self, operation: &'static str, work: F) -> DbResult<R>
    where
        F: FnOnce(&mut OpenTransaction) -> DbResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.run_with(operation, cancel, work).await
    }

    async fn run_with<R, F>(
        &mut self,
        operation: &'static str,
        cancel: Option<CancelToken>,
        work: F,
    ) -> DbResult<R>
    where
        F: FnOnce(&mut OpenTransaction) -> DbResult<R> + Send + 'static,
        R: Send + 'static,
    {
        if cancel.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(DbError::Cancelled);
        }
        let Some(mut open) = self.open.take() else {
            return Err(DbError::connection("transaction already finished"));
        };
        // Stopping early, by cancellation or by this future being dropped,
        // interrupts the statement. The abandoned task then drops `open`,
        // which rolls back.
        let guard = InterruptOnDrop {
            handle: Some(Arc::clone(&self.interrupt)),
        };
        let task = tokio::task::spawn_blocking(move || {
            let result = work(&mut open);
            (open, result)
        });
        let joined = tokio::select! {
            biased;
            _ = wait_cancelled(cancel) => return Err(DbError::Cancelled),
            joined = task => joined,
        };
        guard.disarm();
        let (open, result) =
            joined.map_err(|err| DbError::connection(format!("{operation} task failed: {err}")))?;
        self.open = Some(open);
        result
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }
}

async fn wait_cancelled(cancel: Option<CancelToken>) {
    match cancel {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

#[async_trait]
impl TableTransaction for SqliteTransaction {
    async fn table_exists(&mut self, table: &Ident) -> DbResult<bool> {
        let table = table.clone();
        self.run("table_exists", move |open| {
            let exists: i64 = open
                .connection()?
                .query_row(
                    "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
                    [table.as_str()],
                    |row| row.get(0),
                )
                .map_err(|err| DbError::statement("table_exists", err.to_string()))?;
            Ok(exists == 1)
        })
        .await
    }

    async fn columns(&mut self, table: &Ident) -> DbResult<Vec<Ident>> {
        let table = table.clone();
        self.run("columns", move |open| {
            let conn = open.connection()?;
            let mut stmt = conn
                .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
                .map_err(|err| DbError::statement("columns", err.to_string()))?;
            let names = stmt
                .query_map([table.as_str()], |row| row.get::<_, String>(0))
                .and_then(|rows| rows.collect::<Result<Vec<_>, _>>())
                .map_err(|err| DbError::statement("columns", err.to_string()))?;
            names.into_iter().map(Ident::new).collect()
        })
        .await
    }

    async fn clone_table_schema(&mut self, target: &Ident, source: &Ident) -> DbResult<()> {
        let (target, source) = (target.clone(), source.clone());
        self.run("clone_table_schema", move |open| {
            let conn = open.connection()?;
            let definition: Option<String> = conn
                .query_row(
                    "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    [source.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| DbError::statement("clone_table_schema", err.to_string()))?;
            let Some(definition) = definition else {
                return Err(DbError::TableNotFound {
                    table: source.to_string(),
                });
            };
            let ddl = rename_create_table(&definition, &target)?;
            debug!(target_table = %target, source_table = %source, "cloning sqlite table schema");
            conn.execute_batch(&ddl)
                .map_err(|err| DbError::statement("clone_table_schema", err.to_string()))
        })
        .await
    }

    async fn execute(&mut self, statement: &str) -> DbResult<u64> {
        let statement = statement.to_owned();
        self.run("execute", move |open| {
            let changed = open
                .connection()?
                .execute(&statement, [])
                .map_err(|err| DbError::statement("execute", err.to_string()))?;
            Ok(changed as u64)
        })
        .await
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        let mut this = self;
        if this.is_cancelled() {
            if this.open.is_some() {
                this.run_with("rollback", None, |open| open.finish("ROLLBACK"))
                    .await?;
            }
            return Err(DbError::Cancelled);
        }
        // Once started, a commit runs to completion.
        this.run_with("commit", None, |open| open.finish("COMMIT"))
            .await
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        let mut this = self;
        this.run_with("rollback", None, |open| open.finish("ROLLBACK"))
            .await
    }
}

/// Re-targets a stored `CREATE TABLE` statement at `target`.
fn rename_create_table(definition: &str, target: &Ident) -> DbResult<String> {
    let mut statements = Parser::parse_sql(&SQLiteDialect {}, definition)
        .map_err(|err| DbError::statement("clone_table_schema", err.to_string()))?;
    match statements.as_mut_slice() {
        [Statement::CreateTable(create)] => {
            create.name = ObjectName::from(vec![sqlparser::ast::Ident::with_quote(
                '"',
                target.as_str(),
            )]);
            Ok(create.to_string())
        }
        _ => Err(DbError::statement(
            "clone_table_schema",
            "stored table definition is not a single CREATE TABLE",
        )),
    }
}
