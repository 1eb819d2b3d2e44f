//! Async Postgres connector and table gateway.

use std::future::Future;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rustls::{ClientConfig, RootCertStore};
use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, Config, Error as PgError, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, error, warn};

use crate::{
    AsyncAcquireError, AsyncPool, AsyncPooled, Backend, CancelToken, Database, DbError, DbResult,
    Ident, TableTransaction,
};

/// TLS negotiation policy for new connections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PgSslMode {
    Disable,
    #[default]
    Prefer,
    Require,
}

impl PgSslMode {
    fn to_driver(self) -> SslMode {
        match self {
            Self::Disable => SslMode::Disable,
            Self::Prefer => SslMode::Prefer,
            Self::Require => SslMode::Require,
        }
    }
}

impl FromStr for PgSslMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "disable" => Ok(Self::Disable),
            "prefer" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            other => Err(format!("unknown ssl mode '{other}'")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PgPoolConfig {
    pub pg: Config,
    pub max_conns: usize,
    pub max_idle: Option<Duration>,
    pub connect_timeout: Duration,
    pub query_timeout: Duration,
    pub max_wait: Duration,
    pub health_check_interval: Option<Duration>,
}

impl PgPoolConfig {
    pub fn new(pg: Config) -> Self {
        Self {
            pg,
            max_conns: 4,
            max_idle: Some(Duration::from_secs(600)),
            connect_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(300),
            max_wait: Duration::from_secs(5),
            health_check_interval: Some(Duration::from_secs(30)),
        }
    }

    pub fn from_parts(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        dbname: &str,
        ssl_mode: PgSslMode,
    ) -> Self {
        let mut pg = Config::new();
        pg.host(host)
            .port(port)
            .user(user)
            .password(password)
            .dbname(dbname)
            .ssl_mode(ssl_mode.to_driver());
        Self::new(pg)
    }
}

pub struct PgConn {
    client: Client,
    cancel_token: tokio_postgres::CancelToken,
    tls: PgTls,
    last_used: Mutex<Instant>,
}

#[derive(Clone)]
enum PgTls {
    None,
    Rustls(MakeRustlsConnect),
}

impl PgConn {
    async fn connect(config: &PgPoolConfig) -> Result<Self, String> {
        let mut pg_config = config.pg.clone();
        pg_config.connect_timeout(config.connect_timeout);
        let (client, tls) = match pg_config.get_ssl_mode() {
            SslMode::Disable => {
                let (client, connection) =
                    pg_config.connect(NoTls).await.map_err(|err| describe(&err))?;
                drive(connection);
                (client, PgTls::None)
            }
            _ => {
                let tls = build_tls_connector()?;
                let (client, connection) = pg_config
                    .connect(tls.clone())
                    .await
                    .map_err(|err| describe(&err))?;
                drive(connection);
                (client, PgTls::Rustls(tls))
            }
        };
        Ok(Self {
            cancel_token: client.cancel_token(),
            client,
            tls,
            last_used: Mutex::new(Instant::now()),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub async fn cancel_query(&self) -> Result<(), PgError> {
        send_cancel(self.cancel_token.clone(), self.tls.clone()).await
    }

    /// Asks the server to stop the running query without waiting for the reply.
    fn spawn_cancel_query(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let (token, tls) = (self.cancel_token.clone(), self.tls.clone());
        runtime.spawn(async move {
            if let Err(err) = send_cancel(token, tls).await {
                warn!(error = %err, "failed to cancel abandoned query");
            }
        });
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    pub fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub async fn ping(&self) -> Result<(), PgError> {
        self.client.simple_query("SELECT 1").await.map(|_| ())
    }
}

pub struct PgPool {
    config: Arc<PgPoolConfig>,
    pool: Arc<AsyncPool<PgConn>>,
}

impl PgPool {
    /// Connections are opened on first use.
    pub fn new(config: PgPoolConfig) -> Self {
        let config = Arc::new(config);
        let factory_config = Arc::clone(&config);
        let pool = AsyncPool::new(config.max_conns, move || {
            let config = Arc::clone(&factory_config);
            async move { PgConn::connect(&config).await }
        });
        Self { config, pool }
    }

    /// Checks out a connection, dropping ones that sat idle too long or fail a ping.
    pub async fn acquire(
        &self,
        cancel: Option<&CancelToken>,
    ) -> Result<AsyncPooled<PgConn>, AsyncAcquireError> {
        loop {
            let conn = self
                .pool
                .acquire(Some(self.config.max_wait), cancel)
                .await?;
            if self.still_usable(&conn).await {
                return Ok(conn);
            }
            debug!("replacing stale postgres connection");
            conn.discard();
        }
    }

    async fn still_usable(&self, conn: &PgConn) -> bool {
        let idle = conn.idle_for();
        if self.config.max_idle.is_some_and(|max_idle| idle > max_idle) {
            return false;
        }
        match self.config.health_check_interval {
            Some(interval) if idle > interval => match conn.ping().await {
                Ok(()) => {
                    conn.touch();
                    true
                }
                Err(err) => {
                    warn!(error = %err, "postgres health check failed");
                    false
                }
            },
            _ => true,
        }
    }

    pub fn config(&self) -> &PgPoolConfig {
        &self.config
    }
}

/// [`Database`] over a [`PgPool`].
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: PgPoolConfig) -> Self {
        Self::new(PgPool::new(config))
    }
}

#[async_trait]
impl Database for PgDatabase {
    fn backend(&self) -> Backend {
        Backend::Postgres
    }

    async fn begin(&self, cancel: Option<&CancelToken>) -> DbResult<Box<dyn TableTransaction>> {
        let conn = self.pool.acquire(cancel).await.map_err(|err| match err {
            AsyncAcquireError::Cancelled => DbError::Cancelled,
            AsyncAcquireError::Timeout => {
                DbError::connection("timed out waiting for a Postgres connection")
            }
            AsyncAcquireError::Create(message) => DbError::connection(message),
        })?;
        if let Err(err) = conn.client().batch_execute("BEGIN").await {
            conn.discard();
            return Err(DbError::statement("begin", describe(&err)));
        }
        Ok(Box::new(PgTransaction {
            conn: Some(conn),
            query_timeout: self.pool.config().query_timeout,
            cancel: cancel.cloned(),
        }))
    }
}

struct PgTransaction {
    conn: Option<AsyncPooled<PgConn>>,
    query_timeout: Duration,
    cancel: Option<CancelToken>,
}

impl PgTransaction {
    fn conn(&self) -> DbResult<&PgConn> {
        self.conn
            .as_deref()
            .ok_or_else(|| DbError::connection("transaction already finished"))
    }

    async fn timed<T, F>(&self, operation: &'static str, fut: F) -> DbResult<T>
    where
        F: Future<Output = Result<T, PgError>> + Send,
    {
        let conn = self.conn()?;
        let cancelled = async {
            match &self.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            biased;
            _ = cancelled => {
                if let Err(err) = conn.cancel_query().await {
                    warn!(error = %err, operation, "failed to cancel query");
                }
                Err(DbError::Cancelled)
            }
            result = tokio::time::timeout(self.query_timeout, fut) => match result {
                Ok(result) => result.map_err(|err| DbError::statement(operation, describe(&err))),
                Err(_) => {
                    if let Err(err) = conn.cancel_query().await {
                        warn!(error = %err, operation, "failed to cancel timed out query");
                    }
                    Err(DbError::statement(operation, "query timed out"))
                }
            },
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    async fn finish(&mut self, statement: &'static str) -> DbResult<()> {
        // The connection stays in `self` until the server answers, so a
        // dropped future discards it instead of returning it to the pool.
        let result = self.conn()?.client().batch_execute(statement).await;
        let Some(conn) = self.conn.take() else {
            return Err(DbError::connection("transaction already finished"));
        };
        match result {
            Ok(()) => {
                conn.touch();
                Ok(())
            }
            Err(err) => {
                conn.discard();
                Err(DbError::statement("finish", describe(&err)))
            }
        }
    }
}

#[async_trait]
impl TableTransaction for PgTransaction {
    async fn table_exists(&mut self, table: &Ident) -> DbResult<bool> {
        let client = self.conn()?.client();
        let name = table.as_str();
        let row = self
            .timed(
                "table_exists",
                client.query_one(
                    "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                     WHERE table_schema = current_schema() AND table_name::text = $1)",
                    &[&name],
                ),
            )
            .await?;
        row.try_get::<_, bool>(0)
            .map_err(|err| DbError::statement("table_exists", err.to_string()))
    }

    async fn columns(&mut self, table: &Ident) -> DbResult<Vec<Ident>> {
        let client = self.conn()?.client();
        let name = table.as_str();
        let rows = self
            .timed(
                "columns",
                client.query(
                    "SELECT column_name::text FROM information_schema.columns \
                     WHERE table_schema = current_schema() AND table_name::text = $1 \
                     ORDER BY ordinal_position",
                    &[&name],
                ),
            )
            .await?;
        rows.iter()
            .map(|row| {
                row.try_get::<_, String>(0)
                    .map_err(|err| DbError::statement("columns", err.to_string()))
                    .and_then(Ident::new)
            })
            .collect()
    }

    async fn clone_table_schema(&mut self, target: &Ident, source: &Ident) -> DbResult<()> {
        if !self.table_exists(source).await? {
            return Err(DbError::TableNotFound {
                table: source.to_string(),
            });
        }
        let ddl = format!(
            "CREATE TABLE {} (LIKE {} INCLUDING ALL)",
            target.quoted(),
            source.quoted()
        );
        debug!(target_table = %target, source_table = %source, "cloning postgres table schema");
        let client = self.conn()?.client();
        self.timed("clone_table_schema", client.batch_execute(&ddl))
            .await
    }

    async fn execute(&mut self, statement: &str) -> DbResult<u64> {
        let client = self.conn()?.client();
        self.timed("execute", client.execute(statement, &[])).await
    }

    async fn commit(self: Box<Self>) -> DbResult<()> {
        let mut this = self;
        if this.is_cancelled() {
            this.finish("ROLLBACK").await?;
            return Err(DbError::Cancelled);
        }
        this.finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> DbResult<()> {
        let mut this = self;
        this.finish("ROLLBACK").await
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        // Closing the connection makes the server abort the open transaction.
        if let Some(conn) = self.conn.take() {
            warn!("discarding connection with an unfinished transaction");
            conn.spawn_cancel_query();
            conn.discard();
        }
    }
}

async fn send_cancel(token: tokio_postgres::CancelToken, tls: PgTls) -> Result<(), PgError> {
    match tls {
        PgTls::None => token.cancel_query(NoTls).await,
        PgTls::Rustls(tls) => token.cancel_query(tls).await,
    }
}

/// Runs the connection task that drives a client's socket.
fn drive<C>(connection: C)
where
    C: Future<Output = Result<(), PgError>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            error!(error = %err, "postgres connection error");
        }
    });
}

// Prefers the server's message over the driver's generic "db error".
fn describe(err: &PgError) -> String {
    match err.as_db_error() {
        Some(db) => format!("{} ({})", db.message(), db.code().code()),
        None => err.to_string(),
    }
}

fn build_tls_connector() -> Result<MakeRustlsConnect, String> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        warn!(error = %err, "failed to load a native root certificate");
    }
    for cert in native.certs {
        roots.add(cert).map_err(|err| err.to_string())?;
    }
    if roots.is_empty() {
        return Err("no root certificates available for TLS".to_string());
    }
    let tls_config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(MakeRustlsConnect::new(tls_config))
}
