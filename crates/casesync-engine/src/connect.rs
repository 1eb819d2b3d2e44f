//! Opens the configured database backend.

use std::sync::Arc;

use casesync_db::{Database, PgDatabase, PgPoolConfig, SqliteDatabase};

use crate::config::DatabaseConfig;

/// Builds the configured backend. Connections are opened on first use.
pub fn connect_database(config: &DatabaseConfig) -> Arc<dyn Database> {
    match config {
        DatabaseConfig::Sqlite { path, pool_size } => {
            tracing::info!(path = %path.display(), pool_size, "opening SQLite database");
            Arc::new(SqliteDatabase::open(path, *pool_size))
        }
        DatabaseConfig::Postgres {
            host,
            port,
            username,
            password,
            name,
            ssl_mode,
            pool_size,
        } => {
            tracing::info!(
                host = %host,
                port,
                database = %name,
                ?ssl_mode,
                pool_size,
                "using Postgres"
            );
            let mut pool_config =
                PgPoolConfig::from_parts(host, *port, username, password, name, *ssl_mode);
            pool_config.max_conns = *pool_size;
            Arc::new(PgDatabase::from_config(pool_config))
        }
    }
}
