//! Connection pools and table gateways for the case sync engine.
//!
//! The engine talks to storage through [`Database`] and [`TableTransaction`];
//! this crate supplies the SQLite (`sqlite` feature) and Postgres (`postgres`
//! feature) implementations plus the pooling primitives they sit on.

mod error;
mod ident;
mod pool;

#[cfg(feature = "async")]
mod async_pool;
#[cfg(feature = "async")]
mod cancel;
#[cfg(feature = "async")]
mod gateway;
#[cfg(all(feature = "postgres", not(target_arch = "wasm32")))]
mod postgres;
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
mod sqlite;

pub use error::{DbError, DbResult};
pub use ident::{Ident, MAX_IDENT_LEN};
pub use pool::{AcquireError, Pool, Pooled};

#[cfg(feature = "async")]
pub use async_pool::{AsyncAcquireError, AsyncPool, AsyncPooled};
#[cfg(feature = "async")]
pub use cancel::CancelToken;
#[cfg(feature = "async")]
pub use gateway::{Backend, Database, TableTransaction};
#[cfg(all(feature = "postgres", not(target_arch = "wasm32")))]
pub use postgres::{PgConn, PgDatabase, PgPool, PgPoolConfig, PgSslMode};
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use sqlite::{SqliteConn, SqliteDatabase, sqlite_pool};
