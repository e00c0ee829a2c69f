//! Transactional data-access and schema-evolution layer for Tessera.
//!
//! Provides a bounded connection pool (via `r2d2`), a statement executor
//! with log-safe diagnostics, row-level-security context propagation, a
//! transaction manager with explicit isolation levels, and a versioned
//! migration engine that brings the schema up to date at startup.
//!
//! # Design decisions
//!
//! - **Two engines, one surface**: PostgreSQL is the production engine;
//!   SQLite backs local development and the test-suite. Everything above
//!   [`driver`] sees only [`Statement`], [`Rows`] and [`Dialect`].
//! - **Explicit pool**: the pool is built once at startup and passed by
//!   value (it is a cheap clone). There is no global instance.
//! - **Connection-scoped state**: the RLS identity and any open
//!   transaction belong to the leased [`PoolConnection`] and are reset
//!   before it returns to the pool, including when it is dropped.
//! - **Directory migrations**: SQL files are read from a directory with an
//!   optional `manifest.toml`, applied once each and recorded in a ledger.

mod canned;
mod config;
pub mod driver;
mod error;
mod executor;
pub mod migrations;
mod pool;
mod probe;
mod rls;
pub mod sanitize;
mod transaction;
mod value;

#[cfg(test)]
mod testing;

pub use canned::{CannedExecutor, CANNED_COLUMN};
pub use config::{DatabaseConfig, Engine, Environment, UnknownVariant};
pub use driver::Dialect;
pub use error::{
    ConnectionError, DbError, ErrorDetails, ErrorPayload, QueryError, TransactionError,
    CONNECTION_ERROR, DATABASE_ERROR, INVALID_IDENTITY,
};
pub use executor::Executor;
pub use migrations::{run_migrations, MigrationError, MigrationReport, MigrationRunner};
pub use pool::{
    create_postgres_pool, create_sqlite_pool, ConnectionPool, PoolConnection, PoolSettings,
    PoolState,
};
pub use probe::{wait_for_database, RetryPolicy};
pub use rls::{set_context, with_context, Identity, IDENTITY_SETTING};
pub use transaction::{IsolationLevel, Transaction, TransactionManager, UnknownIsolationLevel};
pub use value::{Row, Rows, Statement, Value};
