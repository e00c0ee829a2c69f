//! Connection pool creation and leasing.
//!
//! Both engines are pooled with `r2d2`. The pool is always passed around
//! explicitly; there is no process-wide instance.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use r2d2::event::{AcquireEvent, HandleEvent, ReleaseEvent, TimeoutEvent};
use r2d2::{HandleError, ManageConnection, Pool};
use postgres::config::Host;
use postgres::NoTls;
use r2d2_postgres::PostgresConnectionManager;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;

use crate::config::{DatabaseConfig, Engine};
use crate::driver::{sqlite, Dialect, DriverError, Session};
use crate::error::ConnectionError;
use crate::rls::{self, Identity};
use crate::value::{Rows, Statement};

/// Runtime tunables for the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum number of pooled connections.
    pub max_size: u32,

    /// How long `acquire` waits for a free connection before failing.
    pub acquire_timeout: Duration,

    /// Busy timeout for SQLite connections, in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 10,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout_ms: 5_000,
        }
    }
}

impl PoolSettings {
    /// Rejects values r2d2 would refuse to build a pool with.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` for a zero pool size or acquire timeout.
    pub fn validate(&self) -> Result<(), ConnectionError> {
        if self.max_size == 0 {
            return Err(ConnectionError::new("pool size must be at least 1"));
        }
        if self.acquire_timeout.is_zero() {
            return Err(ConnectionError::new("acquire timeout must be greater than zero"));
        }
        Ok(())
    }
}

impl From<&DatabaseConfig> for PoolSettings {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            max_size: config.pool_size,
            acquire_timeout: Duration::from_millis(config.acquire_timeout_ms),
            busy_timeout_ms: config.busy_timeout_ms,
        }
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    /// Physical connections currently open.
    pub connections: u32,
    /// Open connections not leased to anyone.
    pub idle_connections: u32,
    pub max_size: u32,
}

/// Source of leased sessions. Implemented by every `r2d2::Pool` whose
/// connections are [`Session`]s.
pub(crate) trait Checkout: Send + Sync {
    fn checkout(&self) -> Result<Box<dyn Session>, ConnectionError>;
    fn state(&self) -> PoolState;
}

impl<M> Checkout for Pool<M>
where
    M: ManageConnection,
    M::Connection: Session,
{
    fn checkout(&self) -> Result<Box<dyn Session>, ConnectionError> {
        let conn = self.get()?;
        Ok(Box::new(conn))
    }

    fn state(&self) -> PoolState {
        let state = Pool::state(self);
        PoolState {
            connections: state.connections,
            idle_connections: state.idle_connections,
            max_size: self.max_size(),
        }
    }
}

/// Wraps an r2d2 manager so a poisoned session is discarded on return
/// instead of going back to the idle set.
#[derive(Debug)]
struct DiscardPoisoned<M>(M);

impl<M: ManageConnection> ManageConnection for DiscardPoisoned<M> {
    type Connection = GuardedSession<M::Connection>;
    type Error = M::Error;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        self.0.connect().map(|inner| GuardedSession {
            inner,
            poisoned: false,
        })
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        self.0.is_valid(&mut conn.inner)
    }

    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        conn.poisoned || self.0.has_broken(&mut conn.inner)
    }
}

struct GuardedSession<C> {
    inner: C,
    poisoned: bool,
}

impl<C: Session> Session for GuardedSession<C> {
    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }

    fn run(&mut self, stmt: &Statement) -> Result<Rows, DriverError> {
        self.inner.run(stmt)
    }

    fn run_script(&mut self, sql: &str) -> Result<(), DriverError> {
        self.inner.run_script(sql)
    }

    fn is_closed(&self) -> bool {
        self.poisoned || self.inner.is_closed()
    }

    fn poison(&mut self) {
        self.poisoned = true;
    }
}

/// Logs physical connect and disconnect events. Never sees credentials.
#[derive(Debug)]
struct ConnectionEvents {
    engine: &'static str,
    endpoint: String,
}

impl HandleEvent for ConnectionEvents {
    fn handle_acquire(&self, event: AcquireEvent) {
        tracing::info!(
            engine = self.engine,
            endpoint = %self.endpoint,
            connection_id = event.connection_id(),
            "database connection opened"
        );
    }

    fn handle_release(&self, event: ReleaseEvent) {
        tracing::info!(
            engine = self.engine,
            endpoint = %self.endpoint,
            connection_id = event.connection_id(),
            age_ms = event.age().as_millis() as u64,
            "database connection closed"
        );
    }

    fn handle_timeout(&self, event: TimeoutEvent) {
        tracing::warn!(
            engine = self.engine,
            endpoint = %self.endpoint,
            timeout_ms = event.timeout().as_millis() as u64,
            "timed out waiting for a pooled connection"
        );
    }
}

/// Routes r2d2's background connection errors into tracing.
#[derive(Debug)]
struct ConnectErrors {
    engine: &'static str,
}

impl<E: fmt::Display> HandleError<E> for ConnectErrors {
    fn handle_error(&self, error: E) {
        tracing::warn!(engine = self.engine, error = %error, "database connection attempt failed");
    }
}

/// A bounded pool of engine sessions.
///
/// Cloning is cheap and every clone leases from the same set of connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<dyn Checkout>,
    dialect: Dialect,
    next_lease: Arc<AtomicU64>,
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("dialect", &self.dialect)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionPool {
    pub(crate) fn from_checkout(inner: Arc<dyn Checkout>, dialect: Dialect) -> Self {
        Self {
            inner,
            dialect,
            next_lease: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Builds the pool described by the configuration.
    ///
    /// PostgreSQL pools are built without connecting; use
    /// [`wait_for_database`](crate::wait_for_database) to probe them.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` if the pool settings are out of range or a
    /// SQLite pool cannot open its file.
    pub fn from_config(config: &DatabaseConfig) -> Result<Self, ConnectionError> {
        let settings = PoolSettings::from(config);
        match config.engine {
            Engine::Postgres => {
                let mut pg = postgres::Config::new();
                pg.host(&config.host)
                    .port(config.port)
                    .user(&config.user)
                    .password(&config.password)
                    .dbname(&config.name)
                    .application_name("tessera")
                    .connect_timeout(settings.acquire_timeout);
                create_postgres_pool(pg, settings)
            }
            Engine::Sqlite => create_sqlite_pool(&config.sqlite_path, settings),
        }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn state(&self) -> PoolState {
        self.inner.state()
    }

    /// Leases a connection, blocking while the pool is at capacity.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError` if no connection frees up within the
    /// acquire timeout or a new connection cannot be opened.
    pub fn acquire(&self) -> Result<PoolConnection, ConnectionError> {
        let started = Instant::now();
        let session = self.inner.checkout().inspect_err(|err| {
            tracing::warn!(error = %err, "failed to lease database connection");
        })?;
        let lease = self.next_lease.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            lease,
            wait_ms = started.elapsed().as_millis() as u64,
            "database connection leased"
        );

        Ok(PoolConnection {
            session,
            lease,
            identity: None,
            context_dirty: false,
            in_transaction: false,
        })
    }
}

/// Creates a PostgreSQL pool. No connection is opened until first use.
///
/// # Errors
///
/// Returns `ConnectionError` if the settings are out of range.
pub fn create_postgres_pool(
    config: postgres::Config,
    settings: PoolSettings,
) -> Result<ConnectionPool, ConnectionError> {
    settings.validate()?;

    let host = match config.get_hosts().first() {
        Some(Host::Tcp(name)) => name.clone(),
        Some(Host::Unix(path)) => path.display().to_string(),
        None => "localhost".to_string(),
    };
    let target = format!(
        "{}:{}/{}",
        host,
        config.get_ports().first().copied().unwrap_or(5432),
        config.get_dbname().unwrap_or_default()
    );

    tracing::info!(
        engine = "postgres",
        endpoint = %target,
        max_size = settings.max_size,
        "creating database connection pool"
    );

    let manager = DiscardPoisoned(PostgresConnectionManager::new(config, NoTls));
    let pool = Pool::builder()
        .max_size(settings.max_size)
        .min_idle(Some(0))
        .connection_timeout(settings.acquire_timeout)
        .event_handler(Box::new(ConnectionEvents {
            engine: "postgres",
            endpoint: target,
        }))
        .error_handler(Box::new(ConnectErrors { engine: "postgres" }))
        .build_unchecked(manager);

    Ok(ConnectionPool::from_checkout(Arc::new(pool), Dialect::Postgres))
}

/// Creates a SQLite pool with WAL mode, foreign keys and the session
/// variable functions enabled on every connection.
///
/// # Arguments
///
/// * `db_path` - Path to the SQLite database file. `:memory:` gives every
///   pooled connection its own private database.
///
/// # Errors
///
/// Returns `ConnectionError` if the settings are out of range or the
/// initial connections cannot be opened.
pub fn create_sqlite_pool(db_path: &str, settings: PoolSettings) -> Result<ConnectionPool, ConnectionError> {
    settings.validate()?;

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

    let manager = SqliteConnectionManager::file(db_path)
        .with_flags(flags)
        .with_init(move |conn| {
            conn.execute_batch(&format!(
                "PRAGMA busy_timeout = {};
                 PRAGMA foreign_keys = ON;",
                settings.busy_timeout_ms
            ))?;
            // In-memory databases report "memory", which is acceptable.
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
            if journal_mode != "wal" && journal_mode != "memory" {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                    Some(format!(
                        "failed to set WAL journal mode, got: {}",
                        journal_mode
                    )),
                ));
            }
            sqlite::install_session_functions(conn)
        });

    tracing::info!(
        engine = "sqlite",
        endpoint = db_path,
        max_size = settings.max_size,
        "creating database connection pool"
    );

    let pool = Pool::builder()
        .max_size(settings.max_size)
        .connection_timeout(settings.acquire_timeout)
        .event_handler(Box::new(ConnectionEvents {
            engine: "sqlite",
            endpoint: db_path.to_string(),
        }))
        .error_handler(Box::new(ConnectErrors { engine: "sqlite" }))
        .build(DiscardPoisoned(manager))?;

    Ok(ConnectionPool::from_checkout(Arc::new(pool), Dialect::Sqlite))
}

/// A leased session.
///
/// Owned exclusively by the borrower. [`release`](Self::release) consumes
/// the handle, and dropping it releases as well, so a connection goes back
/// to the pool exactly once. Before it does, any open transaction is rolled
/// back and any RLS identity is cleared: neither may leak to the next lease.
/// A session that cannot be reset is poisoned, and the pool closes it.
pub struct PoolConnection {
    session: Box<dyn Session>,
    lease: u64,
    identity: Option<Identity>,
    context_dirty: bool,
    in_transaction: bool,
}

impl fmt::Debug for PoolConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConnection")
            .field("lease", &self.lease)
            .field("identity", &self.identity)
            .field("in_transaction", &self.in_transaction)
            .finish()
    }
}

impl PoolConnection {
    pub fn lease_id(&self) -> u64 {
        self.lease
    }

    pub fn dialect(&self) -> Dialect {
        self.session.dialect()
    }

    /// The RLS identity established on this lease, if any.
    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Returns the connection to the pool.
    pub fn release(self) {
        drop(self);
    }

    pub(crate) fn session_mut(&mut self) -> &mut dyn Session {
        self.session.as_mut()
    }

    pub(crate) fn set_in_transaction(&mut self, open: bool) {
        self.in_transaction = open;
    }

    /// Marks the session variable as possibly assigned, before the
    /// assignment is attempted.
    pub(crate) fn mark_context_dirty(&mut self) {
        self.context_dirty = true;
    }

    pub(crate) fn set_identity(&mut self, identity: Identity) {
        self.identity = Some(identity);
    }
}

impl PoolConnection {
    fn rollback(&mut self) -> Result<Rows, DriverError> {
        let rollback = Statement::new(self.session.dialect().rollback());
        self.session.run(&rollback)
    }

    /// Clears the RLS identity. An aborted transaction the caller opened by
    /// hand blocks the clear, so on failure it rolls back and tries again.
    fn clear_context(&mut self) -> bool {
        let Err(err) = rls::clear_session(self.session.as_mut()) else {
            return true;
        };
        tracing::warn!(lease = self.lease, error = %err, "clearing rls context failed, rolling back and retrying");

        if let Err(err) = self.rollback() {
            tracing::debug!(lease = self.lease, error = %err, "rollback before retrying clear failed");
        }

        match rls::clear_session(self.session.as_mut()) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(lease = self.lease, error = %err, "failed to clear rls context on release");
                false
            }
        }
    }
}

impl Drop for PoolConnection {
    fn drop(&mut self) {
        if self.session.is_closed() {
            tracing::debug!(lease = self.lease, "closed database connection released");
            return;
        }

        let mut reset = true;

        if self.in_transaction {
            tracing::warn!(lease = self.lease, "releasing connection with open transaction, rolling back");
            if let Err(err) = self.rollback() {
                tracing::error!(lease = self.lease, error = %err, "rollback on release failed");
                reset = false;
            }
        }

        if self.context_dirty && !self.clear_context() {
            reset = false;
        }

        if !reset {
            tracing::error!(lease = self.lease, "discarding database connection that could not be reset");
            self.session.poison();
            return;
        }

        tracing::debug!(lease = self.lease, "database connection released");
    }
}
